#[path = "server_integration/agent_gateway.rs"]
mod agent_gateway;
#[path = "server_integration/agent_protocol.rs"]
mod agent_protocol;
#[path = "server_integration/agent_runtime.rs"]
mod agent_runtime;
#[path = "server_integration/scheduling.rs"]
mod scheduling;
#[path = "server_integration/support.rs"]
mod support;
