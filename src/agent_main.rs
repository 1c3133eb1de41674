use baihu::agentd::cli::{self, AgentArgs};
use clap::Parser;

#[tokio::main]
async fn main() {
    let args = AgentArgs::parse();
    let code = cli::run(args).await;
    std::process::exit(code);
}
