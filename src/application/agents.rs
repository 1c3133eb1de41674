use crate::{
    application::state::SharedState,
    domain::{
        error::{DomainError, TokenFailure},
        models::{AgentRecord, AgentTaskView, EnrollTokenRecord, TaskResultReport},
    },
    protocol::{self, HeartbeatAckPayload, HeartbeatPayload},
    security::token,
    storage::{agent_store::AgentFacts, now_unix_ms},
};

/// Agents with no heartbeat for this long are considered offline.
pub const AGENT_IDLE_CUTOFF_MS: i64 = 2 * 60 * 1_000;

#[derive(Debug)]
pub struct Registration {
    pub agent: AgentRecord,
    pub is_new: bool,
}

impl SharedState {
    // ===== enrollment tokens =====

    pub async fn create_enroll_token(
        &self,
        remark: &str,
        max_uses: i64,
        expires_at_ms: Option<i64>,
    ) -> Result<EnrollTokenRecord, DomainError> {
        let value = token::generate_token();
        let record = self
            .store()
            .insert_enroll_token(&value, remark, max_uses, expires_at_ms)
            .await?;
        tracing::info!(
            "enrollment token created: {}... (max_uses={max_uses})",
            &record.token[..8]
        );
        Ok(record)
    }

    /// Checks existence, enabled flag, use budget, and expiry, in that
    /// order.
    pub async fn validate_enroll_token(
        &self,
        value: &str,
    ) -> Result<EnrollTokenRecord, DomainError> {
        let Some(record) = self.store().get_enroll_token(value).await? else {
            return Err(DomainError::TokenRejected(TokenFailure::Unknown));
        };
        if !record.enabled {
            return Err(DomainError::TokenRejected(TokenFailure::Disabled));
        }
        if record.max_uses > 0 && record.used_count >= record.max_uses {
            return Err(DomainError::TokenRejected(TokenFailure::Exhausted));
        }
        if record
            .expires_at_ms
            .is_some_and(|expires| expires < now_unix_ms())
        {
            return Err(DomainError::TokenRejected(TokenFailure::Expired));
        }
        Ok(record)
    }

    // ===== agent registry =====

    /// First-contact path: validates the enrollment token, then either
    /// reuses the agent already bound to this machine identity or creates a
    /// fresh record. One token use is consumed either way.
    pub async fn register_agent_by_token(
        &self,
        token_value: &str,
        machine_id: &str,
        ip: &str,
    ) -> Result<Registration, DomainError> {
        let enroll = self.validate_enroll_token(token_value).await?;

        if let Some(existing) = self.store().get_agent_by_machine_id(machine_id).await? {
            // Reuse: the known machine takes over the presented token so
            // later connects resolve directly.
            self.store()
                .rebind_agent(existing.id, token_value, ip)
                .await?;
            let _ = self.store().consume_enroll_token(enroll.id).await?;
            tracing::info!(
                "agent #{} reused via machine id {}...",
                existing.id,
                &machine_id[..machine_id.len().min(8)]
            );
            let agent = self
                .store()
                .get_agent(existing.id)
                .await?
                .ok_or_else(|| DomainError::NotFound(format!("agent not found: {}", existing.id)))?;
            return Ok(Registration {
                agent,
                is_new: false,
            });
        }

        // Fresh agents get their own auth token; the enrollment secret
        // stays a bootstrap credential, it does not become the identity.
        let name = format!("agent-{}", now_unix_ms() / 1_000);
        let agent = self
            .store()
            .insert_agent(&name, &token::generate_token(), machine_id, ip)
            .await?;
        let _ = self.store().consume_enroll_token(enroll.id).await?;
        tracing::info!("agent #{} registered from {ip}", agent.id);
        Ok(Registration {
            agent,
            is_new: true,
        })
    }

    /// Locates the agent for an incoming connection: direct token match
    /// first, enrollment as the fallback.
    pub async fn resolve_agent_for_connect(
        &self,
        token_value: &str,
        machine_id: &str,
        ip: &str,
    ) -> Result<Registration, DomainError> {
        if let Some(agent) = self.store().get_agent_by_token(token_value).await? {
            return Ok(Registration {
                agent,
                is_new: false,
            });
        }
        self.register_agent_by_token(token_value, machine_id, ip)
            .await
    }

    /// Auth for the HTTP fallback endpoints: direct token match, then a
    /// machine-id lookup gated on the presented value still being a valid
    /// enrollment token.
    pub async fn resolve_agent_for_http(
        &self,
        token_value: &str,
        machine_id: &str,
    ) -> Result<AgentRecord, DomainError> {
        if let Some(agent) = self.store().get_agent_by_token(token_value).await? {
            return Ok(agent);
        }
        if !machine_id.is_empty() {
            self.validate_enroll_token(token_value).await?;
            if let Some(agent) = self.store().get_agent_by_machine_id(machine_id).await? {
                return Ok(agent);
            }
        }
        Err(DomainError::TokenRejected(TokenFailure::Unknown))
    }

    /// Merges heartbeat facts and marks the agent online. Disabled agents
    /// are refused.
    pub async fn agent_heartbeat(
        &self,
        agent_id: i64,
        ip: &str,
        payload: &HeartbeatPayload,
    ) -> Result<AgentRecord, DomainError> {
        let Some(agent) = self.store().get_agent(agent_id).await? else {
            return Err(DomainError::NotFound(format!("agent not found: {agent_id}")));
        };
        if !agent.enabled {
            return Err(DomainError::AgentDisabled);
        }

        self.store()
            .touch_agent(
                agent_id,
                &AgentFacts {
                    ip: ip.to_owned(),
                    version: payload.version.clone(),
                    build_time: payload.build_time.clone(),
                    hostname: payload.hostname.clone(),
                    os: payload.os.clone(),
                    arch: payload.arch.clone(),
                },
            )
            .await?;

        self.store()
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("agent not found: {agent_id}")))
    }

    /// Builds the heartbeat ack. A delivered force-update flag is cleared
    /// atomically so it fires exactly once.
    pub async fn heartbeat_ack(
        &self,
        agent: &AgentRecord,
        client_version: &str,
    ) -> Result<HeartbeatAckPayload, DomainError> {
        let latest = self.latest_agent_version().await;
        let need_update =
            !latest.is_empty() && !client_version.is_empty() && client_version != latest;

        let force_update = if need_update {
            self.store().take_agent_force_update(agent.id).await?
        } else {
            self.store()
                .get_agent(agent.id)
                .await?
                .is_some_and(|record| record.force_update)
        };

        Ok(HeartbeatAckPayload {
            agent_id: agent.id,
            name: agent.name.clone(),
            need_update,
            force_update,
            latest_version: latest,
        })
    }

    /// First line of `version.txt` in the bundle directory, empty when no
    /// release is published.
    pub async fn latest_agent_version(&self) -> String {
        let path = self.config().agent_dir.join("version.txt");
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => text.lines().next().unwrap_or("").trim().to_owned(),
            Err(_) => String::new(),
        }
    }

    /// User-facing metadata update. A flipped enabled flag is pushed to the
    /// live connection: disable clears the agent's schedule, enable makes
    /// it reload.
    pub async fn update_agent(
        &self,
        agent_id: i64,
        name: &str,
        description: &str,
        enabled: bool,
    ) -> Result<(), DomainError> {
        let Some(before) = self.store().get_agent(agent_id).await? else {
            return Err(DomainError::NotFound(format!("agent not found: {agent_id}")));
        };
        self.store()
            .update_agent_meta(agent_id, name, description, enabled)
            .await?;

        if before.enabled != enabled {
            if enabled {
                self.send_frame_to_agent(agent_id, protocol::encode_empty_frame(protocol::TYPE_ENABLED))
                    .await;
                self.push_tasks_to_agent(agent_id).await?;
            } else {
                self.send_frame_to_agent(
                    agent_id,
                    protocol::encode_empty_frame(protocol::TYPE_DISABLED),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Refused while tasks still reference the agent.
    pub async fn delete_agent(&self, agent_id: i64) -> Result<(), DomainError> {
        let bound = self.store().count_agent_tasks(agent_id).await?;
        if bound > 0 {
            return Err(DomainError::InvalidRequest(format!(
                "agent #{agent_id} still has {bound} bound tasks"
            )));
        }
        if !self.store().remove_agent(agent_id).await? {
            return Err(DomainError::NotFound(format!("agent not found: {agent_id}")));
        }
        Ok(())
    }

    pub async fn set_agent_force_update(&self, agent_id: i64) -> Result<(), DomainError> {
        self.store().set_agent_force_update(agent_id, true).await
    }

    pub async fn clear_agent_force_update(&self, agent_id: i64) -> Result<(), DomainError> {
        self.store().set_agent_force_update(agent_id, false).await
    }

    pub async fn push_agent_update(&self, agent_id: i64) -> bool {
        self.send_frame_to_agent(agent_id, protocol::encode_empty_frame(protocol::TYPE_UPDATE))
            .await
    }

    pub async fn sweep_offline_agents(&self) -> Result<u64, DomainError> {
        let cutoff = now_unix_ms() - AGENT_IDLE_CUTOFF_MS;
        self.store().sweep_offline_agents(cutoff).await
    }

    pub async fn agent_task_views(&self, agent_id: i64) -> Result<Vec<AgentTaskView>, DomainError> {
        Ok(self
            .store()
            .list_agent_tasks(agent_id)
            .await?
            .iter()
            .map(AgentTaskView::from_task)
            .collect())
    }

    /// Persists an agent-reported result through the same pipeline as a
    /// local execution. Results for tasks not bound to the reporting agent
    /// are rejected.
    pub async fn report_agent_result(
        &self,
        agent: &AgentRecord,
        report: TaskResultReport,
    ) -> Result<i64, DomainError> {
        if !agent.enabled {
            return Err(DomainError::AgentDisabled);
        }

        let Some(task) = self.store().get_task(report.task_id).await? else {
            return Err(DomainError::NotFound(format!(
                "task not found: {}",
                report.task_id
            )));
        };
        if task.agent_id != Some(agent.id) {
            return Err(DomainError::InvalidRequest(format!(
                "task #{} is not bound to agent #{}",
                report.task_id, agent.id
            )));
        }

        let result = report.into_execution_result(agent.id);
        crate::application::pipeline::process_result(self, result).await
    }
}
