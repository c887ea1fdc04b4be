use std::collections::BTreeMap;

use crate::config::SandboxPolicy;
use crate::engine::EngineClient;
use crate::error::EngineResult;
use crate::session::SessionId;

pub const SESSION_LABEL: &str = "webshell.session";
pub const MANAGED_LABEL: &str = "webshell.managed";

/// Everything the engine needs to create one sandbox. Built once per
/// session and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    name: String,
    image: String,
    memory_limit_bytes: u64,
    cpu_share: f64,
    storage_limit_bytes: u64,
    storage_path: String,
    command: Vec<String>,
    shell: Vec<String>,
    labels: BTreeMap<String, String>,
}

impl SandboxSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    pub fn cpu_share(&self) -> f64 {
        self.cpu_share
    }

    pub fn storage_limit_bytes(&self) -> u64 {
        self.storage_limit_bytes
    }

    pub fn storage_path(&self) -> &str {
        &self.storage_path
    }

    /// Entry command of the sandbox's main process.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Command run for each interactive attach.
    pub fn shell(&self) -> &[String] {
        &self.shell
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// CFS quota for the given period, e.g. 50_000 of 100_000 for half a core.
    pub fn cpu_quota(&self, period: u64) -> u64 {
        ((period as f64) * self.cpu_share).round().max(1.0) as u64
    }
}

#[derive(Debug, Clone)]
pub struct SandboxSpecBuilder {
    policy: SandboxPolicy,
}

impl SandboxSpecBuilder {
    pub fn new(policy: SandboxPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn sandbox_name(&self, session_id: &SessionId) -> String {
        format!("{}-{}", self.policy.name_prefix, session_id.simple())
    }

    pub fn build(&self, session_id: &SessionId) -> SandboxSpec {
        let mut labels = BTreeMap::new();
        labels.insert(SESSION_LABEL.to_owned(), session_id.to_string());
        labels.insert(MANAGED_LABEL.to_owned(), "true".to_owned());
        SandboxSpec {
            name: self.sandbox_name(session_id),
            image: self.policy.image.clone(),
            memory_limit_bytes: self.policy.memory_limit_bytes,
            cpu_share: self.policy.cpu_share,
            storage_limit_bytes: self.policy.storage_limit_bytes,
            storage_path: self.policy.storage_path.clone(),
            command: self.policy.entry_command.clone(),
            shell: self.policy.shell_command.clone(),
            labels,
        }
    }
}

/// Removes a leftover sandbox that holds `name`, so the following create
/// cannot collide with it. Returns whether anything was removed.
pub async fn clear_stale(engine: &EngineClient, name: &str) -> EngineResult<bool> {
    let status = match engine.inspect(name).await {
        Ok(status) => status,
        Err(err) if err.is_not_found() => return Ok(false),
        Err(err) => return Err(err),
    };
    tracing::info!(sandbox = name, status = %status.status, "removing stale sandbox");
    if status.running {
        engine.stop_by_name(name).await?;
    }
    engine.remove_by_name(name).await?;
    Ok(true)
}
