use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};

use crate::config::EngineTimeouts;
use crate::error::{EngineError, EngineResult};
use crate::spec::SandboxSpec;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle {
    id: String,
    name: String,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(12);
        self.id.get(..end).unwrap_or(&self.id)
    }
}

impl fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.short_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxStatus {
    pub id: String,
    pub name: String,
    pub status: String,
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SandboxStats {
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub cpu_percent: f64,
    pub storage_used_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Window control for the terminal an exec runs under.
pub trait TerminalControl: Send + Sync {
    fn resize(&self, size: TerminalSize) -> io::Result<()>;
}

/// Live interactive process inside a sandbox, attached to a terminal.
pub struct ExecStream {
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub exit: oneshot::Receiver<i64>,
    pub terminal: Box<dyn TerminalControl>,
    pub kill: KillGuard,
}

impl fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecStream").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct KillGuard(Option<oneshot::Sender<()>>);

impl KillGuard {
    pub fn new(kill: oneshot::Sender<()>) -> Self {
        Self(Some(kill))
    }
}

impl Drop for KillGuard {
    fn drop(&mut self) {
        if let Some(kill) = self.0.take() {
            let _ = kill.send(());
        }
    }
}

/// Raw container runtime operations, unbounded; [`EngineClient`] adds timeouts.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn ping(&self) -> EngineResult<()>;

    async fn create(&self, spec: &SandboxSpec) -> EngineResult<SandboxHandle>;

    async fn start(&self, target: &str) -> EngineResult<()>;

    async fn exec_interactive(&self, target: &str, command: &[String]) -> EngineResult<ExecStream>;

    async fn inspect(&self, target: &str) -> EngineResult<SandboxStatus>;

    async fn stats(&self, target: &str, storage_path: &str) -> EngineResult<SandboxStats>;

    async fn stop(&self, target: &str, grace: Duration) -> EngineResult<()>;

    async fn remove(&self, target: &str) -> EngineResult<()>;
}

#[derive(Clone)]
pub struct EngineClient {
    engine: Arc<dyn Engine>,
    timeouts: EngineTimeouts,
}

impl EngineClient {
    pub fn new(engine: Arc<dyn Engine>, timeouts: EngineTimeouts) -> Self {
        Self { engine, timeouts }
    }

    pub fn timeouts(&self) -> EngineTimeouts {
        self.timeouts
    }

    pub async fn probe(&self) -> EngineResult<()> {
        match bounded("ping", self.timeouts.operation, self.engine.ping()).await {
            Err(EngineError::Timeout { .. }) => Err(EngineError::Unavailable(
                "engine did not answer ping in time".to_owned(),
            )),
            other => other,
        }
    }

    pub async fn create(&self, spec: &SandboxSpec) -> EngineResult<SandboxHandle> {
        bounded("create", self.timeouts.provision, self.engine.create(spec)).await
    }

    pub async fn start(&self, handle: &SandboxHandle) -> EngineResult<()> {
        bounded("start", self.timeouts.provision, self.engine.start(handle.id())).await
    }

    pub async fn exec_interactive(
        &self,
        handle: &SandboxHandle,
        command: &[String],
    ) -> EngineResult<ExecStream> {
        bounded(
            "exec",
            self.timeouts.operation,
            self.engine.exec_interactive(handle.id(), command),
        )
        .await
    }

    pub async fn inspect(&self, target: &str) -> EngineResult<SandboxStatus> {
        bounded("inspect", self.timeouts.operation, self.engine.inspect(target)).await
    }

    pub async fn stats(
        &self,
        handle: &SandboxHandle,
        storage_path: &str,
    ) -> EngineResult<SandboxStats> {
        bounded(
            "stats",
            self.timeouts.operation,
            self.engine.stats(handle.id(), storage_path),
        )
        .await
    }

    /// Stops the sandbox. A sandbox that no longer exists counts as stopped.
    pub async fn stop(&self, handle: &SandboxHandle) -> EngineResult<()> {
        self.stop_by_name(handle.id()).await
    }

    pub async fn stop_by_name(&self, target: &str) -> EngineResult<()> {
        // The engine may legitimately spend the whole stop grace waiting.
        let limit = self.timeouts.operation + self.timeouts.stop;
        tolerate_not_found(
            bounded("stop", limit, self.engine.stop(target, self.timeouts.stop)).await,
        )
    }

    /// Removes the sandbox. Already gone counts as removed.
    pub async fn remove(&self, handle: &SandboxHandle) -> EngineResult<()> {
        self.remove_by_name(handle.id()).await
    }

    pub async fn remove_by_name(&self, target: &str) -> EngineResult<()> {
        tolerate_not_found(
            bounded("remove", self.timeouts.operation, self.engine.remove(target)).await,
        )
    }
}

impl fmt::Debug for EngineClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineClient")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    future: impl Future<Output = EngineResult<T>>,
) -> EngineResult<T> {
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout {
            operation,
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

fn tolerate_not_found(result: EngineResult<()>) -> EngineResult<()> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}
