use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::{SessionOptions, ShellConfig};
use crate::docker::DockerCli;
use crate::engine::EngineClient;
use crate::error::RegistryError;
use crate::session::{Session, SessionId, SessionInfo, SessionState};
use crate::spec::{SandboxSpec, SandboxSpecBuilder};
use crate::transport::DuplexTransport;

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct SandboxSummary {
    pub name: String,
    pub image: String,
    pub memory_limit: u64,
    pub cpu_share: f64,
    pub storage_limit: u64,
    pub storage_path: String,
}

impl From<&SandboxSpec> for SandboxSummary {
    fn from(spec: &SandboxSpec) -> Self {
        Self {
            name: spec.name().to_owned(),
            image: spec.image().to_owned(),
            memory_limit: spec.memory_limit_bytes(),
            cpu_share: spec.cpu_share(),
            storage_limit: spec.storage_limit_bytes(),
            storage_path: spec.storage_path().to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCreated {
    pub session_id: SessionId,
    pub sandbox: SandboxSummary,
}

struct RegistryInner {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    tasks: Mutex<JoinSet<()>>,
    shutting_down: AtomicBool,
    engine: EngineClient,
    builder: SandboxSpecBuilder,
    options: SessionOptions,
    max_sessions: usize,
}

/// Table of live sessions for networked mode. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(engine: EngineClient, config: &ShellConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                tasks: Mutex::new(JoinSet::new()),
                shutting_down: AtomicBool::new(false),
                engine,
                builder: SandboxSpecBuilder::new(config.policy.clone()),
                options: config.session,
                max_sessions: config.max_sessions.max(1),
            }),
        }
    }

    pub fn from_config(config: &ShellConfig) -> Self {
        let engine = EngineClient::new(
            Arc::new(DockerCli::new(config.docker_bin.clone())),
            config.timeouts,
        );
        Self::new(engine, config)
    }

    pub fn engine(&self) -> &EngineClient {
        &self.inner.engine
    }

    /// Registers a new session and provisions it in the background.
    pub async fn create(&self) -> Result<SessionCreated, RegistryError> {
        self.admit()?;
        self.inner.engine.probe().await?;

        let id = Uuid::new_v4();
        let spec = self.inner.builder.build(&id);
        let summary = SandboxSummary::from(&spec);
        let session = Arc::new(Session::new(
            id,
            spec,
            self.inner.engine.clone(),
            self.inner.options,
        ));
        {
            let mut sessions = lock(&self.inner.sessions);
            self.admit_locked(&sessions)?;
            sessions.insert(id, session.clone());
        }
        let registry = Arc::downgrade(&self.inner);
        session.on_release(move || {
            if let Some(inner) = registry.upgrade() {
                lock(&inner.sessions).remove(&id);
            }
        });
        tracing::info!(session_id = %id, sandbox = %summary.name, "session registered");

        let attach_timeout = self.inner.options.attach_timeout;
        self.spawn(async move {
            if session.provision().await.is_err() {
                return;
            }
            if !session.wait_claimed(attach_timeout).await {
                tracing::info!(session_id = %session.id(), "no caller attached in time; stopping");
                session.stop().await;
            }
        });
        Ok(SessionCreated {
            session_id: id,
            sandbox: summary,
        })
    }

    /// Binds `transport` as the session's single caller channel.
    pub async fn attach_channel<T: DuplexTransport>(
        &self,
        id: SessionId,
        transport: T,
    ) -> Result<(), RegistryError> {
        let session = self.session(id).ok_or(RegistryError::NotFound(id))?;
        if matches!(
            session.state(),
            SessionState::Draining | SessionState::Terminated | SessionState::Failed
        ) {
            return Err(RegistryError::NotRunning(id));
        }
        if !session.claim_channel() {
            return Err(RegistryError::AlreadyAttached(id));
        }
        if let Err(err) = session.wait_until_ready(self.inner.options.attach_timeout).await {
            tracing::info!(session_id = %id, error = %err, "attach rejected");
            let failure = session.failure();
            let stopping = session.clone();
            self.spawn(async move { stopping.stop().await });
            return Err(match failure {
                Some(err) => RegistryError::Engine(err),
                None => RegistryError::NotRunning(id),
            });
        }
        self.spawn(async move {
            if let Err(err) = session.attach(transport).await {
                tracing::warn!(session_id = %session.id(), error = %err, "attach failed");
            }
        });
        Ok(())
    }

    pub async fn info(&self, id: SessionId) -> Result<SessionInfo, RegistryError> {
        let session = self.session(id).ok_or(RegistryError::NotFound(id))?;
        Ok(session.info().await)
    }

    /// Stops the session if it exists. Unknown ids are already terminated.
    pub async fn terminate(&self, id: SessionId) -> Result<(), RegistryError> {
        if let Some(session) = self.session(id) {
            tracing::info!(session_id = %id, "terminating session");
            session.stop().await;
        }
        Ok(())
    }

    /// Rejects new sessions, stops every live one, then joins session tasks.
    pub async fn shutdown_all(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let sessions: Vec<Arc<Session>> = lock(&self.inner.sessions).values().cloned().collect();
        tracing::info!(count = sessions.len(), "stopping all sessions");

        let mut stops = JoinSet::new();
        for session in sessions {
            stops.spawn(async move { session.stop().await });
        }
        while stops.join_next().await.is_some() {}

        let mut tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        let joined = tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            tracing::warn!("session tasks still running at shutdown; aborting");
            tasks.abort_all();
        }
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        lock(&self.inner.sessions).get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<SessionId> {
        lock(&self.inner.sessions).keys().copied().collect()
    }

    fn admit(&self) -> Result<(), RegistryError> {
        let sessions = lock(&self.inner.sessions);
        self.admit_locked(&sessions)
    }

    fn admit_locked(&self, sessions: &HashMap<SessionId, Arc<Session>>) -> Result<(), RegistryError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(RegistryError::ShuttingDown);
        }
        if sessions.len() >= self.inner.max_sessions {
            return Err(RegistryError::Overloaded {
                max: self.inner.max_sessions,
            });
        }
        Ok(())
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = lock(&self.inner.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
