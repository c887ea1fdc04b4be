use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::SessionOptions;
use crate::engine::{EngineClient, SandboxHandle, SandboxStats};
use crate::error::{EngineError, SessionError};
use crate::relay::{self, RelayControl, RelayOutcome, RelaySignals};
use crate::spec::{self, SandboxSpec};
use crate::transport::{CallerSink, DuplexTransport, StatusEvent};

pub type SessionId = Uuid;

const MAX_NAME_RECOVERIES: usize = 2;
const CONTROL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Provisioning,
    Running,
    Attached,
    Draining,
    Terminated,
    Failed,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Provisioning => 1,
            Self::Running => 2,
            Self::Attached => 3,
            Self::Draining => 4,
            Self::Terminated | Self::Failed => 5,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Attached => "attached",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub sandbox_id: Option<String>,
    pub name: String,
    pub image: String,
    pub memory_limit: u64,
    pub cpu_share: f64,
    pub storage_limit: u64,
    pub storage_path: String,
    pub state: SessionState,
    pub created_at: u64,
    pub stats: Option<SandboxStats>,
}

#[derive(Default)]
struct Slots {
    handle: Option<SandboxHandle>,
    controls: Option<mpsc::Sender<RelayControl>>,
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

pub struct Session {
    id: SessionId,
    spec: SandboxSpec,
    created_at: SystemTime,
    engine: EngineClient,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
    stop: watch::Sender<bool>,
    claimed: watch::Sender<bool>,
    slots: Mutex<Slots>,
    release: Mutex<Vec<ReleaseHook>>,
    failure: Mutex<Option<EngineError>>,
}

impl Session {
    pub fn new(
        id: SessionId,
        spec: SandboxSpec,
        engine: EngineClient,
        options: SessionOptions,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        let (stop, _) = watch::channel(false);
        let (claimed, _) = watch::channel(false);
        Self {
            id,
            spec,
            created_at: SystemTime::now(),
            engine,
            options,
            state,
            stop,
            claimed,
            slots: Mutex::new(Slots::default()),
            release: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn spec(&self) -> &SandboxSpec {
        &self.spec
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn handle(&self) -> Option<SandboxHandle> {
        self.slots().handle.clone()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Registers a hook that runs once, before the final state is published.
    pub fn on_release(&self, hook: impl FnOnce() + Send + 'static) {
        lock(&self.release).push(Box::new(hook));
    }

    pub fn claim_channel(&self) -> bool {
        self.claimed.send_if_modified(|claimed| {
            if *claimed {
                false
            } else {
                *claimed = true;
                true
            }
        })
    }

    pub async fn wait_claimed(&self, limit: Duration) -> bool {
        let mut claimed = self.claimed.subscribe();
        tokio::time::timeout(limit, claimed.wait_for(|claimed| *claimed))
            .await
            .is_ok_and(|waited| waited.is_ok())
    }

    /// Waits up to `limit` for provisioning to settle; Ok only when Running.
    pub async fn wait_until_ready(&self, limit: Duration) -> Result<(), SessionError> {
        let mut states = self.state.subscribe();
        let _ = tokio::time::timeout(
            limit,
            states.wait_for(|state| state.rank() >= SessionState::Running.rank()),
        )
        .await;
        match self.state() {
            SessionState::Running => Ok(()),
            other => Err(SessionError::NotRunning(other)),
        }
    }

    pub fn failure(&self) -> Option<EngineError> {
        lock(&self.failure).clone()
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Creates and starts the sandbox. Created → Provisioning → Running.
    pub async fn provision(&self) -> Result<(), SessionError> {
        if !self.transition(SessionState::Provisioning) {
            return Err(SessionError::NotRunning(self.state()));
        }
        tracing::info!(session_id = %self.id, sandbox = self.spec.name(), "provisioning sandbox");
        match self.provision_steps().await {
            Ok(true) if self.transition(SessionState::Running) => {
                tracing::info!(session_id = %self.id, sandbox = self.spec.name(), "sandbox running");
                Ok(())
            }
            Ok(_) => {
                tracing::info!(session_id = %self.id, "stop requested during provisioning");
                self.finish(SessionState::Terminated).await;
                Err(SessionError::NotRunning(self.state()))
            }
            Err(err) => {
                tracing::warn!(session_id = %self.id, error = %err, "provisioning failed");
                if let SessionError::Engine(engine_err) = &err {
                    *lock(&self.failure) = Some(engine_err.clone());
                }
                self.finish(SessionState::Failed).await;
                Err(err)
            }
        }
    }

    async fn provision_steps(&self) -> Result<bool, SessionError> {
        spec::clear_stale(&self.engine, self.spec.name()).await?;
        if self.stop_requested() {
            return Ok(false);
        }
        let handle = self.create_with_recovery().await?;
        self.slots().handle = Some(handle.clone());
        if self.stop_requested() {
            return Ok(false);
        }
        match self.engine.start(&handle).await {
            Ok(()) | Err(EngineError::AlreadyStarted(_)) => {}
            Err(err) if err.is_timeout() => {
                tracing::warn!(session_id = %self.id, error = %err, "start timed out; retrying once");
                match self.engine.start(&handle).await {
                    Ok(()) | Err(EngineError::AlreadyStarted(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        }
        Ok(!self.stop_requested())
    }

    async fn create_with_recovery(&self) -> Result<SandboxHandle, SessionError> {
        let mut conflicts = 0;
        let mut retried_timeout = false;
        loop {
            match self.engine.create(&self.spec).await {
                Ok(handle) => return Ok(handle),
                Err(EngineError::NameConflict(name)) if conflicts < MAX_NAME_RECOVERIES => {
                    conflicts += 1;
                    tracing::warn!(session_id = %self.id, sandbox = %name, "name conflict; clearing stale sandbox");
                }
                Err(err) if err.is_timeout() && !retried_timeout => {
                    retried_timeout = true;
                    tracing::warn!(session_id = %self.id, error = %err, "create timed out; retrying once");
                }
                Err(err) => return Err(err.into()),
            }
            spec::clear_stale(&self.engine, self.spec.name()).await?;
        }
    }

    /// Opens the shell and relays it to `transport` until one side ends.
    pub async fn attach<T: DuplexTransport>(
        &self,
        transport: T,
    ) -> Result<RelayOutcome, SessionError> {
        let (mut source, mut sink) = transport.split();
        let handle = match self.handle() {
            Some(handle) if self.transition_from(SessionState::Running, SessionState::Attached) => {
                handle
            }
            _ => {
                let err = SessionError::NotRunning(self.state());
                emit(&mut sink, StatusEvent::Error(err.kind())).await;
                return Err(err);
            }
        };
        emit(&mut sink, StatusEvent::Connected).await;

        let exec = match self.engine.exec_interactive(&handle, self.spec.shell()).await {
            Ok(exec) => exec,
            Err(err) => {
                tracing::warn!(session_id = %self.id, error = %err, "failed to open shell");
                emit(&mut sink, StatusEvent::Error(err.kind())).await;
                self.finish(SessionState::Failed).await;
                return Err(err.into());
            }
        };
        let (controls, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        self.slots().controls = Some(controls);
        emit(&mut sink, StatusEvent::SandboxReady).await;
        tracing::info!(session_id = %self.id, sandbox = %handle, "shell attached");

        let signals = RelaySignals {
            controls: control_rx,
            stop: self.stop.subscribe(),
        };
        let outcome = relay::run(
            &mut source,
            &mut sink,
            exec,
            signals,
            self.options.relay_grace,
        )
        .await;
        self.slots().controls = None;
        tracing::info!(
            session_id = %self.id,
            reason = ?outcome.reason,
            close_requested = outcome.close_requested,
            bytes_in = outcome.bytes_in,
            bytes_out = outcome.bytes_out,
            "relay finished"
        );

        self.transition(SessionState::Draining);
        self.run_release_hooks();
        emit(&mut sink, outcome.status_event()).await;
        drop(source);
        drop(sink);
        self.teardown().await;
        self.transition(SessionState::Terminated);
        Ok(outcome)
    }

    pub async fn start<T: DuplexTransport>(
        &self,
        transport: T,
    ) -> Result<RelayOutcome, SessionError> {
        if let Err(err) = self.provision().await {
            let (_source, mut sink) = transport.split();
            emit(&mut sink, StatusEvent::Error(err.kind())).await;
            return Err(err);
        }
        self.attach(transport).await
    }

    pub fn interrupt(&self) -> Result<(), SessionError> {
        if self.state() != SessionState::Attached {
            return Err(SessionError::NotAttached);
        }
        let controls = self.slots().controls.clone();
        controls
            .ok_or(SessionError::NotAttached)?
            .try_send(RelayControl::Interrupt)
            .map_err(|_| SessionError::NotAttached)
    }

    /// Drains the session from any state. Idempotent.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        let current = self.state();
        if current.is_final() {
            return;
        }
        if matches!(current, SessionState::Created | SessionState::Running)
            && self.transition_from(current, SessionState::Draining)
        {
            tracing::info!(session_id = %self.id, from = %current, "stopping session");
            self.finish(SessionState::Terminated).await;
            return;
        }
        let limit = self.settle_limit();
        let mut states = self.state.subscribe();
        let settled = tokio::time::timeout(limit, states.wait_for(|state| state.is_final()))
            .await
            .is_ok_and(|waited| waited.is_ok());
        if !settled {
            tracing::warn!(session_id = %self.id, state = %self.state(), "session did not settle after stop");
        }
    }

    /// Greeting shown to a caller once the shell is ready.
    pub fn banner_lines(&self) -> Vec<String> {
        const MIB: u64 = 1024 * 1024;
        let id = self
            .handle()
            .map(|handle| handle.short_id().to_owned())
            .unwrap_or_default();
        vec![
            format!("Container created: {id}"),
            format!("Container name: {}", self.spec.name()),
            format!("Image: {}", self.spec.image()),
            format!(
                "Limits: {} MiB memory, {} CPU, {} MiB at {}",
                self.spec.memory_limit_bytes() / MIB,
                self.spec.cpu_share(),
                self.spec.storage_limit_bytes() / MIB,
                self.spec.storage_path()
            ),
            "Type 'exit' to quit the shell".to_owned(),
        ]
    }

    pub async fn info(&self) -> SessionInfo {
        let state = self.state();
        let handle = self.handle();
        let stats = match (&handle, state) {
            (Some(handle), SessionState::Running | SessionState::Attached) => {
                match self.engine.stats(handle, self.spec.storage_path()).await {
                    Ok(stats) => Some(stats),
                    Err(err) => {
                        tracing::debug!(session_id = %self.id, error = %err, "stats unavailable");
                        None
                    }
                }
            }
            _ => None,
        };
        SessionInfo {
            session_id: self.id,
            sandbox_id: handle.map(|handle| handle.id().to_owned()),
            name: self.spec.name().to_owned(),
            image: self.spec.image().to_owned(),
            memory_limit: self.spec.memory_limit_bytes(),
            cpu_share: self.spec.cpu_share(),
            storage_limit: self.spec.storage_limit_bytes(),
            storage_path: self.spec.storage_path().to_owned(),
            state,
            created_at: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map_or(0, |since| since.as_secs()),
            stats,
        }
    }

    async fn finish(&self, outcome: SessionState) {
        self.transition(SessionState::Draining);
        self.run_release_hooks();
        self.teardown().await;
        self.transition(outcome);
    }

    async fn teardown(&self) {
        let Some(handle) = self.slots().handle.take() else {
            return;
        };
        if let Err(err) = self.engine.stop(&handle).await {
            tracing::warn!(session_id = %self.id, sandbox = %handle, error = %err, "failed to stop sandbox");
        }
        let removed = match self.engine.remove(&handle).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::debug!(session_id = %self.id, error = %err, "remove failed; retrying");
                self.engine.remove(&handle).await
            }
        };
        match removed {
            Ok(()) => tracing::info!(session_id = %self.id, sandbox = %handle, "sandbox removed"),
            Err(err) => tracing::warn!(
                session_id = %self.id,
                sandbox = %handle,
                error = %err,
                "sandbox may have leaked"
            ),
        }
    }

    fn run_release_hooks(&self) {
        let hooks = std::mem::take(&mut *lock(&self.release));
        for hook in hooks {
            hook();
        }
    }

    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            let allowed = !current.is_final()
                && (next == SessionState::Failed || next.rank() > current.rank());
            if allowed {
                tracing::debug!(session_id = %self.id, from = %current, to = %next, "state change");
                *current = next;
            }
            allowed
        })
    }

    fn transition_from(&self, expected: SessionState, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current != expected {
                return false;
            }
            tracing::debug!(session_id = %self.id, from = %current, to = %next, "state change");
            *current = next;
            true
        })
    }

    fn settle_limit(&self) -> Duration {
        let timeouts = self.engine.timeouts();
        timeouts.operation * 3 + timeouts.stop + self.options.relay_grace
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        lock(&self.slots)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let slots = self.slots.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = slots.handle.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(session_id = %self.id, sandbox = %handle, "no runtime to release sandbox");
            return;
        };
        let engine = self.engine.clone();
        let session_id = self.id;
        runtime.spawn(async move {
            let _ = engine.stop(&handle).await;
            if let Err(err) = engine.remove(&handle).await {
                tracing::warn!(%session_id, sandbox = %handle, error = %err, "sandbox may have leaked");
            }
        });
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("sandbox", &self.spec.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn emit<K: CallerSink>(sink: &mut K, event: StatusEvent) {
    if let Err(err) = sink.emit(&event).await {
        tracing::debug!(%event, error = %err, "caller missed status event");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::{EngineTimeouts, SandboxPolicy};
    use crate::error::ErrorKind;
    use crate::mock::{MockEngine, MockOperation};
    use crate::relay::RelayReason;
    use crate::spec::SandboxSpecBuilder;
    use crate::transport::{ChannelTransport, InputFrame, Outbound};

    fn session(mock: &Arc<MockEngine>) -> Session {
        let engine = EngineClient::new(
            mock.clone(),
            EngineTimeouts {
                provision: Duration::from_millis(200),
                operation: Duration::from_millis(200),
                stop: Duration::ZERO,
            },
        );
        let id = Uuid::new_v4();
        let spec = SandboxSpecBuilder::new(SandboxPolicy::default()).build(&id);
        Session::new(
            id,
            spec,
            engine,
            SessionOptions {
                relay_grace: Duration::from_millis(500),
                attach_timeout: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn stop_after_provision_removes_sandbox_once() {
        let mock = Arc::new(MockEngine::new());
        let session = session(&mock);
        session.provision().await.unwrap();
        assert_eq!(session.state(), SessionState::Running);
        let name = session.spec().name().to_owned();
        assert!(mock.exists(&name));

        session.stop().await;
        session.stop().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!mock.exists(&name));
        assert_eq!(mock.created_count(), 1);
        assert_eq!(mock.removed_count(), 1);
    }

    #[tokio::test]
    async fn image_pull_failure_fails_without_leak() {
        let mock = Arc::new(MockEngine::new());
        mock.missing_image("debian:12.12");
        let session = session(&mock);

        let err = session.provision().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImagePullFailure);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(mock.live_count(), 0);
        assert_eq!(mock.removed_count(), 0);
    }

    #[tokio::test]
    async fn name_conflict_is_recovered() {
        let mock = Arc::new(MockEngine::new());
        let session = session(&mock);
        mock.fail_next(
            MockOperation::Create,
            EngineError::NameConflict(session.spec().name().to_owned()),
        );

        session.provision().await.unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(mock.created_count(), 1);
    }

    #[tokio::test]
    async fn create_timeout_is_retried_once() {
        let mock = Arc::new(MockEngine::new());
        let session = session(&mock);
        mock.hang_next(MockOperation::Create, 1);

        session.provision().await.unwrap();
        assert_eq!(mock.created_count(), 1);
    }

    #[tokio::test]
    async fn repeated_start_timeout_tears_down_created_sandbox() {
        let mock = Arc::new(MockEngine::new());
        let session = session(&mock);
        mock.hang_next(MockOperation::Start, 2);

        let err = session.provision().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineTimeout);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(mock.created_count(), 1);
        assert_eq!(mock.removed_count(), 1);
        assert!(session.handle().is_none());
    }

    #[tokio::test]
    async fn stop_before_provision_terminates_without_engine_calls() {
        let mock = Arc::new(MockEngine::new());
        let session = session(&mock);
        session.stop().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.provision().await.is_err());
        assert_eq!(mock.created_count(), 0);
    }

    #[tokio::test]
    async fn start_relays_and_emits_one_terminal_status() {
        let mock = Arc::new(MockEngine::new());
        let session = Arc::new(session(&mock));
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        session.on_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (transport, mut peer) = ChannelTransport::pair(32);
        let task = tokio::spawn({
            let session = session.clone();
            async move { session.start(transport).await }
        });
        peer.inbound
            .send(InputFrame::Data(b"echo hi\n".to_vec()))
            .await
            .unwrap();
        peer.inbound
            .send(InputFrame::Data(b"exit\n".to_vec()))
            .await
            .unwrap();

        let mut statuses = Vec::new();
        let mut output = Vec::new();
        while let Some(message) = peer.outbound.recv().await {
            match message {
                Outbound::Output(bytes) => output.extend(bytes),
                Outbound::Status(event) => statuses.push(event),
            }
        }
        let outcome = task.await.unwrap().unwrap();

        assert_eq!(outcome.reason, RelayReason::NormalExit);
        assert_eq!(output, b"hi\n");
        assert_eq!(
            statuses,
            vec![
                StatusEvent::Connected,
                StatusEvent::SandboxReady,
                StatusEvent::Exited(0)
            ]
        );
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(mock.live_count(), 0);
    }

    #[tokio::test]
    async fn attach_requires_running_session() {
        let mock = Arc::new(MockEngine::new());
        let session = session(&mock);
        let (transport, mut peer) = ChannelTransport::pair(4);

        let err = session.attach(transport).await.unwrap_err();
        assert!(matches!(err, SessionError::NotRunning(SessionState::Created)));
        assert_eq!(
            peer.outbound.recv().await,
            Some(Outbound::Status(StatusEvent::Error(ErrorKind::NotRunning)))
        );
        assert!(matches!(session.interrupt(), Err(SessionError::NotAttached)));
    }

    #[tokio::test]
    async fn dropping_provisioned_session_releases_sandbox() {
        let mock = Arc::new(MockEngine::new());
        let session = session(&mock);
        session.provision().await.unwrap();
        assert_eq!(mock.live_count(), 1);

        drop(session);
        for _ in 0..50 {
            if mock.live_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mock.live_count(), 0);
    }

    #[tokio::test]
    async fn hung_stop_still_removes_sandbox() {
        let mock = Arc::new(MockEngine::new());
        let session = session(&mock);
        session.provision().await.unwrap();
        mock.hang_next(MockOperation::Stop, 1);

        session.stop().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(mock.calls(MockOperation::Stop), 1);
        assert_eq!(mock.removed_count(), 1);
        assert_eq!(mock.live_count(), 0);
    }

    #[tokio::test]
    async fn failed_stop_does_not_skip_remove() {
        let mock = Arc::new(MockEngine::new());
        let session = session(&mock);
        session.provision().await.unwrap();
        mock.fail_next(
            MockOperation::Stop,
            EngineError::Operation {
                operation: "stop",
                message: "daemon hiccup".to_owned(),
            },
        );

        session.stop().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(mock.calls(MockOperation::Remove), 1);
        assert_eq!(mock.live_count(), 0);
    }

    #[tokio::test]
    async fn teardown_failures_still_terminate() {
        let mock = Arc::new(MockEngine::new());
        let session = session(&mock);
        session.provision().await.unwrap();
        let failure = || EngineError::Operation {
            operation: "teardown",
            message: "device busy".to_owned(),
        };
        mock.fail_next(MockOperation::Stop, failure());
        mock.fail_next(MockOperation::Remove, failure());
        mock.fail_next(MockOperation::Remove, failure());

        session.stop().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(mock.calls(MockOperation::Stop), 1);
        assert_eq!(mock.calls(MockOperation::Remove), 2);
        assert_eq!(mock.live_count(), 1);
        assert!(session.handle().is_none());
    }

    #[tokio::test]
    async fn banner_names_sandbox_and_limits() {
        let mock = Arc::new(MockEngine::new());
        let session = session(&mock);
        session.provision().await.unwrap();
        let short_id = session.handle().unwrap().short_id().to_owned();

        let banner = session.banner_lines();
        assert_eq!(banner[0], format!("Container created: {short_id}"));
        assert!(banner.contains(&format!("Container name: {}", session.spec().name())));
        assert!(banner.contains(&"Limits: 256 MiB memory, 0.5 CPU, 1024 MiB at /tmp".to_owned()));
        assert_eq!(banner.last().unwrap(), "Type 'exit' to quit the shell");
        session.stop().await;
    }

    #[test]
    fn final_states_are_terminal() {
        assert!(SessionState::Failed.is_final());
        assert!(!SessionState::Draining.is_final());
        assert_eq!(SessionState::Attached.to_string(), "attached");
    }
}
