use std::future::Future;
use std::sync::Arc;

use crate::error::SessionError;
use crate::session::Session;
use crate::transport::DuplexTransport;

/// Provisions `session`, calls `on_ready`, then relays it to `transport`
/// and yields the process exit code.
///
/// When `shutdown` resolves first the session is stopped and the run
/// counts as a clean exit.
pub async fn run_session<T, F, R>(
    session: Arc<Session>,
    transport: T,
    shutdown: F,
    on_ready: R,
) -> Result<u8, SessionError>
where
    T: DuplexTransport,
    F: Future<Output = ()> + Send + 'static,
    R: FnOnce(&Session),
{
    let stopper = session.clone();
    let watcher = tokio::spawn(async move {
        shutdown.await;
        tracing::info!(session_id = %stopper.id(), "shutdown requested");
        stopper.stop().await;
    });

    let result = async {
        session.provision().await?;
        on_ready(&session);
        let outcome = session.attach(transport).await?;
        Ok(u8::try_from(outcome.exit_code()).unwrap_or(1))
    }
    .await;

    if session.stop_requested() {
        let _ = watcher.await;
        if let Err(err) = &result {
            tracing::debug!(session_id = %session.id(), error = %err, "ignoring error after shutdown");
        }
        return Ok(result.unwrap_or(0));
    }
    watcher.abort();
    result
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::oneshot;
    use uuid::Uuid;

    use super::*;
    use crate::config::{EngineTimeouts, SandboxPolicy, SessionOptions};
    use crate::engine::EngineClient;
    use crate::mock::{MockEngine, MockOperation};
    use crate::session::SessionState;
    use crate::spec::SandboxSpecBuilder;
    use crate::transport::{ChannelTransport, InputFrame};

    fn session(mock: &Arc<MockEngine>) -> Arc<Session> {
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
        Arc::new(Session::new(
            id,
            spec,
            engine,
            SessionOptions {
                relay_grace: Duration::from_millis(500),
                attach_timeout: Duration::from_secs(1),
            },
        ))
    }

    #[tokio::test]
    async fn shell_exit_code_becomes_process_code() {
        let mock = Arc::new(MockEngine::new());
        let session = session(&mock);
        let (transport, peer) = ChannelTransport::pair(8);
        let banners = Arc::new(AtomicUsize::new(0));
        let counter = banners.clone();

        let run = tokio::spawn(run_session(
            session.clone(),
            transport,
            std::future::pending(),
            move |_: &Session| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ));
        peer.inbound
            .send(InputFrame::Data(b"exit 3\n".to_vec()))
            .await
            .unwrap();

        assert_eq!(run.await.unwrap().unwrap(), 3);
        assert_eq!(banners.load(Ordering::SeqCst), 1);
        assert_eq!(mock.live_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_during_provisioning_is_a_clean_exit() {
        let mock = Arc::new(MockEngine::new());
        mock.hang_next(MockOperation::Start, 1);
        let session = session(&mock);
        let (transport, _peer) = ChannelTransport::pair(8);
        let (fire, fired) = oneshot::channel::<()>();

        let run = tokio::spawn(run_session(
            session.clone(),
            transport,
            async move {
                let _ = fired.await;
            },
            |_: &Session| panic!("banner shown for a session that never ran"),
        ));
        for _ in 0..50 {
            if mock.calls(MockOperation::Start) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        fire.send(()).unwrap();

        assert_eq!(run.await.unwrap().unwrap(), 0);
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(mock.created_count(), 1);
        assert_eq!(mock.live_count(), 0);
    }

    #[tokio::test]
    async fn provisioning_failure_without_shutdown_is_an_error() {
        let mock = Arc::new(MockEngine::new());
        mock.missing_image("debian:12.12");
        let session = session(&mock);
        let (transport, _peer) = ChannelTransport::pair(8);

        let err = run_session(session, transport, std::future::pending(), |_: &Session| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ImagePullFailure);
    }
}
