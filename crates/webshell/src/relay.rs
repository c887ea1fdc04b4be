use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};

use crate::engine::{ExecStream, TerminalSize};
use crate::error::ErrorKind;
use crate::transport::{CallerSink, CallerSource, InputFrame, StatusEvent};

const ETX: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayControl {
    Interrupt,
}

/// Out-of-band inputs to a running relay.
pub struct RelaySignals {
    pub controls: mpsc::Receiver<RelayControl>,
    pub stop: watch::Receiver<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayReason {
    NormalExit,
    RemoteDisconnect,
    SandboxExitCode(i64),
    RelayError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub reason: RelayReason,
    pub close_requested: bool,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl RelayOutcome {
    pub fn status_event(&self) -> StatusEvent {
        match &self.reason {
            RelayReason::NormalExit => StatusEvent::Exited(0),
            RelayReason::SandboxExitCode(code) => StatusEvent::Exited(*code),
            RelayReason::RemoteDisconnect => StatusEvent::Disconnected,
            RelayReason::RelayError(_) => StatusEvent::Error(ErrorKind::Relay),
        }
    }

    /// Process exit code for terminal mode.
    pub fn exit_code(&self) -> i32 {
        match &self.reason {
            RelayReason::NormalExit | RelayReason::RemoteDisconnect => 0,
            RelayReason::SandboxExitCode(code) => (*code).clamp(1, 255) as i32,
            RelayReason::RelayError(_) => 1,
        }
    }
}

enum InboundEnd {
    CallerClosed,
    SandboxClosed,
    Failed(String),
}

enum OutboundEnd {
    CallerGone,
    Failed(String),
}

/// Pumps bytes both ways between a caller and an interactive shell until
/// one side finishes, the shell exits, or a stop is requested.
pub async fn run<S, K>(
    source: &mut S,
    sink: &mut K,
    exec: ExecStream,
    signals: RelaySignals,
    grace: Duration,
) -> RelayOutcome
where
    S: CallerSource,
    K: CallerSink,
{
    let ExecStream {
        mut input,
        mut output,
        mut exit,
        terminal,
        kill: _kill,
    } = exec;
    let RelaySignals {
        mut controls,
        mut stop,
    } = signals;
    let close_requested = AtomicBool::new(false);
    let bytes_in = AtomicU64::new(0);
    let bytes_out = AtomicU64::new(0);

    let inbound = async {
        loop {
            let frame = tokio::select! {
                frame = source.next_frame() => frame,
                Some(control) = controls.recv() => match control {
                    RelayControl::Interrupt => Ok(Some(InputFrame::Interrupt)),
                },
            };
            let bytes = match frame {
                Ok(Some(InputFrame::Data(bytes))) => {
                    if is_close_command(&bytes) {
                        close_requested.store(true, Ordering::Relaxed);
                    }
                    bytes
                }
                Ok(Some(InputFrame::Interrupt)) => vec![ETX],
                Ok(Some(InputFrame::Resize { cols, rows })) => {
                    if let Err(err) = terminal.resize(TerminalSize { cols, rows }) {
                        tracing::debug!(cols, rows, error = %err, "resize failed");
                    }
                    continue;
                }
                Ok(Some(InputFrame::Close)) | Ok(None) => return InboundEnd::CallerClosed,
                Err(err) if is_disconnect(&err) => return InboundEnd::CallerClosed,
                Err(err) => return InboundEnd::Failed(format!("caller read failed: {err}")),
            };
            let written = async {
                input.write_all(&bytes).await?;
                input.flush().await
            };
            match written.await {
                Ok(()) => {
                    bytes_in.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    return InboundEnd::SandboxClosed;
                }
                Err(err) => return InboundEnd::Failed(format!("sandbox write failed: {err}")),
            }
        }
    };

    let outbound = async {
        while let Some(chunk) = output.recv().await {
            if let Err(err) = sink.write_output(&chunk).await {
                return Err(if is_disconnect(&err) {
                    OutboundEnd::CallerGone
                } else {
                    OutboundEnd::Failed(format!("caller write failed: {err}"))
                });
            }
            bytes_out.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    };

    tokio::pin!(inbound);
    tokio::pin!(outbound);
    let mut inbound_open = true;

    let reason = loop {
        tokio::select! {
            end = &mut inbound, if inbound_open => match end {
                InboundEnd::CallerClosed => break RelayReason::RemoteDisconnect,
                InboundEnd::SandboxClosed => {
                    tracing::debug!("shell stopped reading input; awaiting exit");
                    inbound_open = false;
                }
                InboundEnd::Failed(message) => break RelayReason::RelayError(message),
            },
            end = &mut outbound => match end {
                Ok(()) => {
                    break match tokio::time::timeout(grace, &mut exit).await {
                        Ok(Ok(code)) => reason_for_exit(code),
                        Ok(Err(_)) => RelayReason::RelayError("exit status lost".to_owned()),
                        Err(_) => RelayReason::RelayError(
                            "shell closed output without exiting".to_owned(),
                        ),
                    };
                }
                Err(OutboundEnd::CallerGone) => break RelayReason::RemoteDisconnect,
                Err(OutboundEnd::Failed(message)) => break RelayReason::RelayError(message),
            },
            code = &mut exit => {
                match tokio::time::timeout(grace, &mut outbound).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => tracing::debug!("caller went away while draining output"),
                    Err(_) => tracing::debug!("output drain hit grace period"),
                }
                break match code {
                    Ok(code) => reason_for_exit(code),
                    Err(_) => RelayReason::RelayError("exit status lost".to_owned()),
                };
            },
            () = stop_requested(&mut stop) => break RelayReason::NormalExit,
        }
    };

    RelayOutcome {
        reason,
        close_requested: close_requested.load(Ordering::Relaxed),
        bytes_in: bytes_in.load(Ordering::Relaxed),
        bytes_out: bytes_out.load(Ordering::Relaxed),
    }
}

/// Resolves once a stop is requested; never resolves if the flag is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let requested = stop.wait_for(|stopped| *stopped).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

fn reason_for_exit(code: i64) -> RelayReason {
    if code == 0 {
        RelayReason::NormalExit
    } else {
        RelayReason::SandboxExitCode(code)
    }
}

/// True for a line that is just `exit` or `quit`.
pub fn is_close_command(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes)
        .map(|text| matches!(text.trim(), "exit" | "quit"))
        .unwrap_or(false)
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::config::SandboxPolicy;
    use crate::engine::Engine;
    use crate::mock::MockEngine;
    use crate::spec::SandboxSpecBuilder;
    use crate::transport::{ChannelTransport, DuplexTransport, Outbound};

    const GRACE: Duration = Duration::from_millis(500);

    async fn shell() -> (MockEngine, ExecStream) {
        let mock = MockEngine::new();
        let spec = SandboxSpecBuilder::new(SandboxPolicy::default()).build(&Uuid::new_v4());
        let handle = mock.create(&spec).await.unwrap();
        mock.start(handle.id()).await.unwrap();
        let exec = mock.exec_interactive(handle.id(), spec.shell()).await.unwrap();
        (mock, exec)
    }

    fn signals() -> (mpsc::Sender<RelayControl>, watch::Sender<bool>, RelaySignals) {
        let (controls_tx, controls) = mpsc::channel(4);
        let (stop_tx, stop) = watch::channel(false);
        (controls_tx, stop_tx, RelaySignals { controls, stop })
    }

    fn spawn_relay(
        exec: ExecStream,
        signals: RelaySignals,
    ) -> (
        tokio::task::JoinHandle<RelayOutcome>,
        crate::transport::ChannelPeer,
    ) {
        let (transport, peer) = ChannelTransport::pair(16);
        let (mut source, mut sink) = transport.split();
        let task =
            tokio::spawn(async move { run(&mut source, &mut sink, exec, signals, GRACE).await });
        (task, peer)
    }

    fn drain(peer: &mut crate::transport::ChannelPeer) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(message) = peer.outbound.try_recv() {
            if let Outbound::Output(bytes) = message {
                out.extend(bytes);
            }
        }
        out
    }

    #[tokio::test]
    async fn exit_ends_relay_with_normal_exit() {
        let (_mock, exec) = shell().await;
        let (_controls, _stop, signals) = signals();
        let (task, mut peer) = spawn_relay(exec, signals);

        peer.inbound
            .send(InputFrame::Data(b"echo hi\n".to_vec()))
            .await
            .unwrap();
        peer.inbound
            .send(InputFrame::Data(b"exit\n".to_vec()))
            .await
            .unwrap();
        let outcome = task.await.unwrap();

        assert_eq!(outcome.reason, RelayReason::NormalExit);
        assert!(outcome.close_requested);
        assert_eq!(outcome.status_event(), StatusEvent::Exited(0));
        assert_eq!(outcome.bytes_in, 13);
        assert_eq!(drain(&mut peer), b"hi\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_and_clamped() {
        let (_mock, exec) = shell().await;
        let (_controls, _stop, signals) = signals();
        let (task, peer) = spawn_relay(exec, signals);

        peer.inbound
            .send(InputFrame::Data(b"exit 300\n".to_vec()))
            .await
            .unwrap();
        let outcome = task.await.unwrap();

        assert_eq!(outcome.reason, RelayReason::SandboxExitCode(300));
        assert_eq!(outcome.exit_code(), 255);
        assert!(!outcome.close_requested);
    }

    #[tokio::test]
    async fn caller_eof_is_a_remote_disconnect() {
        let (_mock, exec) = shell().await;
        let (_controls, _stop, signals) = signals();
        let (task, peer) = spawn_relay(exec, signals);

        drop(peer.inbound);
        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, RelayReason::RemoteDisconnect);
        assert_eq!(outcome.status_event(), StatusEvent::Disconnected);
        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn interrupt_control_stops_the_running_command() {
        let (mock, exec) = shell().await;
        let (controls, _stop, signals) = signals();
        let (task, mut peer) = spawn_relay(exec, signals);

        peer.inbound
            .send(InputFrame::Data(b"sleep 30\n".to_vec()))
            .await
            .unwrap();
        for _ in 0..50 {
            if mock.inputs().iter().any(|line| line == "sleep 30") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        controls.send(RelayControl::Interrupt).await.unwrap();
        for _ in 0..50 {
            if mock.interrupts() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        peer.inbound
            .send(InputFrame::Data(b"echo after\nexit\n".to_vec()))
            .await
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("interrupt did not reach the command")
            .unwrap();

        assert_eq!(mock.interrupts(), 1);
        assert_eq!(outcome.reason, RelayReason::NormalExit);
        assert_eq!(drain(&mut peer), b"^C\nafter\n");
    }

    #[tokio::test]
    async fn resize_frames_reach_the_terminal() {
        let (mock, exec) = shell().await;
        let (_controls, _stop, signals) = signals();
        let (task, peer) = spawn_relay(exec, signals);

        peer.inbound
            .send(InputFrame::Resize {
                cols: 132,
                rows: 43,
            })
            .await
            .unwrap();
        peer.inbound
            .send(InputFrame::Data(b"exit\n".to_vec()))
            .await
            .unwrap();
        let outcome = task.await.unwrap();

        assert_eq!(outcome.reason, RelayReason::NormalExit);
        assert_eq!(
            mock.resizes(),
            vec![TerminalSize {
                cols: 132,
                rows: 43
            }]
        );
        assert_eq!(outcome.bytes_in, 5);
    }

    #[tokio::test]
    async fn stop_flag_ends_relay_cleanly() {
        let (_mock, exec) = shell().await;
        let (_controls, stop, signals) = signals();
        let (task, _peer) = spawn_relay(exec, signals);

        stop.send_replace(true);
        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.reason, RelayReason::NormalExit);
    }

    #[test]
    fn close_command_detection_trims_whitespace() {
        assert!(is_close_command(b"  quit\r\n"));
        assert!(is_close_command(b"exit\n"));
        assert!(!is_close_command(b"exit 1\n"));
        assert!(!is_close_command(&[0xff, 0xfe]));
    }
}
