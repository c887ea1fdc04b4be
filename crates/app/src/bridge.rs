use axum::extract::ws::{Message, WebSocket};
use webshell::registry::SessionRegistry;
use webshell::session::SessionId;
use webshell::transport::{ChannelPeer, ChannelTransport, InputFrame, Outbound, StatusEvent};

use crate::protocol::{ServerMessage, banner_bytes, close_notice, parse_text_frame};

const CHANNEL_CAPACITY: usize = 64;

/// Binds an upgraded socket to a session and shuttles frames until the
/// session emits its terminal status or the socket goes away.
pub async fn serve_socket(mut socket: WebSocket, registry: SessionRegistry, id: SessionId) {
    let (transport, peer) = ChannelTransport::pair(CHANNEL_CAPACITY);
    if let Err(err) = registry.attach_channel(id, transport).await {
        tracing::info!(session_id = %id, error = %err, "rejecting channel");
        let _ = send_status(&mut socket, &StatusEvent::Error(err.kind())).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let ChannelPeer {
        inbound,
        mut outbound,
    } = peer;
    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(Outbound::Output(bytes)) => {
                    if socket.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Status(event)) => {
                    if send_status(&mut socket, &event).await.is_err() {
                        break;
                    }
                    if event.is_terminal() {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                    if event == StatusEvent::SandboxReady {
                        let banner = registry
                            .session(id)
                            .map(|session| banner_bytes(&session.banner_lines()))
                            .unwrap_or_default();
                        if !banner.is_empty()
                            && socket.send(Message::Binary(banner.into())).await.is_err()
                        {
                            break;
                        }
                    }
                }
                None => break,
            },
            incoming = socket.recv() => {
                let frame = match incoming {
                    Some(Ok(Message::Text(text))) => parse_text_frame(text.as_str()),
                    Some(Ok(Message::Binary(data))) => InputFrame::Data(data.to_vec()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(session_id = %id, error = %err, "socket error");
                        break;
                    }
                    Some(Ok(_)) => continue,
                };
                if let Some(notice) = close_notice(&frame) {
                    let _ = socket.send(Message::Binary(notice.to_vec().into())).await;
                }
                if inbound.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(session_id = %id, "socket closed");
}

async fn send_status(socket: &mut WebSocket, event: &StatusEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(&ServerMessage::status(event))
        .unwrap_or_else(|_| format!(r#"{{"kind":"status","event":"{event}"}}"#));
    socket.send(Message::Text(text.into())).await
}
