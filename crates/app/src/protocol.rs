use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use webshell::error::ErrorKind;
use webshell::relay::is_close_command;
use webshell::transport::{InputFrame, StatusEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientMessage {
    Input { data: String },
    Interrupt,
    Resize { cols: u16, rows: u16 },
    Close,
}

impl From<ClientMessage> for InputFrame {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::Input { data } => Self::Data(data.into_bytes()),
            ClientMessage::Interrupt => Self::Interrupt,
            ClientMessage::Resize { cols, rows } => Self::Resize { cols, rows },
            ClientMessage::Close => Self::Close,
        }
    }
}

/// Text frames carry JSON control messages; anything else is raw input.
pub fn parse_text_frame(text: &str) -> InputFrame {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message.into(),
        Err(_) => InputFrame::Data(text.as_bytes().to_vec()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    Status { event: String },
}

impl ServerMessage {
    pub fn status(event: &StatusEvent) -> Self {
        Self::Status {
            event: event.to_string(),
        }
    }
}

pub const CLOSE_NOTICE: &[u8] = b"Exiting shell...\r\n";

/// Greeting lines as terminal output, one per row.
pub fn banner_bytes(lines: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

pub fn close_notice(frame: &InputFrame) -> Option<&'static [u8]> {
    match frame {
        InputFrame::Data(bytes) if is_close_command(bytes) => Some(CLOSE_NOTICE),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                kind: kind.as_str().to_owned(),
                message: message.into(),
            },
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyAttached | ErrorKind::NotRunning => StatusCode::CONFLICT,
        ErrorKind::EngineUnavailable | ErrorKind::Overloaded | ErrorKind::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::ImagePullFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::EngineTimeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_messages_become_frames() {
        assert_eq!(
            parse_text_frame(r#"{"kind":"input","data":"echo hi\n"}"#),
            InputFrame::Data(b"echo hi\n".to_vec())
        );
        assert_eq!(
            parse_text_frame(r#"{"kind":"interrupt"}"#),
            InputFrame::Interrupt
        );
        assert_eq!(
            parse_text_frame(r#"{"kind":"resize","cols":120,"rows":40}"#),
            InputFrame::Resize {
                cols: 120,
                rows: 40
            }
        );
        assert_eq!(parse_text_frame(r#"{"kind":"close"}"#), InputFrame::Close);
    }

    #[test]
    fn non_protocol_text_is_raw_input() {
        assert_eq!(
            parse_text_frame("ls -la\n"),
            InputFrame::Data(b"ls -la\n".to_vec())
        );
        assert_eq!(
            parse_text_frame(r#"{"kind":"reboot"}"#),
            InputFrame::Data(br#"{"kind":"reboot"}"#.to_vec())
        );
    }

    #[test]
    fn banner_rows_end_with_crlf() {
        let lines = vec![
            "Container created: 3f2a".to_owned(),
            "Type 'exit' to quit the shell".to_owned(),
        ];
        assert_eq!(
            banner_bytes(&lines),
            b"Container created: 3f2a\r\nType 'exit' to quit the shell\r\n".to_vec()
        );
        assert!(banner_bytes(&[]).is_empty());
    }

    #[test]
    fn exit_and_quit_get_a_notice() {
        assert_eq!(
            close_notice(&parse_text_frame("exit\n")),
            Some(CLOSE_NOTICE)
        );
        assert_eq!(
            close_notice(&parse_text_frame(r#"{"kind":"input","data":"quit\r\n"}"#)),
            Some(CLOSE_NOTICE)
        );
        assert_eq!(close_notice(&parse_text_frame("exit 2\n")), None);
        assert_eq!(close_notice(&InputFrame::Close), None);
    }

    #[test]
    fn status_message_uses_wire_event_names() {
        let message = ServerMessage::status(&StatusEvent::Exited(0));
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"kind":"status","event":"exited:0"}"#
        );
        let error = ServerMessage::status(&StatusEvent::Error(ErrorKind::ImagePullFailure));
        assert_eq!(
            serde_json::to_value(&error).unwrap()["event"],
            "error:image-pull"
        );
    }

    #[test]
    fn error_kinds_map_to_http_statuses() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::AlreadyAttached), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorKind::EngineUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(ErrorKind::ImagePullFailure),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(ErrorKind::EngineTimeout),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(ErrorKind::Relay),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn error_envelope_shape() {
        let body = serde_json::to_value(ErrorEnvelope::new(ErrorKind::Overloaded, "busy")).unwrap();
        assert_eq!(body["error"]["kind"], "overloaded");
        assert_eq!(body["error"]["message"], "busy");
    }
}
