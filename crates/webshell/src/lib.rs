pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod mock;
pub mod registry;
pub mod relay;
pub mod session;
pub mod signals;
pub mod spec;
pub mod telemetry;
pub mod terminal;
pub mod transport;

pub use config::ShellConfig;
pub use engine::{Engine, EngineClient, SandboxHandle};
pub use error::{EngineError, ErrorKind, RegistryError, SessionError};
pub use registry::{SessionCreated, SessionRegistry};
pub use relay::{RelayOutcome, RelayReason};
pub use session::{Session, SessionId, SessionInfo, SessionState};
pub use transport::{ChannelPeer, ChannelTransport, InputFrame, Outbound, StatusEvent};
