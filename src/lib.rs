pub mod config;
pub mod dispatch;
pub mod executor;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod telemetry;
pub mod timer;
pub mod user;
pub mod waiters;
pub mod wire;

// Re-exports for convenience
pub use config::{ChannelConfig, ConfigError, FecAdapt};
pub use dispatch::{Server, ServerHandle};
pub use session::{KcpListener, KcpOutput, ListenerError, Session, SessionError};
pub use user::User;
