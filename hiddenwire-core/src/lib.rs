//! hiddenwire: authenticated peer-to-peer messaging over onion-service channels

pub mod config;
pub mod core_auth;
pub mod core_channel;
pub mod core_identity;
pub mod core_net;
pub mod logging;
pub mod serializer;

pub use config::Config;
pub use core_auth::AuthStrategy;
pub use core_channel::{CloseReason, Direction, SendError};
pub use core_identity::{CryptoIdentity, Identifier};
pub use core_net::{ConnectionError, ConnectionManager, Delivery, ManagerEvent};
pub use logging::{init_logging, LogLevel};
