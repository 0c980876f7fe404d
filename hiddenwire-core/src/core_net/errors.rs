//! Manager-level errors

use thiserror::Error;

use crate::config::ConfigError;
use crate::core_channel::ChannelError;
use crate::core_identity::CryptoError;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection manager is stopped")]
    Stopped,

    #[error("Payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { len: usize, max: u32 },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
