use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid broker URI: {0}")]
    InvalidUri(String),

    #[error("Timed out after {0:?} connecting to the broker")]
    DialTimeout(Duration),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Broker has been shut down")]
    Closed,

    #[error("Broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether reopening the channel (or the connection under it) could
    /// make the operation succeed
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::ConnectionClosed)
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) => Self::ChannelClosed,
            lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
                Self::ConnectionClosed
            }
            other => Self::Protocol(other.to_string()),
        }
    }
}
