use courier_broker::BrokerError;
use courier_common::EnvelopeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Invalid retry interval {value:?}: {source}")]
    RetryInterval {
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("Consumer not initialised, call init() first")]
    NotInitialised,

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Invalid mail request: {0}")]
    Invalid(#[from] EnvelopeError),

    #[error("Unable to serialise mail request: {0}")]
    Serialise(#[from] serde_json::Error),
}
