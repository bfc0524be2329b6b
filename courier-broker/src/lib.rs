//! Broker connectivity for courier
//!
//! [`Broker`] keeps one AMQP connection and channel alive, reopening them
//! when the broker closes them underneath, and declares the queue topology
//! the consumer relies on.

pub mod amqp;
pub mod config;
mod delivery;
pub mod error;
mod manager;
#[cfg(feature = "test-util")]
pub mod memory;
pub mod topology;
mod transport;

pub use config::BrokerConfig;
pub use delivery::{Delivery, DeliveryStream};
pub use error::BrokerError;
pub use lapin::{
    BasicProperties,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
};
pub use manager::Broker;
pub use transport::{Channel, Connection, Connector, Inbound, InboundStream, Message};
