//! The narrow surface the connection manager needs from a broker client
//!
//! Everything above this module speaks in terms of these traits, so the
//! retry and recovery logic is the same whether the frames go over a real
//! AMQP socket ([`crate::amqp::LapinConnector`]) or stay in process
//! (`memory::MemoryBroker`, behind the `test-util` feature).

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{BasicProperties, types::FieldTable};

use crate::BrokerError;

/// A message as published to an exchange
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

impl Message {
    #[must_use]
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            properties: BasicProperties::default(),
        }
    }

    /// A persistent `application/json` message
    #[must_use]
    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            properties: BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2),
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.properties = self.properties.with_headers(headers);
        self
    }
}

/// A delivery as handed over by a channel, before the connection manager
/// attaches the channel that has to settle it
#[derive(Debug, Clone)]
pub struct Inbound {
    pub tag: u64,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
    pub redelivered: bool,
}

pub type InboundStream = BoxStream<'static, Result<Inbound, BrokerError>>;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Connection>, BrokerError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    fn vhost(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Open a channel limited to a single unacknowledged delivery
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// All exchanges are `direct`, and every exchange and queue is durable.
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, name: &str, arguments: FieldTable)
    -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, arguments: FieldTable) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Resolves once the broker has confirmed the publish
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<InboundStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
