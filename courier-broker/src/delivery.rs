use std::sync::Arc;

use futures_util::stream::BoxStream;
use lapin::{BasicProperties, types::FieldTable};

use crate::{BrokerError, Channel, Inbound, Message};

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// A message received from a queue
///
/// A `Delivery` is settled by handing it, by value, to
/// [`Broker::acknowledge`](crate::Broker::acknowledge) or
/// [`Broker::reject`](crate::Broker::reject), so it can be settled at most
/// once.
#[derive(Debug)]
pub struct Delivery {
    tag: u64,
    body: Vec<u8>,
    properties: BasicProperties,
    redelivered: bool,
    pub(crate) channel: Arc<dyn Channel>,
}

impl Delivery {
    pub(crate) fn new(inbound: Inbound, channel: Arc<dyn Channel>) -> Self {
        Self {
            tag: inbound.tag,
            body: inbound.body,
            properties: inbound.properties,
            redelivered: inbound.redelivered,
            channel,
        }
    }

    pub const fn tag(&self) -> u64 {
        self.tag
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub const fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    pub fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    pub const fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// The same body and properties, ready to be published again
    pub fn to_message(&self) -> Message {
        Message {
            body: self.body.clone(),
            properties: self.properties.clone(),
        }
    }
}
