use std::sync::Arc;

use courier_broker::{Broker, Message};
use courier_common::{MailRequest, outgoing};

use crate::DeliveryError;

/// Queues mail requests for a consumer to pick up
///
/// Shares its [`Broker`] with anything else in the process, including a
/// consumer.
#[derive(Debug, Clone)]
pub struct MailPublisher {
    broker: Arc<Broker>,
    exchange: String,
    routing_key: String,
}

impl MailPublisher {
    /// # Errors
    ///
    /// The exchange could not be declared.
    pub async fn new(
        broker: Arc<Broker>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Result<Self, DeliveryError> {
        let exchange = exchange.into();
        broker.configure_publisher(&exchange).await?;

        Ok(Self {
            broker,
            exchange,
            routing_key: routing_key.into(),
        })
    }

    /// Validate `request` and publish it as persistent JSON
    ///
    /// # Errors
    ///
    /// The request is invalid, or the broker did not accept it.
    pub async fn send(&self, request: &MailRequest) -> Result<(), DeliveryError> {
        request.check()?;

        let body = serde_json::to_vec(request)?;
        self.broker
            .publish(&self.exchange, &self.routing_key, &Message::json(body))
            .await?;

        outgoing!(
            exchange = %self.exchange,
            template = %request.tpl,
            recipients = request.recipients.len(),
            "Queued mail request"
        );

        Ok(())
    }
}
