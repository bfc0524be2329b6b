//! Exchange and queue declarations
//!
//! A consumer uses one durable direct exchange bound to one queue. When
//! retries are enabled it also gets a delay pair: `<exchange>-delay`, bound
//! to `<queue>-delay`, whose messages expire after the retry interval and
//! are dead-lettered back to the work exchange with their routing key
//! intact. Publishing to the delay exchange therefore means "try again
//! later" without any timer in this process.

use std::time::Duration;

use courier_common::internal;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};

use crate::{Broker, BrokerError};

pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const MESSAGE_TTL: &str = "x-message-ttl";

pub fn delay_exchange(exchange: &str) -> String {
    format!("{exchange}-delay")
}

pub fn delay_queue(queue: &str) -> String {
    format!("{queue}-delay")
}

/// Arguments that expire a message after `ttl` and dead-letter it to
/// `exchange`
pub fn delay_arguments(exchange: &str, ttl: Duration) -> FieldTable {
    let mut arguments = FieldTable::default();

    arguments.insert(
        ShortString::from(DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from(exchange)),
    );
    arguments.insert(
        ShortString::from(MESSAGE_TTL),
        AMQPValue::LongLongInt(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)),
    );

    arguments
}

impl Broker {
    /// Declare everything a consumer of `queue` needs
    ///
    /// Returns the name of the delay exchange, or `None` when
    /// `retry_interval` is zero and retries are disabled.
    ///
    /// # Errors
    ///
    /// Any declaration or binding was refused.
    pub async fn configure_consumer(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        retry_interval: Duration,
    ) -> Result<Option<String>, BrokerError> {
        self.declare_exchange(exchange, &FieldTable::default()).await?;
        self.declare_queue(queue, &FieldTable::default()).await?;
        self.bind_queue(queue, exchange, routing_key).await?;

        internal!(queue, exchange, routing_key, "Declared work queue");

        if retry_interval.is_zero() {
            internal!(level = INFO, queue, "Retries are disabled");
            return Ok(None);
        }

        let delay = delay_exchange(exchange);
        let delay_queue = delay_queue(queue);
        let arguments = delay_arguments(exchange, retry_interval);

        self.declare_exchange(&delay, &arguments).await?;
        self.declare_queue(&delay_queue, &arguments).await?;
        self.bind_queue(&delay_queue, &delay, routing_key).await?;

        internal!(
            queue = %delay_queue,
            exchange = %delay,
            interval = ?retry_interval,
            "Declared delay queue"
        );

        Ok(Some(delay))
    }

    /// Declare the exchange a producer publishes to
    ///
    /// # Errors
    ///
    /// The declaration was refused.
    pub async fn configure_publisher(&self, exchange: &str) -> Result<(), BrokerError> {
        self.declare_exchange(exchange, &FieldTable::default()).await
    }
}
