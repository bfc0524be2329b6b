//! The connection manager
//!
//! A [`Broker`] owns one connection and one channel. Publishes, declarations
//! and acknowledgements share the channel under a read lock; swapping in a
//! fresh channel after the broker closed the old one takes the write lock,
//! so nothing runs against a half torn down channel.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use courier_common::{incoming, internal, outgoing};
use futures_util::{FutureExt, StreamExt, future::BoxFuture};
use lapin::types::FieldTable;
use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::{
    BrokerError, Channel, Connection, Connector, Delivery, DeliveryStream, Message,
};

struct Link {
    connection: Box<dyn Connection>,
    channel: Arc<dyn Channel>,
}

pub struct Broker {
    uri: String,
    vhost: String,
    connector: Arc<dyn Connector>,
    dial_timeout: Duration,
    /// `None` once closed
    link: RwLock<Option<Link>>,
    consumer_tag: Mutex<Option<String>>,
    connected: AtomicBool,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("vhost", &self.vhost)
            .field("dial_timeout", &self.dial_timeout)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

async fn dial(
    connector: &dyn Connector,
    uri: &str,
    timeout: Duration,
) -> Result<Box<dyn Connection>, BrokerError> {
    tokio::time::timeout(timeout, connector.connect(uri))
        .await
        .map_err(|_| BrokerError::DialTimeout(timeout))?
}

/// A random 4 byte consumer tag, as lowercase hex
fn random_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

fn current(link: Option<&Link>) -> Result<Arc<dyn Channel>, BrokerError> {
    link.map(|link| Arc::clone(&link.channel))
        .ok_or(BrokerError::Closed)
}

impl Broker {
    /// Dial `uri` and open the first channel
    ///
    /// This is the only place a broker failure is fatal: callers are expected
    /// to abort startup when messaging is configured but unreachable.
    ///
    /// # Errors
    ///
    /// The URI is invalid, the dial timed out, or the broker refused the
    /// connection or the channel.
    pub async fn connect(
        uri: &str,
        connector: Arc<dyn Connector>,
        dial_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let connection = dial(connector.as_ref(), uri, dial_timeout).await?;
        let channel = connection.open_channel().await?;
        let vhost = connection.vhost().to_string();

        internal!(level = INFO, vhost = %vhost, "Connected to broker");

        Ok(Self {
            uri: uri.to_string(),
            vhost,
            connector,
            dial_timeout,
            link: RwLock::new(Some(Link {
                connection,
                channel,
            })),
            consumer_tag: Mutex::default(),
            connected: AtomicBool::new(true),
        })
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    /// Whether the last operation against the broker left a usable channel
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The tag of the active consumer, if any
    pub fn consumer_tag(&self) -> Option<String> {
        self.consumer_tag.lock().clone()
    }

    /// Check that both the connection and the channel are open
    ///
    /// # Errors
    ///
    /// The broker has been closed, or the connection or channel is down.
    pub async fn ping(&self) -> Result<(), BrokerError> {
        let link = self.link.read().await;
        let link = link.as_ref().ok_or(BrokerError::Closed)?;

        if !link.connection.is_open() {
            return Err(BrokerError::ConnectionClosed);
        }

        if !link.channel.is_open() {
            return Err(BrokerError::ChannelClosed);
        }

        Ok(())
    }

    /// Run `op` against the current channel, reopening it and retrying once
    /// if the broker reports it closed
    async fn with_channel<'a, T, F>(&self, op: F) -> Result<T, BrokerError>
    where
        F: Fn(Arc<dyn Channel>) -> BoxFuture<'a, Result<T, BrokerError>>,
    {
        let stale = {
            let link = self.link.read().await;
            let channel = current(link.as_ref())?;

            match op(Arc::clone(&channel)).await {
                Err(err) if err.is_closed() => {
                    internal!(level = WARN, "{err}, reopening channel");
                    channel
                }
                result => return result,
            }
        };

        self.reopen(&stale).await?;

        let link = self.link.read().await;
        op(current(link.as_ref())?).await
    }

    /// Replace `stale` with a fresh channel, redialing if the connection is
    /// gone too
    ///
    /// Does nothing if another caller already replaced `stale`.
    async fn reopen(&self, stale: &Arc<dyn Channel>) -> Result<(), BrokerError> {
        let mut link = self.link.write().await;
        let link = link.as_mut().ok_or(BrokerError::Closed)?;

        if !Arc::ptr_eq(&link.channel, stale) && link.channel.is_open() {
            return Ok(());
        }

        let result = self.relink(link).await;
        self.connected.store(result.is_ok(), Ordering::Release);

        match &result {
            Ok(()) => internal!(level = INFO, "Reopened channel to broker"),
            Err(err) => internal!(level = ERROR, "Unable to reopen channel to broker: {err}"),
        }

        result
    }

    async fn relink(&self, link: &mut Link) -> Result<(), BrokerError> {
        let mut redialed = false;

        if !link.connection.is_open() {
            internal!(level = WARN, "Connection to broker lost, redialing");
            link.connection = dial(self.connector.as_ref(), &self.uri, self.dial_timeout).await?;
            redialed = true;
        }

        link.channel = match link.connection.open_channel().await {
            Err(err) if err.is_closed() && !redialed => {
                internal!(level = WARN, "{err} while opening a channel, redialing");
                link.connection =
                    dial(self.connector.as_ref(), &self.uri, self.dial_timeout).await?;
                link.connection.open_channel().await?
            }
            channel => channel?,
        };

        Ok(())
    }

    /// Make sure there is a usable channel, reopening or redialing as needed
    ///
    /// # Errors
    ///
    /// The broker has been closed, or it could not be reached again.
    pub async fn recover(&self) -> Result<(), BrokerError> {
        let stale = {
            let link = self.link.read().await;
            let link = link.as_ref().ok_or(BrokerError::Closed)?;

            if link.connection.is_open() && link.channel.is_open() {
                return Ok(());
            }

            Arc::clone(&link.channel)
        };

        self.reopen(&stale).await
    }

    /// Declare a durable, direct exchange
    ///
    /// # Errors
    ///
    /// The broker refused the declaration.
    pub async fn declare_exchange(
        &self,
        name: &str,
        arguments: &FieldTable,
    ) -> Result<(), BrokerError> {
        self.with_channel(|channel| {
            let arguments = arguments.clone();
            async move { channel.declare_exchange(name, arguments).await }.boxed()
        })
        .await
    }

    /// Declare a durable queue
    ///
    /// # Errors
    ///
    /// The broker refused the declaration.
    pub async fn declare_queue(&self, name: &str, arguments: &FieldTable) -> Result<(), BrokerError> {
        self.with_channel(|channel| {
            let arguments = arguments.clone();
            async move { channel.declare_queue(name, arguments).await }.boxed()
        })
        .await
    }

    /// # Errors
    ///
    /// The queue or exchange does not exist.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.with_channel(|channel| {
            async move { channel.bind_queue(queue, exchange, routing_key).await }.boxed()
        })
        .await
    }

    /// Publish `message`, waiting for the broker to confirm it
    ///
    /// # Errors
    ///
    /// The publish failed, even after reopening a closed channel.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), BrokerError> {
        self.with_channel(|channel| {
            async move { channel.publish(exchange, routing_key, message).await }.boxed()
        })
        .await?;

        outgoing!(exchange, routing_key, bytes = message.body.len(), "Published message");

        Ok(())
    }

    /// Subscribe to `queue`
    ///
    /// Without a `consumer_tag` a random one is generated. The returned stream
    /// ends when the subscription does (cancelled, or the channel closed) and
    /// cannot be restarted; subscribe again instead.
    ///
    /// # Errors
    ///
    /// The subscription was refused.
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: Option<&str>,
    ) -> Result<DeliveryStream, BrokerError> {
        let tag = consumer_tag.map_or_else(random_tag, ToString::to_string);

        let stream = self
            .with_channel(|channel| {
                let tag = tag.as_str();
                async move {
                    let inbound = channel.consume(queue, tag).await?;

                    Ok(inbound
                        .map(move |item| {
                            item.map(|inbound| Delivery::new(inbound, Arc::clone(&channel)))
                        })
                        .boxed())
                }
                .boxed()
            })
            .await?;

        incoming!(level = INFO, queue, consumer_tag = %tag, "Consuming");
        *self.consumer_tag.lock() = Some(tag);

        Ok(stream)
    }

    /// Acknowledge `delivery`, removing it from its queue
    ///
    /// # Errors
    ///
    /// The acknowledgement failed, even after moving to a fresh channel.
    pub async fn acknowledge(&self, delivery: Delivery) -> Result<(), BrokerError> {
        let tag = delivery.tag();
        self.settle(delivery, |channel| async move { channel.ack(tag).await }.boxed())
            .await
    }

    /// Reject `delivery`, either requeueing it or letting the broker discard
    /// (or dead-letter) it
    ///
    /// # Errors
    ///
    /// The rejection failed, even after moving to a fresh channel.
    pub async fn reject(&self, delivery: Delivery, requeue: bool) -> Result<(), BrokerError> {
        let tag = delivery.tag();
        self.settle(delivery, |channel| {
            async move { channel.reject(tag, requeue).await }.boxed()
        })
        .await
    }

    /// Settle through the channel the delivery arrived on, moving over to a
    /// reopened channel once if that one has been closed
    async fn settle<'a, F>(&self, delivery: Delivery, op: F) -> Result<(), BrokerError>
    where
        F: Fn(Arc<dyn Channel>) -> BoxFuture<'a, Result<(), BrokerError>>,
    {
        let tag = delivery.tag();

        let first = {
            let _link = self.link.read().await;
            op(Arc::clone(&delivery.channel)).await
        };

        let result = match first {
            Err(err) if err.is_closed() => {
                incoming!(level = WARN, tag, "{err} before settling delivery, retrying on a new channel");

                match self.reopen(&delivery.channel).await {
                    Ok(()) => {
                        let link = self.link.read().await;
                        match current(link.as_ref()) {
                            Ok(channel) => op(channel).await,
                            Err(err) => Err(err),
                        }
                    }
                    Err(err) => Err(err),
                }
            }
            result => result,
        };

        if let Err(err) = &result {
            incoming!(level = ERROR, tag, "Unable to settle delivery: {err}");
        }

        result
    }

    /// Cancel the active consumer so the broker stops pushing deliveries
    ///
    /// Deliveries already received can still be settled afterwards.
    ///
    /// # Errors
    ///
    /// The broker refused the cancellation.
    pub async fn cancel(&self) -> Result<(), BrokerError> {
        let tag = self.consumer_tag.lock().take();
        let Some(tag) = tag else {
            return Ok(());
        };

        internal!(consumer_tag = %tag, "Cancelling consumer");

        let tag = tag.as_str();
        self.with_channel(|channel| async move { channel.cancel(tag).await }.boxed())
            .await
    }

    /// Cancel any consumer, then close the channel and the connection
    ///
    /// Safe to call any number of times; only the first call does anything.
    ///
    /// # Errors
    ///
    /// Closing the connection failed. The broker is considered closed
    /// regardless.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let link = self.link.write().await.take();
        let Some(link) = link else {
            return Ok(());
        };

        self.connected.store(false, Ordering::Release);

        let tag = self.consumer_tag.lock().take();
        if let Some(tag) = tag
            && link.channel.is_open()
            && let Err(err) = link.channel.cancel(&tag).await
        {
            internal!(level = WARN, consumer_tag = %tag, "Unable to cancel consumer: {err}");
        }

        if link.channel.is_open()
            && let Err(err) = link.channel.close().await
        {
            internal!(level = WARN, "Unable to close channel: {err}");
        }

        if link.connection.is_open() {
            link.connection.close().await?;
        }

        internal!(level = INFO, "Broker connection closed");

        Ok(())
    }
}
