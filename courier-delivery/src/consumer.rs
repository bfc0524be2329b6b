//! The queue consumer
//!
//! One task pulls deliveries one at a time (the channel has a prefetch of
//! one), runs each through the [`Mailer`], and settles it before asking for
//! the next:
//!
//! ```text
//! Listening -> Handling -> Listening
//!     |                        |
//!     +-- shutdown --> Draining --> Closed
//! ```
//!
//! Shutdown cancels the subscription straight away, so nothing new arrives
//! while draining, but a message being handled is always finished and
//! settled first.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use courier_broker::{Broker, BrokerError, Delivery, DeliveryStream};
use courier_common::{Signal, incoming, internal};
use courier_mailer::{Mailer, ProcessError};
use courier_metrics::Metrics;
use futures_util::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, watch};

use crate::{
    DeliveryError,
    retry::{Decision, Outcome, RetryPolicy},
};

mod defaults {
    pub fn exchange() -> String {
        String::from("mailer")
    }

    pub fn queue() -> String {
        String::from("mailer")
    }

    pub fn retry_interval() -> String {
        String::from("1h")
    }

    pub const fn max_retry() -> u32 {
        3
    }

    pub const fn resubscribe_delay_secs() -> u64 {
        60
    }
}

fn done_channel() -> watch::Sender<bool> {
    watch::channel(false).0
}

/// Resolves once the consumer has drained and closed the broker
#[derive(Debug, Clone)]
pub struct Done {
    receiver: watch::Receiver<bool>,
}

impl Done {
    pub fn is_done(&self) -> bool {
        *self.receiver.borrow()
    }

    pub async fn wait(mut self) {
        // A dropped consumer is as done as it will ever be
        let _ = self.receiver.wait_for(|done| *done).await;
    }
}

/// Consumes mail requests from a queue
///
/// # Example
///
/// ```ron
/// consumer: (
///     exchange: "mailer",
///     queue: "mailer",
///     retry_interval: "30m",
///     max_retry: 5,
/// ),
/// ```
#[derive(Deserialize)]
pub struct Consumer {
    #[serde(default = "defaults::exchange")]
    pub exchange: String,

    #[serde(default = "defaults::queue")]
    pub queue: String,

    #[serde(default)]
    pub routing_key: String,

    /// How long a failed message waits before it is tried again, e.g. `"1h"`
    ///
    /// `"0s"` disables retries: failed messages are dropped straight away.
    #[serde(default = "defaults::retry_interval")]
    pub retry_interval: String,

    /// Delays a message may have before a further failure drops it
    #[serde(default = "defaults::max_retry")]
    pub max_retry: u32,

    /// A random tag is generated when unset
    #[serde(default)]
    pub consumer_tag: Option<String>,

    /// How long to wait before subscribing again after the broker ended the
    /// subscription
    #[serde(default = "defaults::resubscribe_delay_secs")]
    pub resubscribe_delay_secs: u64,

    #[serde(skip)]
    broker: Option<Arc<Broker>>,

    #[serde(skip)]
    mailer: Option<Arc<Mailer>>,

    #[serde(skip)]
    metrics: Option<Arc<Metrics>>,

    #[serde(skip)]
    policy: RetryPolicy,

    #[serde(skip)]
    listening: AtomicBool,

    #[serde(skip, default = "done_channel")]
    done: watch::Sender<bool>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("retry_interval", &self.retry_interval)
            .field("max_retry", &self.max_retry)
            .field("policy", &self.policy)
            .field("listening", &self.is_listening())
            .finish_non_exhaustive()
    }
}

impl Default for Consumer {
    fn default() -> Self {
        Self {
            exchange: defaults::exchange(),
            queue: defaults::queue(),
            routing_key: String::new(),
            retry_interval: defaults::retry_interval(),
            max_retry: defaults::max_retry(),
            consumer_tag: None,
            resubscribe_delay_secs: defaults::resubscribe_delay_secs(),
            broker: None,
            mailer: None,
            metrics: None,
            policy: RetryPolicy::default(),
            listening: AtomicBool::new(false),
            done: done_channel(),
        }
    }
}

impl Consumer {
    /// # Errors
    ///
    /// `retry_interval` is not a valid duration.
    pub fn retry_interval(&self) -> Result<Duration, DeliveryError> {
        humantime::parse_duration(&self.retry_interval).map_err(|source| {
            DeliveryError::RetryInterval {
                value: self.retry_interval.clone(),
                source,
            }
        })
    }

    pub const fn resubscribe_delay(&self) -> Duration {
        Duration::from_secs(self.resubscribe_delay_secs)
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether a subscription is currently active
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn done(&self) -> Done {
        Done {
            receiver: self.done.subscribe(),
        }
    }

    /// Declare the queue topology and take hold of the collaborators
    ///
    /// # Errors
    ///
    /// `retry_interval` is invalid or the broker refused a declaration.
    /// Either should stop the process from starting.
    pub async fn init(
        &mut self,
        broker: Arc<Broker>,
        mailer: Arc<Mailer>,
        metrics: Arc<Metrics>,
    ) -> Result<(), DeliveryError> {
        internal!("Initialising consumer ...");

        let interval = self.retry_interval()?;
        let delay = broker
            .configure_consumer(&self.queue, &self.exchange, &self.routing_key, interval)
            .await?;

        self.policy = RetryPolicy::new(delay, self.max_retry);
        self.broker = Some(broker);
        self.mailer = Some(mailer);
        self.metrics = Some(metrics);

        internal!(
            level = INFO,
            queue = %self.queue,
            exchange = %self.exchange,
            retry_interval = %self.retry_interval,
            max_retry = self.max_retry,
            "Consumer initialised"
        );

        Ok(())
    }

    /// Consume until told to shut down
    ///
    /// On shutdown the subscription is cancelled, the broker connection is
    /// closed and [`Consumer::done`] resolves.
    ///
    /// # Errors
    ///
    /// The consumer was not initialised, the first subscription failed, or
    /// the broker was closed from elsewhere.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), DeliveryError> {
        let (Some(broker), Some(mailer), Some(metrics)) =
            (&self.broker, &self.mailer, &self.metrics)
        else {
            self.done.send_replace(true);
            return Err(DeliveryError::NotInitialised);
        };

        internal!("Consumer starting");

        let result = self.listen(broker, mailer, metrics, &mut shutdown).await;
        self.listening.store(false, Ordering::Release);

        if let Err(err) = &result {
            internal!(level = ERROR, "Consumer stopped: {err}");
        }

        if let Err(err) = broker.cancel().await {
            internal!(level = WARN, "Unable to cancel consumer: {err}");
        }

        if let Err(err) = broker.close().await {
            internal!(level = WARN, "Unable to close broker connection: {err}");
        }

        self.done.send_replace(true);
        internal!(level = INFO, "Consumer shutdown complete");

        result
    }

    async fn listen(
        &self,
        broker: &Broker,
        mailer: &Mailer,
        metrics: &Metrics,
        shutdown: &mut broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        let mut stream = broker
            .consume(&self.queue, self.consumer_tag.as_deref())
            .await?;
        self.listening.store(true, Ordering::Release);

        loop {
            tokio::select! {
                biased;

                sig = shutdown.recv() => {
                    Self::stop_consuming(broker, sig).await;
                    return Ok(());
                }

                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        let handling = self.handle(broker, mailer, metrics, delivery);
                        tokio::pin!(handling);

                        tokio::select! {
                            biased;

                            _ = &mut handling => {}

                            sig = shutdown.recv() => {
                                Self::stop_consuming(broker, sig).await;
                                handling.await;
                                return Ok(());
                            }
                        }
                    }
                    Some(Err(err)) => {
                        incoming!(level = WARN, "Delivery failed: {err}");
                    }
                    None => {
                        self.listening.store(false, Ordering::Release);

                        let Some(next) = self.resubscribe(broker, shutdown).await? else {
                            return Ok(());
                        };

                        stream = next;
                        self.listening.store(true, Ordering::Release);
                    }
                },
            }
        }
    }

    /// Cancel the subscription as soon as shutdown is requested
    async fn stop_consuming(broker: &Broker, signal: Result<Signal, broadcast::error::RecvError>) {
        match signal {
            Ok(Signal::Shutdown | Signal::Finalised) => {
                internal!("Consumer received shutdown signal");
            }
            Err(e) => {
                internal!(level = ERROR, "Consumer shutdown channel error: {e}");
            }
        }

        if let Err(err) = broker.cancel().await {
            internal!(level = WARN, "Unable to cancel consumer: {err}");
        }
    }

    /// Wait, recover the channel, and subscribe again, until that works or
    /// shutdown is requested
    async fn resubscribe(
        &self,
        broker: &Broker,
        shutdown: &mut broadcast::Receiver<Signal>,
    ) -> Result<Option<DeliveryStream>, DeliveryError> {
        loop {
            internal!(
                level = WARN,
                "Subscription to {} ended, resubscribing in {:?}",
                self.queue,
                self.resubscribe_delay()
            );

            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    internal!("Consumer received shutdown signal while resubscribing");
                    return Ok(None);
                }

                () = tokio::time::sleep(self.resubscribe_delay()) => {}
            }

            match broker.recover().await {
                Ok(()) => {}
                Err(BrokerError::Closed) => return Err(BrokerError::Closed.into()),
                Err(err) => {
                    internal!(level = ERROR, "Unable to recover broker connection: {err}");
                    continue;
                }
            }

            match broker
                .consume(&self.queue, self.consumer_tag.as_deref())
                .await
            {
                Ok(stream) => {
                    internal!(level = INFO, "Resubscribed to {}", self.queue);
                    return Ok(Some(stream));
                }
                Err(err) => {
                    internal!(level = ERROR, "Unable to resubscribe: {err}");
                }
            }
        }
    }

    async fn handle(
        &self,
        broker: &Broker,
        mailer: &Mailer,
        metrics: &Metrics,
        delivery: Delivery,
    ) -> Outcome {
        let started = Instant::now();
        let sha = hex::encode(Sha256::digest(delivery.body()));

        incoming!(sha = %sha, tag = delivery.tag(), "Received message");

        let outcome = match mailer.process(delivery.body()).await {
            Ok(()) => {
                incoming!(level = INFO, sha = %sha, "Delivered message");
                let _ = broker.acknowledge(delivery).await;
                Outcome::Delivered
            }
            Err(err) if err.is_permanent() => {
                incoming!(level = ERROR, sha = %sha, "Rejecting message: {err}");
                let _ = broker.reject(delivery, false).await;
                Outcome::Rejected
            }
            Err(err) => self.retry(broker, delivery, &sha, &err).await,
        };

        let elapsed = started.elapsed().as_secs_f64();
        match outcome {
            Outcome::Delivered => metrics.consumer.record_delivered(elapsed),
            Outcome::Delayed => metrics.consumer.record_delayed(elapsed),
            Outcome::Rejected => metrics.consumer.record_rejected(elapsed),
            Outcome::Dropped => metrics.consumer.record_dropped(elapsed),
        }

        outcome
    }

    /// Settle a message whose processing failed, but might not next time
    async fn retry(
        &self,
        broker: &Broker,
        delivery: Delivery,
        sha: &str,
        err: &ProcessError,
    ) -> Outcome {
        match self.policy.classify(delivery.headers()) {
            Decision::Drop => {
                incoming!(
                    level = ERROR,
                    sha,
                    content = %String::from_utf8_lossy(delivery.body()),
                    "Dropping message, no retries left: {err}"
                );
                let _ = broker.acknowledge(delivery).await;
                Outcome::Dropped
            }
            Decision::Delay(exchange) => {
                incoming!(level = WARN, sha, "Delaying message: {err}");

                match broker
                    .publish(exchange, &self.routing_key, &delivery.to_message())
                    .await
                {
                    Ok(()) => {
                        let _ = broker.acknowledge(delivery).await;
                        Outcome::Delayed
                    }
                    Err(publish) => {
                        incoming!(
                            level = ERROR,
                            sha,
                            "Unable to delay message, rejecting it: {publish}"
                        );
                        let _ = broker.reject(delivery, false).await;
                        Outcome::Rejected
                    }
                }
            }
        }
    }
}
