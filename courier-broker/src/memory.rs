//! An in-process broker
//!
//! Implements just enough of AMQP's model for the consumer to be exercised
//! end to end: direct exchanges, durable queues, prefetch of one,
//! acknowledgement, per-queue message TTL and dead-lettering with `x-death`
//! bookkeeping. Channels and connections can be closed from the outside to
//! simulate a broker or network failure.

use std::{
    collections::{HashMap, VecDeque},
    future,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    uri::AMQPUri,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    BrokerError, Channel, Connection, Connector, Inbound, InboundStream, Message,
    topology::{DEAD_LETTER_EXCHANGE, MESSAGE_TTL},
};

pub const X_DEATH: &str = "x-death";

#[derive(Debug, Default)]
struct Exchange {
    arguments: FieldTable,
    bindings: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Queue {
    arguments: FieldTable,
    ready: VecDeque<Stored>,
}

#[derive(Debug, Clone)]
struct Stored {
    id: u64,
    exchange: String,
    routing_key: String,
    message: Message,
    redelivered: bool,
}

#[derive(Debug)]
struct Subscription {
    tag: String,
    queue: String,
    channel: u64,
    /// `None` once cancelled
    sender: Option<mpsc::UnboundedSender<Result<Inbound, BrokerError>>>,
    unacked: Option<(u64, Stored)>,
}

#[derive(Debug)]
struct Expiry {
    queue: String,
    id: u64,
    ttl: Duration,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    subscriptions: Vec<Subscription>,
    /// Connection id to whether it is open
    connections: HashMap<u64, bool>,
    /// Channel id to its connection id, and whether it is open
    channels: HashMap<u64, (u64, bool)>,
    next_id: u64,
    next_delivery_tag: u64,
    expiries: Vec<Expiry>,
    refuse_dials: bool,
    stall_dials: bool,
    dials: usize,
    channels_opened: usize,
    published: Vec<(String, String, Message)>,
    acks: usize,
    rejects: usize,
}

fn field<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    table.inner().get(&ShortString::from(key))
}

fn string_field(table: &FieldTable, key: &str) -> Option<String> {
    match field(table, key)? {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        AMQPValue::ShortString(value) => Some(value.as_str().to_string()),
        _ => None,
    }
}

fn integer_field(table: &FieldTable, key: &str) -> Option<i64> {
    match field(table, key)? {
        AMQPValue::ShortShortInt(value) => Some(i64::from(*value)),
        AMQPValue::ShortShortUInt(value) => Some(i64::from(*value)),
        AMQPValue::ShortInt(value) => Some(i64::from(*value)),
        AMQPValue::ShortUInt(value) => Some(i64::from(*value)),
        AMQPValue::LongInt(value) => Some(i64::from(*value)),
        AMQPValue::LongUInt(value) => Some(i64::from(*value)),
        AMQPValue::LongLongInt(value) => Some(*value),
        _ => None,
    }
}

fn ttl(arguments: &FieldTable) -> Option<Duration> {
    integer_field(arguments, MESSAGE_TTL)
        .and_then(|ms| u64::try_from(ms).ok())
        .map(Duration::from_millis)
}

/// Record a dead-lettering in the `x-death` header the way RabbitMQ does:
/// one entry per (queue, reason), most recent first, with a running count.
fn record_death(properties: &BasicProperties, stored: &Stored, queue: &str, reason: &str) -> BasicProperties {
    let mut headers = properties.headers().clone().unwrap_or_default();

    let mut deaths = match field(&headers, X_DEATH) {
        Some(AMQPValue::FieldArray(deaths)) => deaths.as_slice().to_vec(),
        _ => Vec::new(),
    };

    let previous = deaths.iter().position(|death| {
        matches!(death, AMQPValue::FieldTable(death)
            if string_field(death, "queue").as_deref() == Some(queue)
                && string_field(death, "reason").as_deref() == Some(reason))
    });

    let count = previous
        .map(|index| deaths.remove(index))
        .and_then(|death| match death {
            AMQPValue::FieldTable(death) => integer_field(&death, "count"),
            _ => None,
        })
        .unwrap_or(0);

    let mut death = FieldTable::default();
    death.insert("count".into(), AMQPValue::LongLongInt(count + 1));
    death.insert("reason".into(), AMQPValue::LongString(LongString::from(reason)));
    death.insert("queue".into(), AMQPValue::LongString(LongString::from(queue)));
    death.insert(
        "exchange".into(),
        AMQPValue::LongString(LongString::from(stored.exchange.as_str())),
    );
    death.insert(
        "routing-keys".into(),
        AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::LongString(
            LongString::from(stored.routing_key.as_str()),
        )])),
    );

    deaths.insert(0, AMQPValue::FieldTable(death));
    headers.insert(X_DEATH.into(), AMQPValue::FieldArray(FieldArray::from(deaths)));

    properties.clone().with_headers(headers)
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> Result<(), BrokerError> {
        match self.channels.get(&channel) {
            Some((connection, true)) if self.connections.get(connection) == Some(&true) => Ok(()),
            _ => Err(BrokerError::ChannelClosed),
        }
    }

    fn enqueue(&mut self, queue: &str, stored: Stored) {
        let Some(target) = self.queues.get_mut(queue) else {
            return;
        };

        if let Some(ttl) = ttl(&target.arguments) {
            self.expiries.push(Expiry {
                queue: queue.to_string(),
                id: stored.id,
                ttl,
            });
        }

        target.ready.push_back(stored);
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: Message) -> Result<(), BrokerError> {
        let queues: Vec<String> = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::Protocol(format!("NOT_FOUND - no exchange '{exchange}'")))?
            .bindings
            .iter()
            .filter(|(_, key)| key == routing_key)
            .map(|(queue, _)| queue.clone())
            .collect();

        for queue in queues {
            let stored = Stored {
                id: self.next_id(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message: message.clone(),
                redelivered: false,
            };
            self.enqueue(&queue, stored);
        }

        Ok(())
    }

    fn dead_letter(&mut self, queue: &str, stored: &Stored, reason: &str) {
        let Some(target) = self
            .queues
            .get(queue)
            .and_then(|queue| string_field(&queue.arguments, DEAD_LETTER_EXCHANGE))
        else {
            return;
        };

        let message = Message {
            body: stored.message.body.clone(),
            properties: record_death(&stored.message.properties, stored, queue, reason),
        };

        // Unroutable dead letters are dropped, as they are by a real broker
        let _ = self.route(&target, &stored.routing_key, message);
    }

    fn requeue(&mut self, queue: &str, mut stored: Stored) {
        stored.redelivered = true;
        if let Some(queue) = self.queues.get_mut(queue) {
            queue.ready.push_front(stored);
        }
    }

    fn expire(&mut self, queue: &str, id: u64) {
        let Some(stored) = self.queues.get_mut(queue).and_then(|target| {
            let index = target.ready.iter().position(|stored| stored.id == id)?;
            target.ready.remove(index)
        }) else {
            return;
        };

        self.dead_letter(queue, &stored, "expired");
        self.dispatch();
    }

    /// Hand ready messages to idle subscriptions, one at a time each
    fn dispatch(&mut self) {
        let mut index = 0;

        while index < self.subscriptions.len() {
            let subscription = &self.subscriptions[index];
            let idle = subscription.sender.is_some()
                && subscription.unacked.is_none()
                && self.channel_open(subscription.channel).is_ok();

            let next = if idle {
                self.queues
                    .get_mut(&subscription.queue)
                    .and_then(|queue| queue.ready.pop_front())
            } else {
                None
            };

            let Some(stored) = next else {
                index += 1;
                continue;
            };

            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let inbound = Inbound {
                tag,
                body: stored.message.body.clone(),
                properties: stored.message.properties.clone(),
                redelivered: stored.redelivered,
            };

            let subscription = &mut self.subscriptions[index];
            let delivered = subscription
                .sender
                .as_ref()
                .is_some_and(|sender| sender.send(Ok(inbound)).is_ok());

            if delivered {
                subscription.unacked = Some((tag, stored));
            } else {
                subscription.sender = None;
                let queue = subscription.queue.clone();
                self.requeue(&queue, stored);
            }

            index += 1;
        }
    }

    fn close_channel(&mut self, channel: u64) {
        if let Some((_, open)) = self.channels.get_mut(&channel) {
            *open = false;
        }

        let (closed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.subscriptions)
            .into_iter()
            .partition(|subscription| subscription.channel == channel);
        self.subscriptions = kept;

        for subscription in closed {
            if let Some((_, stored)) = subscription.unacked {
                self.requeue(&subscription.queue, stored);
            }
        }

        self.dispatch();
    }

    fn close_connection(&mut self, connection: u64) {
        if let Some(open) = self.connections.get_mut(&connection) {
            *open = false;
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, (owner, open))| *owner == connection && *open)
            .map(|(id, _)| *id)
            .collect();

        for channel in channels {
            self.close_channel(channel);
        }
    }

    fn settle(&mut self, channel: u64, tag: u64) -> Result<(String, Stored), BrokerError> {
        self.channel_open(channel)?;

        let index = self
            .subscriptions
            .iter()
            .position(|subscription| {
                subscription.channel == channel
                    && subscription.unacked.as_ref().is_some_and(|(unacked, _)| *unacked == tag)
            })
            .ok_or_else(|| BrokerError::Protocol(format!("PRECONDITION_FAILED - unknown delivery tag {tag}")))?;

        let subscription = &mut self.subscriptions[index];
        let queue = subscription.queue.clone();
        let stored = subscription
            .unacked
            .take()
            .map(|(_, stored)| stored)
            .ok_or(BrokerError::ChannelClosed)?;

        if subscription.sender.is_none() {
            self.subscriptions.remove(index);
        }

        Ok((queue, stored))
    }
}

/// Run `f` against the state, then arm timers for anything it queued with a
/// TTL
fn with_state<T>(state: &Arc<Mutex<State>>, f: impl FnOnce(&mut State) -> T) -> T {
    let (result, expiries) = {
        let mut guard = state.lock();
        let result = f(&mut guard);
        (result, std::mem::take(&mut guard.expiries))
    };

    for expiry in expiries {
        schedule(state, expiry);
    }

    result
}

fn schedule(state: &Arc<Mutex<State>>, expiry: Expiry) {
    let state = Arc::clone(state);

    tokio::spawn(async move {
        tokio::time::sleep(expiry.ttl).await;
        with_state(&state, |state| state.expire(&expiry.queue, expiry.id));
    });
}

/// A broker living entirely in memory
///
/// Cloning gives another handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish as an outside producer would
    ///
    /// # Errors
    ///
    /// The exchange does not exist.
    pub fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<(), BrokerError> {
        with_state(&self.state, |state| {
            state.route(exchange, routing_key, message)?;
            state.dispatch();
            Ok(())
        })
    }

    /// Messages published to `exchange` through a channel, oldest first
    pub fn published(&self, exchange: &str) -> Vec<Message> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(target, _, _)| target == exchange)
            .map(|(_, _, message)| message.clone())
            .collect()
    }

    /// Messages waiting in `queue`, not counting unacknowledged ones
    pub fn ready(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.ready.len())
    }

    /// Deliveries handed out and not yet settled
    pub fn unacked(&self) -> usize {
        self.state
            .lock()
            .subscriptions
            .iter()
            .filter(|subscription| subscription.unacked.is_some())
            .count()
    }

    pub fn acks(&self) -> usize {
        self.state.lock().acks
    }

    pub fn rejects(&self) -> usize {
        self.state.lock().rejects
    }

    pub fn dials(&self) -> usize {
        self.state.lock().dials
    }

    pub fn channels_opened(&self) -> usize {
        self.state.lock().channels_opened
    }

    /// Connections dialled and not yet closed
    pub fn open_connections(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|open| **open)
            .count()
    }

    pub fn consumers(&self, queue: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .iter()
            .filter(|subscription| subscription.queue == queue && subscription.sender.is_some())
            .count()
    }

    pub fn exchange_arguments(&self, exchange: &str) -> Option<FieldTable> {
        self.state
            .lock()
            .exchanges
            .get(exchange)
            .map(|exchange| exchange.arguments.clone())
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<FieldTable> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.arguments.clone())
    }

    /// `(queue, routing key)` pairs bound to `exchange`
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .exchanges
            .get(exchange)
            .map(|exchange| exchange.bindings.clone())
            .unwrap_or_default()
    }

    /// Close every open channel, as the broker does on a channel error
    pub fn close_channels(&self) {
        with_state(&self.state, |state| {
            let open: Vec<u64> = state
                .channels
                .iter()
                .filter(|(_, (_, open))| *open)
                .map(|(id, _)| *id)
                .collect();

            for channel in open {
                state.close_channel(channel);
            }
        });
    }

    /// Drop every connection, as a network failure would
    pub fn close_connections(&self) {
        with_state(&self.state, |state| {
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, open)| **open)
                .map(|(id, _)| *id)
                .collect();

            for connection in open {
                state.close_connection(connection);
            }
        });
    }

    /// Fail every dial until called again with `false`
    pub fn refuse_dials(&self, refuse: bool) {
        self.state.lock().refuse_dials = refuse;
    }

    /// Never complete a dial until called again with `false`
    pub fn stall_dials(&self, stall: bool) {
        self.state.lock().stall_dials = stall;
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Connection>, BrokerError> {
        let uri = AMQPUri::from_str(uri).map_err(BrokerError::InvalidUri)?;

        let (stall, refuse) = {
            let state = self.state.lock();
            (state.stall_dials, state.refuse_dials)
        };

        if stall {
            future::pending::<()>().await;
        }

        if refuse {
            return Err(BrokerError::ConnectionClosed);
        }

        let id = {
            let mut state = self.state.lock();
            state.dials += 1;
            let id = state.next_id();
            state.connections.insert(id, true);
            id
        };

        Ok(Box::new(MemoryConnection {
            id,
            vhost: uri.vhost,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    vhost: String,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn vhost(&self) -> &str {
        &self.vhost
    }

    fn is_open(&self) -> bool {
        self.state.lock().connections.get(&self.id) == Some(&true)
    }

    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut state = self.state.lock();

        if state.connections.get(&self.id) != Some(&true) {
            return Err(BrokerError::ConnectionClosed);
        }

        let id = state.next_id();
        state.channels.insert(id, (self.id, true));
        state.channels_opened += 1;

        Ok(Arc::new(MemoryChannel {
            id,
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        with_state(&self.state, |state| state.close_connection(self.id));
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.state.lock().channel_open(self.id).is_ok()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.channel_open(self.id)?;

        state
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| Exchange {
                arguments,
                bindings: Vec::new(),
            });

        Ok(())
    }

    async fn declare_queue(&self, name: &str, arguments: FieldTable) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.channel_open(self.id)?;

        state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Queue {
                arguments,
                ready: VecDeque::new(),
            });

        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.channel_open(self.id)?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Protocol(format!("NOT_FOUND - no queue '{queue}'")));
        }

        let bindings = &mut state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::Protocol(format!("NOT_FOUND - no exchange '{exchange}'")))?
            .bindings;

        let binding = (queue.to_string(), routing_key.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), BrokerError> {
        with_state(&self.state, |state| {
            state.channel_open(self.id)?;
            state.route(exchange, routing_key, message.clone())?;
            state
                .published
                .push((exchange.to_string(), routing_key.to_string(), message.clone()));
            state.dispatch();
            Ok(())
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<InboundStream, BrokerError> {
        let (sender, receiver) = mpsc::unbounded_channel();

        with_state(&self.state, |state| {
            state.channel_open(self.id)?;

            if !state.queues.contains_key(queue) {
                return Err(BrokerError::Protocol(format!("NOT_FOUND - no queue '{queue}'")));
            }

            if state
                .subscriptions
                .iter()
                .any(|subscription| subscription.channel == self.id && subscription.tag == consumer_tag)
            {
                return Err(BrokerError::Protocol(format!(
                    "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
                )));
            }

            state.subscriptions.push(Subscription {
                tag: consumer_tag.to_string(),
                queue: queue.to_string(),
                channel: self.id,
                sender: Some(sender),
                unacked: None,
            });
            state.dispatch();

            Ok(())
        })?;

        Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        with_state(&self.state, |state| {
            state.settle(self.id, delivery_tag)?;
            state.acks += 1;
            state.dispatch();
            Ok(())
        })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        with_state(&self.state, |state| {
            let (queue, stored) = state.settle(self.id, delivery_tag)?;
            state.rejects += 1;

            if requeue {
                state.requeue(&queue, stored);
            } else {
                state.dead_letter(&queue, &stored, "rejected");
            }

            state.dispatch();
            Ok(())
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        with_state(&self.state, |state| {
            state.channel_open(self.id)?;

            if let Some(subscription) = state
                .subscriptions
                .iter_mut()
                .find(|subscription| subscription.channel == self.id && subscription.tag == consumer_tag)
            {
                subscription.sender = None;
            }

            state.subscriptions.retain(|subscription| {
                subscription.sender.is_some() || subscription.unacked.is_some()
            });

            Ok(())
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        with_state(&self.state, |state| state.close_channel(self.id));
        Ok(())
    }
}
