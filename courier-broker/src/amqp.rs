//! AMQP 0-9-1 over [`lapin`]

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    ConnectionProperties, ExchangeKind,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    uri::AMQPUri,
};

use crate::{BrokerError, Channel, Connection, Connector, Inbound, InboundStream, Message};

const REPLY_SUCCESS: u16 = 200;

/// Dials real brokers, negotiating `heartbeat` seconds of heartbeat
#[derive(Debug, Clone, Copy)]
pub struct LapinConnector {
    heartbeat: u16,
}

impl LapinConnector {
    pub const fn new(heartbeat: u16) -> Self {
        Self { heartbeat }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Connection>, BrokerError> {
        let mut uri = AMQPUri::from_str(uri).map_err(BrokerError::InvalidUri)?;
        uri.query.heartbeat = Some(self.heartbeat);
        let vhost = uri.vhost.clone();

        let properties = ConnectionProperties::default()
            .with_connection_name(format!("courier-{:08x}", rand::random::<u32>()).into());

        let inner = lapin::Connection::connect_uri(uri, properties).await?;

        Ok(Box::new(LapinConnection { inner, vhost }))
    }
}

struct LapinConnection {
    inner: lapin::Connection,
    vhost: String,
}

#[async_trait]
impl Connection for LapinConnection {
    fn vhost(&self) -> &str {
        &self.vhost
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let inner = self.inner.create_channel().await?;
        inner
            .basic_qos(1, BasicQosOptions { global: false })
            .await?;

        Ok(Arc::new(LapinChannel { inner }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(self.inner.close(REPLY_SUCCESS, "OK").await?)
    }
}

#[derive(Debug)]
struct LapinChannel {
    inner: lapin::Channel,
}

impl From<lapin::message::Delivery> for Inbound {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Self {
            tag: delivery.delivery_tag,
            body: delivery.data,
            properties: delivery.properties,
            redelivered: delivery.redelivered,
        }
    }
}

#[async_trait]
impl Channel for LapinChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        Ok(self
            .inner
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                arguments,
            )
            .await?)
    }

    async fn declare_queue(&self, name: &str, arguments: FieldTable) -> Result<(), BrokerError> {
        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await?;

        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        Ok(self
            .inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), BrokerError> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                message.properties.clone(),
            )
            .await?
            .await?;

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<InboundStream, BrokerError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(Inbound::from).map_err(BrokerError::from))
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        Ok(self
            .inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        Ok(self
            .inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        Ok(self
            .inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(self.inner.close(REPLY_SUCCESS, "OK").await?)
    }
}
