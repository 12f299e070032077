//! AMQP 0-9-1 transport backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::*,
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, warn};

use super::{
    BrokerChannel, BrokerConnection, CloseNotifier, CloseReason, CloseSignal, Connector,
    DeliveryStream,
};
use crate::error::{RideMeshError, Result};
use crate::message::{Delivery, Message};
use crate::topology::{ExchangeSpec, QueueSpec};

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ (or any AMQP 0-9-1 broker) with `lapin`
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    connection_name: String,
    prefetch_count: u16,
}

impl AmqpConnector {
    pub fn new(connection_name: impl Into<String>, prefetch_count: u16) -> Self {
        Self {
            connection_name: connection_name.into(),
            prefetch_count,
        }
    }
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self::new(format!("ridemesh-{}", uuid::Uuid::new_v4()), 10)
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        debug!(connection_name = %self.connection_name, "Dialing AMQP broker");

        let connection = Connection::connect(
            uri,
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into()),
        )
        .await?;

        let notifier = CloseNotifier::new();
        let on_error = notifier.clone();
        connection.on_error(move |err| {
            on_error.fire(CloseReason::Error(err.to_string()));
        });

        debug!("AMQP connection established");
        Ok(Arc::new(AmqpConnection {
            inner: connection,
            notifier,
            prefetch_count: self.prefetch_count,
        }))
    }
}

struct AmqpConnection {
    inner: Connection,
    notifier: CloseNotifier,
    prefetch_count: u16,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.inner.create_channel().await?;

        // Confirms let publish wait until the broker has taken the message.
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await?;

        let notifier = CloseNotifier::new();
        let on_error = notifier.clone();
        channel.on_error(move |err| {
            on_error.fire(CloseReason::Error(err.to_string()));
        });

        debug!(channel_id = channel.id(), "Created AMQP channel");
        Ok(Arc::new(AmqpChannel {
            inner: channel,
            notifier,
        }))
    }

    fn close_signal(&self) -> CloseSignal {
        self.notifier.subscribe()
    }

    fn is_open(&self) -> bool {
        !self.notifier.has_fired() && self.inner.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.notifier.fire(CloseReason::Clean);
        if self.inner.status().connected() {
            self.inner.close(REPLY_SUCCESS, "client closed").await?;
        }
        Ok(())
    }
}

struct AmqpChannel {
    inner: Channel,
    notifier: CloseNotifier,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.inner
            .exchange_declare(
                &exchange.name,
                exchange.kind.into(),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.inner
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(message.content_type.into())
            .with_delivery_mode(message.delivery_mode());

        let confirmation = self
            .inner
            .basic_publish(
                "",
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(RideMeshError::broker_error(format!(
                "broker nacked message for '{}'",
                message.routing_key
            )));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| consume_error(queue, e))?;

        let stream = consumer.map(|delivery| match delivery {
            Ok(delivery) => Ok(Delivery {
                delivery_tag: delivery.delivery_tag,
                routing_key: delivery.routing_key.as_str().to_string(),
                redelivered: delivery.redelivered,
                data: delivery.data,
            }),
            Err(e) => Err(RideMeshError::from(e)),
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    fn close_signal(&self) -> CloseSignal {
        self.notifier.subscribe()
    }

    fn is_open(&self) -> bool {
        !self.notifier.has_fired() && self.inner.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.notifier.fire(CloseReason::Clean);
        if self.inner.status().connected() {
            if let Err(e) = self.inner.close(REPLY_SUCCESS, "client closed").await {
                warn!(error = %e, "Failed to close AMQP channel");
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// NOT_FOUND on `basic_consume` means the queue is missing; retrying will not fix it.
fn consume_error(queue: &str, error: lapin::Error) -> RideMeshError {
    let not_found = matches!(
        &error,
        lapin::Error::ProtocolError(amqp_error)
            if matches!(amqp_error.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    );
    if not_found {
        RideMeshError::QueueNotFound {
            queue: queue.to_string(),
        }
    } else {
        error.into()
    }
}
