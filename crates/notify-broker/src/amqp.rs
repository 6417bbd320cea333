//! AMQP 0-9-1 backend.
//!
//! One connection per process. Each subscription gets its own channel, a
//! durable queue `<queue_name>.<routing_key>` bound to the configured direct
//! exchange, and a consumer. Unsettled deliveries go back to the queue when
//! the channel closes, so a retired user's backlog waits for the next session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use notify_settings::BrokerSettings;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::subscription::{Broker, Delivery, DeliveryHandler, Outcome, Subscription};

const PREFETCH: u16 = 16;

pub struct AmqpBroker {
    connection: Connection,
    publish_channel: Channel,
    exchange: String,
    queue_prefix: String,
    tag_prefix: String,
    next_tag: AtomicU64,
}

impl AmqpBroker {
    pub async fn connect(
        settings: &BrokerSettings,
        connection_name: &str,
    ) -> Result<Self, BrokerError> {
        let address = SecretString::from(settings.address.clone());
        let properties =
            ConnectionProperties::default().with_connection_name(connection_name.into());
        let connection = Connection::connect(address.expose_secret(), properties)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        declare_exchange(&publish_channel, &settings.exchange_name).await?;

        Ok(Self {
            connection,
            publish_channel,
            exchange: settings.exchange_name.clone(),
            queue_prefix: settings.queue_name.clone(),
            tag_prefix: connection_name.to_string(),
            next_tag: AtomicU64::new(1),
        })
    }

    fn queue_for(&self, routing_key: &str) -> String {
        format!("{}.{}", self.queue_prefix, routing_key)
    }
}

async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<(), BrokerError> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Declare {
            what: format!("exchange {exchange}"),
            reason: e.to_string(),
        })
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn subscribe(&self, routing_key: &str) -> Result<Arc<dyn Subscription>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await?;
        declare_exchange(&channel, &self.exchange).await?;

        let queue = self.queue_for(routing_key);
        let _ = channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                what: format!("queue {queue}"),
                reason: e.to_string(),
            })?;
        channel
            .queue_bind(
                &queue,
                &self.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                what: format!("binding {queue} <- {routing_key}"),
                reason: e.to_string(),
            })?;

        let consumer_tag = format!(
            "{}.{}.{}",
            self.tag_prefix,
            routing_key,
            self.next_tag.fetch_add(1, Ordering::Relaxed)
        );
        let consumer = channel
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        debug!(%queue, %consumer_tag, "subscription opened");
        Ok(Arc::new(AmqpSubscription {
            routing_key: routing_key.to_string(),
            consumer_tag,
            channel,
            consumer: Mutex::new(Some(consumer)),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);
        let confirm = self
            .publish_channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        if confirmation.is_nack() {
            return Err(BrokerError::Publish("broker rejected the message".into()));
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "amqp"
    }
}

pub struct AmqpSubscription {
    routing_key: String,
    consumer_tag: String,
    channel: Channel,
    /// Taken by `run`; still present means the subscription never ran.
    consumer: Mutex<Option<Consumer>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl AmqpSubscription {
    async fn teardown(&self) {
        if let Err(e) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            debug!(consumer_tag = %self.consumer_tag, error = %e, "basic.cancel failed");
        }
        if let Err(e) = self.channel.close(200, "OK").await {
            debug!(consumer_tag = %self.consumer_tag, error = %e, "channel close failed");
        }
    }
}

async fn settle(acker: &Acker, tag: u64, outcome: Outcome) -> Result<(), BrokerError> {
    let result = match outcome {
        Outcome::Accept => acker.ack(BasicAckOptions::default()).await,
        Outcome::Discard => {
            acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: false,
                })
                .await
        }
        Outcome::Retry => {
            acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
        }
    };
    result.map_err(|e| BrokerError::Settle {
        tag,
        reason: e.to_string(),
    })
}

#[async_trait]
impl Subscription for AmqpSubscription {
    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    async fn run(&self, handler: &dyn DeliveryHandler) -> Result<(), BrokerError> {
        let Some(mut consumer) = self.consumer.lock().await.take() else {
            return if self.closed.load(Ordering::Acquire) {
                Ok(())
            } else {
                Err(BrokerError::AlreadyRunning)
            };
        };

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(()),
                next = consumer.next() => next,
            };
            let raw = match next {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => break Err(BrokerError::Consume(e.to_string())),
                None => break Ok(()),
            };

            let delivery = Delivery {
                tag: raw.delivery_tag,
                routing_key: raw.routing_key.as_str().to_string(),
                redelivered: raw.redelivered,
                body: Bytes::from(raw.data),
            };
            let outcome = handler.handle(&delivery).await;
            if let Err(e) = settle(&raw.acker, delivery.tag, outcome).await {
                warn!(routing_key = %self.routing_key, error = %e, "settlement failed");
                break Err(e);
            }
        };

        drop(consumer);
        self.teardown().await;
        result
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        let idle = self.consumer.lock().await.take();
        if idle.is_some() {
            drop(idle);
            self.teardown().await;
        }
        Ok(())
    }
}
