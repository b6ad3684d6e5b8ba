//! MQTT consumer wrapper for the snapshot trigger service.
//!
//! Owns the `rumqttc` event loop, (re)subscribes on every connection
//! acknowledgement and hands each published message to a [`MessageHandler`].

use crate::config::MqttConfig;
use backoff::{backoff::Backoff, ExponentialBackoff};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to subscribe to {topic}: {message}")]
    SubscriptionError { topic: String, message: String },

    #[error("Message processing error: {0}")]
    ProcessingError(String),

    #[error("Consumer already running")]
    AlreadyRunning,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Raw message payload
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

/// Handler trait for processing messages
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError>;

    /// Called when message processing fails
    async fn on_error(&self, message: IncomingMessage, error: ConsumerError) {
        warn!(topic = %message.topic, error = %error, "Message processing failed");
    }
}

/// High-level MQTT consumer
pub struct MqttConsumer {
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    config: MqttConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl MqttConsumer {
    /// Create a consumer; the connection is established by [`MqttConsumer::run`]
    pub fn new(config: MqttConfig) -> Self {
        info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "Creating MQTT consumer"
        );

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive());
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            config,
            shutdown_tx,
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown to stop consuming
    pub fn shutdown(&self) {
        info!("Signaling consumer shutdown");
        let _ = self.shutdown_tx.send(());
    }

    fn subscribe(&self) -> Result<(), ConsumerError> {
        self.client
            .try_subscribe(self.config.topic_filter.as_str(), QoS::AtMostOnce)
            .map_err(|e| ConsumerError::SubscriptionError {
                topic: self.config.topic_filter.clone(),
                message: e.to_string(),
            })
    }

    /// Consume messages until shutdown, handing each to `handler`.
    ///
    /// Connection errors are logged and retried with exponential backoff;
    /// they never end the loop.
    #[instrument(skip(self, handler), fields(host = %self.config.host, port = self.config.port))]
    pub async fn run<H: MessageHandler>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        let mut eventloop = self
            .eventloop
            .lock()
            .await
            .take()
            .ok_or(ConsumerError::AlreadyRunning)?;
        let mut shutdown_rx = self.shutdown_receiver();
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.reconnect_base_delay(),
            max_interval: self.config.reconnect_max_delay(),
            max_elapsed_time: None,
            ..Default::default()
        };

        info!("Starting message consumption loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            info!(code = ?ack.code, "Connected to MQTT broker");
                            backoff.reset();
                            if let Err(e) = self.subscribe() {
                                error!(error = %e, "Subscription failed");
                            } else {
                                info!(topic = %self.config.topic_filter, "Subscribed");
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let incoming = IncomingMessage {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                                qos: publish.qos as u8,
                                retain: publish.retain,
                            };

                            debug!(
                                topic = %incoming.topic,
                                size_bytes = incoming.payload.len(),
                                "Received message"
                            );

                            if let Err(e) = handler.handle(incoming.clone()).await {
                                handler.on_error(incoming, e).await;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let delay = backoff
                                .next_backoff()
                                .unwrap_or_else(|| self.config.reconnect_max_delay());
                            warn!(
                                error = %e,
                                delay_ms = delay.as_millis() as u64,
                                "MQTT connection error, reconnecting"
                            );
                            tokio::select! {
                                _ = shutdown_rx.recv() => {
                                    info!("Received shutdown signal");
                                    break;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "Disconnect request not delivered");
        }

        Ok(())
    }
}
