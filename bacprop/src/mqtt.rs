//! MQTT ingest: subscribes to the sensor topic tree at QoS 2 and feeds
//! decoded JSON objects into a bounded channel. When the channel is full the
//! poll task stops reading, letting the broker apply QoS-2 flow control.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::config::MqttConfig;

pub const SENSOR_TOPIC_FILTER: &str = "sensor/#";

const CHANNEL_CAPACITY: usize = 64;
const STARTUP_ATTEMPTS: u32 = 10;
const KEEPALIVE: Duration = Duration::from_secs(60);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("broker unreachable after {0} connection attempts")]
    StartupBudgetExhausted(u32),
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// The stream of raw sensor records from the broker.
pub struct SensorStream {
    client: AsyncClient,
    readings: mpsc::Receiver<Map<String, Value>>,
}

impl SensorStream {
    /// Connect, subscribe, and spawn the event-loop poll task.
    ///
    /// Startup is fatal if the broker never answers within the retry budget;
    /// disconnects after that are retried forever with capped backoff.
    pub async fn connect(
        config: &MqttConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Self, StreamError> {
        let mut options = MqttOptions::new(
            format!("bacprop-{}", std::process::id()),
            &config.broker_host,
            config.broker_port,
        );
        options.set_keep_alive(KEEPALIVE);
        let (client, mut eventloop) = AsyncClient::new(options, 10);

        info!(
            broker = %config.broker_host,
            port = config.broker_port,
            "connecting to MQTT broker"
        );
        let mut attempts = 0u32;
        let mut backoff = BACKOFF_INITIAL;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("connected to MQTT broker");
                    break;
                }
                Ok(event) => trace!(?event, "mqtt event during startup"),
                Err(error) => {
                    attempts += 1;
                    if attempts >= STARTUP_ATTEMPTS {
                        return Err(StreamError::StartupBudgetExhausted(attempts));
                    }
                    warn!(%error, attempt = attempts, "broker not reachable, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
        client
            .subscribe(SENSOR_TOPIC_FILTER, QoS::ExactlyOnce)
            .await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let poll_client = client.clone();
        tokio::spawn(async move {
            let mut backoff = BACKOFF_INITIAL;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("shutdown requested, closing MQTT stream");
                            break;
                        }
                    }
                    polled = eventloop.poll() => match polled {
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            backoff = BACKOFF_INITIAL;
                            match serde_json::from_slice::<Value>(&publish.payload) {
                                Ok(Value::Object(record)) => {
                                    // Awaiting here is the back-pressure point.
                                    if tx.send(record).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(_) => warn!(
                                    topic = %publish.topic,
                                    "sensor payload is not a JSON object"
                                ),
                                Err(error) => warn!(
                                    topic = %publish.topic,
                                    %error,
                                    "could not decode sensor data"
                                ),
                            }
                        }
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            backoff = BACKOFF_INITIAL;
                            info!("reconnected to MQTT broker, renewing subscription");
                            if let Err(error) = poll_client
                                .subscribe(SENSOR_TOPIC_FILTER, QoS::ExactlyOnce)
                                .await
                            {
                                warn!(%error, "resubscription failed");
                            }
                        }
                        Ok(event) => trace!(?event, "mqtt event"),
                        Err(error) => {
                            error!(%error, "MQTT connection error, backing off");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(BACKOFF_MAX);
                        }
                    }
                }
            }
            debug!("mqtt poll task finished");
        });

        Ok(Self {
            client,
            readings: rx,
        })
    }

    /// Next decoded record; `None` once the stream has shut down.
    pub async fn next(&mut self) -> Option<Map<String, Value>> {
        self.readings.recv().await
    }

    /// Close the subscription, then the connection.
    pub async fn stop(&self) {
        if let Err(error) = self.client.unsubscribe(SENSOR_TOPIC_FILTER).await {
            debug!(%error, "unsubscribe failed during shutdown");
        }
        if let Err(error) = self.client.disconnect().await {
            debug!(%error, "disconnect failed during shutdown");
        }
    }
}
