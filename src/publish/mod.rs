//! Concurrent publishing of decoded measurements to broker targets.
//!
//! Every broker target of a device is served by its own branch: connect,
//! publish to each topic concurrently, disconnect. A failure in one branch
//! (or one topic) is logged and never affects its siblings, and nothing is
//! retried.

pub mod mqtt;

use crate::device::BrokerTarget;
use crate::mac_address::MacAddress;
use crate::measurement::Measurements;
use futures::future::{BoxFuture, join_all};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Upper bound for each connect, publish and disconnect operation.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker connection or publish failure.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("cannot connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("cannot publish to \"{topic}\": {reason}")]
    Publish { topic: String, reason: String },
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// An established connection to one broker.
pub trait BrokerSession: Send + Sync {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Flush pending publishes and disconnect.
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>>;
}

/// Opens broker sessions. Abstracted so fan-out can be tested without a broker.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        client_id: &'a str,
        target: &'a BrokerTarget,
    ) -> BoxFuture<'a, Result<Box<dyn BrokerSession>, TransportError>>;
}

/// Measurements of one frame, ready to be published.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub device: MacAddress,
    /// Append the device address to every topic.
    pub promiscuous: bool,
    pub brokers: Arc<[BrokerTarget]>,
    pub measurements: Measurements,
}

/// Outcome of one fan-out, mostly for tests and diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// Topic publishes that were handed to a connected broker.
    pub published: usize,
    /// Failed branches: a broker connection or a single topic publish.
    pub failed: usize,
}

impl PublishReport {
    fn merge(mut self, other: PublishReport) -> Self {
        self.published += other.published;
        self.failed += other.failed;
        self
    }
}

/// Resolve the topic actually published to, collapsing repeated `/`.
pub fn full_topic(topic: &str, device: &MacAddress, promiscuous: bool) -> String {
    let topic = if promiscuous {
        format!("{topic}/{}", device.compact())
    } else {
        topic.to_string()
    };

    let mut collapsed = String::with_capacity(topic.len());
    for c in topic.chars() {
        if c == '/' && collapsed.ends_with('/') {
            continue;
        }
        collapsed.push(c);
    }
    collapsed
}

fn client_id(device: &MacAddress) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("bthome-{}-{}", device.compact(), &suffix[..8])
}

/// Publishes deliveries to every broker target of a device.
#[derive(Clone)]
pub struct Publisher {
    connector: Arc<dyn Connector>,
    timeout: Duration,
}

impl Publisher {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            timeout: PUBLISH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Publish `delivery` to all of its broker targets concurrently.
    pub async fn publish(&self, delivery: &Delivery) -> PublishReport {
        let device = delivery.device.compact();
        if delivery.measurements.is_empty() {
            warn!("({device} => broker) No measurements to publish.");
            return PublishReport::default();
        }

        let payload = match delivery.measurements.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!("({device} => broker) Cannot serialize measurements. {e}.");
                return PublishReport::default();
            }
        };

        join_all(
            delivery
                .brokers
                .iter()
                .map(|broker| self.publish_to_broker(delivery, broker, payload.as_bytes())),
        )
        .await
        .into_iter()
        .fold(PublishReport::default(), PublishReport::merge)
    }

    async fn publish_to_broker(
        &self,
        delivery: &Delivery,
        broker: &BrokerTarget,
        payload: &[u8],
    ) -> PublishReport {
        let tag = format!("({} => {})", delivery.device.compact(), broker.host);
        debug!(
            "{tag} Connecting ({} encryption, {}{} authentication) to MQTT broker \"{}:{}\".",
            if broker.use_tls { "with" } else { "without" },
            if broker.use_tls && broker.allow_insecure_tls {
                "insecure, "
            } else {
                ""
            },
            if broker.has_credentials() {
                "with"
            } else {
                "without"
            },
            broker.host,
            broker.port
        );

        let client_id = client_id(&delivery.device);
        let session = match timeout(self.timeout, self.connector.connect(&client_id, broker)).await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                error!("{tag} MQTT connect error. {e}.");
                return PublishReport {
                    published: 0,
                    failed: 1,
                };
            }
            Err(_) => {
                error!(
                    "{tag} MQTT connect error. {}.",
                    TransportError::Timeout(self.timeout)
                );
                return PublishReport {
                    published: 0,
                    failed: 1,
                };
            }
        };

        let tag = &tag;
        let connected = &*session;
        let report = join_all(broker.topics.iter().map(|topic| async move {
            let topic = full_topic(topic, &delivery.device, delivery.promiscuous);
            debug!(
                "{tag} MQTT publishment with payload '{}' to topic \"{topic}\".",
                String::from_utf8_lossy(payload)
            );
            match timeout(self.timeout, connected.publish(&topic, payload)).await {
                Ok(Ok(())) => {
                    debug!("{tag} Successful MQTT publishment to topic \"{topic}\".");
                    PublishReport {
                        published: 1,
                        failed: 0,
                    }
                }
                Ok(Err(e)) => {
                    error!("{tag} MQTT publish error. {e}.");
                    PublishReport {
                        published: 0,
                        failed: 1,
                    }
                }
                Err(_) => {
                    error!(
                        "{tag} MQTT publish error. {}.",
                        TransportError::Timeout(self.timeout)
                    );
                    PublishReport {
                        published: 0,
                        failed: 1,
                    }
                }
            }
        }))
        .await
        .into_iter()
        .fold(PublishReport::default(), PublishReport::merge);

        match timeout(self.timeout, session.close()).await {
            Ok(Ok(())) => debug!("{tag} Done with MQTT broker."),
            Ok(Err(e)) => error!("{tag} MQTT disconnect error. {e}."),
            Err(_) => error!(
                "{tag} MQTT disconnect error. {}.",
                TransportError::Timeout(self.timeout)
            ),
        }
        report
    }
}
