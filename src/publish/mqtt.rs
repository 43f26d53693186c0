//! MQTT transport built on `rumqttc`.
//!
//! Each session is a fresh connection: the event loop is polled until the
//! broker acknowledges the connection, then driven in the background until
//! the client disconnects.

use super::{BrokerSession, Connector, TransportError};
use crate::device::BrokerTarget;
use futures::future::BoxFuture;
use rumqttc::tokio_rustls::rustls;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Opens one MQTT connection per session.
#[derive(Debug, Default)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for MqttConnector {
    fn connect<'a>(
        &'a self,
        client_id: &'a str,
        target: &'a BrokerTarget,
    ) -> BoxFuture<'a, Result<Box<dyn BrokerSession>, TransportError>> {
        Box::pin(async move {
            let options = mqtt_options(client_id, target)?;
            let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
            wait_for_connack(&mut eventloop, target).await?;
            let driver = tokio::spawn(drive(eventloop));
            Ok(Box::new(MqttSession {
                client,
                driver: Some(driver),
            }) as Box<dyn BrokerSession>)
        })
    }
}

fn mqtt_options(client_id: &str, target: &BrokerTarget) -> Result<MqttOptions, TransportError> {
    let mut options = MqttOptions::new(client_id, &target.host, target.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);
    if target.has_credentials() {
        options.set_credentials(&target.username, &target.password);
    }
    if target.use_tls {
        let config = tls_config(target.allow_insecure_tls)?;
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            config,
        )));
    }
    Ok(options)
}

async fn wait_for_connack(
    eventloop: &mut EventLoop,
    target: &BrokerTarget,
) -> Result<(), TransportError> {
    let refused = |reason: String| TransportError::Connect {
        host: target.host.clone(),
        port: target.port,
        reason,
    };
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(refused(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(refused(e.to_string())),
        }
    }
}

/// Poll until the outgoing DISCONNECT has been written or the connection drops.
async fn drive(mut eventloop: EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                return Err(TransportError::Publish {
                    topic: String::new(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// A connected MQTT client and the task driving its event loop.
struct MqttSession {
    client: AsyncClient,
    driver: Option<JoinHandle<Result<(), TransportError>>>,
}

impl BrokerSession for MqttSession {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.client
                .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
                .await
                .map_err(|e| TransportError::Publish {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
        })
    }

    fn close(mut self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move {
            self.client
                .disconnect()
                .await
                .map_err(|e| TransportError::Publish {
                    topic: String::new(),
                    reason: e.to_string(),
                })?;
            match self.driver.take() {
                Some(driver) => driver.await.map_err(|e| TransportError::Publish {
                    topic: String::new(),
                    reason: e.to_string(),
                })?,
                None => Ok(()),
            }
        })
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

fn tls_config(allow_insecure: bool) -> Result<Arc<ClientConfig>, TransportError> {
    static VERIFIED: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    static INSECURE: OnceLock<Arc<ClientConfig>> = OnceLock::new();

    if allow_insecure {
        return Ok(Arc::clone(INSECURE.get_or_init(|| {
            Arc::new(
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
                    .with_no_client_auth(),
            )
        })));
    }

    if let Some(config) = VERIFIED.get() {
        return Ok(Arc::clone(config));
    }
    let roots = native_roots()?;
    let config = Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    );
    Ok(Arc::clone(VERIFIED.get_or_init(|| config)))
}

fn native_roots() -> Result<RootCertStore, TransportError> {
    let certs = rustls_native_certs::load_native_certs()
        .map_err(|e| TransportError::Tls(format!("cannot load system certificates: {e}")))?;
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!("Ignored {ignored} unparsable system certificates.");
    }
    if added == 0 {
        return Err(TransportError::Tls("no usable system certificates".to_string()));
    }
    debug!("Loaded {added} system certificates.");
    Ok(roots)
}

/// Accepts any server certificate, for brokers with `allow-insecure` set.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
