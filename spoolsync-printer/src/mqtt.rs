/**
 * MQTT - Transport TLS vers l'imprimante
 *
 * RÔLE :
 * - Options de connexion (TLS sans validation du certificat auto-signé,
 *   utilisateur `bblp`, code d'accès en mot de passe, keepalive 15s)
 * - Pompe d'événements : la boucle rumqttc tourne dans sa propre tâche et
 *   transforme connexions / pertes / messages en `TransportEvent`
 * - Trait `Publisher` : seul point de sortie vers le broker (mockable)
 */

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PrinterConfig;
use crate::error::Result;

pub const USERNAME: &str = "bblp";
/// Full status pushes are far above the rumqttc default of 10 KiB.
const MAX_PACKET_SIZE: usize = 256 * 1024;
const REQUEST_CHANNEL_CAPACITY: usize = 32;

pub fn report_topic(serial: &str) -> String {
    format!("device/{serial}/report")
}

pub fn request_topic(serial: &str) -> String {
    format!("device/{serial}/request")
}

/// What the network task hands over to the session task.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    ConnectionLost(String),
    Message { topic: String, payload: Vec<u8> },
}

/// Outbound side of the transport. Calls never block.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()>;
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
}

impl Publisher for AsyncClient {
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        self.try_publish(topic, qos, false, payload)?;
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.try_subscribe(topic, qos)?;
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.try_disconnect()?;
        Ok(())
    }
}

/// Accepts the device's self-signed certificate without any check.
#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn tls_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        .with_no_client_auth()
}

pub fn build_options(cfg: &PrinterConfig) -> Result<MqttOptions> {
    cfg.validate()?;

    let mut opts = MqttOptions::new(cfg.client_id(), cfg.host.clone(), cfg.port);
    opts.set_credentials(USERNAME, cfg.access_code.clone());
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    opts.set_clean_session(true);
    opts.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    opts.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(
        tls_config(),
    ))));
    Ok(opts)
}

/// Builds the client/event-loop pair for one printer.
pub fn connect_client(cfg: &PrinterConfig) -> Result<(AsyncClient, EventLoop)> {
    let opts = build_options(cfg)?;
    Ok(AsyncClient::new(opts, REQUEST_CHANNEL_CAPACITY))
}

/// Drives the rumqttc event loop until the session side goes away.
///
/// rumqttc reconnects on the next `poll` after an error, so errors are
/// reported and followed by a pause.
pub fn spawn_event_pump(
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    serial: String,
    retry_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("[{serial}] MQTT connected");
                        TransportEvent::Connected
                    } else {
                        warn!("[{serial}] MQTT connection refused: {:?}", ack.code);
                        TransportEvent::ConnectionLost(format!("refused: {:?}", ack.code))
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                },
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    TransportEvent::ConnectionLost("broker sent disconnect".into())
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("[{serial}] MQTT erreur: {e}");
                    if events.send(TransportEvent::ConnectionLost(e.to_string())).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(retry_delay).await;
                    continue;
                }
            };

            if events.send(event).await.is_err() {
                break;
            }
        }
        debug!("[{serial}] event pump stopped");
    })
}
