// Copyright 2025 The MQTT Adapter Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Production backend over rumqttc, covering MQTT 3.1.1 and 5 sessions.

use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::{error, info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use ::rumqttc::tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig as RustlsClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use ::rumqttc::v5;
use ::rumqttc::v5::mqttbytes::v5::{
    Filter, LastWill as V5LastWill, Packet as V5Packet, PublishProperties, SubscribeProperties,
};
use ::rumqttc::{
    AsyncClient, Event, Incoming, LastWill as V3LastWill, MqttOptions, TlsConfiguration, Transport,
};

use super::{Backend, BackendClient, BackendEvent, EventSink, PublishRequest, SubscribeRequest};
use crate::config::{
    parse_broker_uri, ClientConfig, ProtocolVersion, QoS, TransportScheme, Verification,
};

/// rumqttc refuses keep-alive intervals below this.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Pause after a connection error so the reconnect loop does not spin while
/// the broker is unreachable.
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Backend driving real brokers through rumqttc. v5-capable.
#[derive(Debug, Clone)]
pub struct RumqttcBackend {
    /// Capacity of the request channel between client handle and event loop.
    channel_capacity: usize,
}

impl RumqttcBackend {
    pub fn new() -> Self {
        Self {
            channel_capacity: 100,
        }
    }

    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            channel_capacity: capacity,
        }
    }
}

impl Default for RumqttcBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for RumqttcBackend {
    fn supports_v5(&self) -> bool {
        true
    }

    async fn create_client(
        &self,
        config: &ClientConfig,
        events: EventSink,
    ) -> Result<Box<dyn BackendClient>> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("mqtt-adapter-{}", uuid::Uuid::new_v4()));

        let (session, pending_loop) = match config.protocol_version {
            ProtocolVersion::V3_1_1 => {
                let options = v3_options(config, &client_id)?;
                let (client, eventloop) = AsyncClient::new(options, self.channel_capacity);
                (Session::V3(client), EventLoopHandle::V3(eventloop))
            }
            ProtocolVersion::V5 => {
                let options = v5_options(config, &client_id)?;
                let (client, eventloop) = v5::AsyncClient::new(options, self.channel_capacity);
                (Session::V5(client), EventLoopHandle::V5(eventloop))
            }
        };

        Ok(Box::new(RumqttcClient {
            session,
            pending_loop: std::sync::Mutex::new(Some(pending_loop)),
            events,
            shutdown: None,
            task: None,
            client_id,
        }))
    }
}

enum Session {
    V3(AsyncClient),
    V5(v5::AsyncClient),
}

enum EventLoopHandle {
    V3(::rumqttc::EventLoop),
    V5(v5::EventLoop),
}

/// One rumqttc session: the client handle plus its network task.
pub struct RumqttcClient {
    session: Session,
    /// Event loop held between construction and `start()`. The mutex only
    /// exists to make the non-`Sync` event loop satisfy the `BackendClient`
    /// bound; it is taken exactly once.
    pending_loop: std::sync::Mutex<Option<EventLoopHandle>>,
    events: EventSink,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    client_id: String,
}

#[async_trait]
impl BackendClient for RumqttcClient {
    async fn start(&mut self) -> Result<()> {
        let Some(pending) = self.pending_loop.get_mut().unwrap().take() else {
            bail!("network task already started");
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let events = Arc::clone(&self.events);
        let client_id = self.client_id.clone();

        let task = match pending {
            EventLoopHandle::V3(eventloop) => {
                tokio::spawn(run_v3_loop(eventloop, events, shutdown_rx, client_id))
            }
            EventLoopHandle::V5(eventloop) => {
                tokio::spawn(run_v5_loop(eventloop, events, shutdown_rx, client_id))
            }
        };

        self.shutdown = Some(shutdown_tx);
        self.task = Some(task);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // Send the MQTT DISCONNECT before tearing the task down; ignore
        // failures, the broker may already be gone.
        match &self.session {
            Session::V3(client) => {
                let _ = client.disconnect().await;
            }
            Session::V5(client) => {
                let _ = client.disconnect().await;
            }
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.context("network task panicked")?;
        }
        Ok(())
    }

    async fn publish(&self, request: PublishRequest<'_>) -> Result<()> {
        match &self.session {
            Session::V3(client) => {
                client
                    .publish(
                        request.topic,
                        v3_qos(request.qos),
                        request.retain,
                        request.payload.to_vec(),
                    )
                    .await?;
            }
            Session::V5(client) => {
                if request.properties.is_empty() {
                    client
                        .publish(
                            request.topic,
                            v5_qos(request.qos),
                            request.retain,
                            request.payload.to_vec(),
                        )
                        .await?;
                } else {
                    let properties = PublishProperties {
                        user_properties: user_property_pairs(request.properties),
                        ..Default::default()
                    };
                    client
                        .publish_with_properties(
                            request.topic,
                            v5_qos(request.qos),
                            request.retain,
                            request.payload.to_vec(),
                            properties,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, request: SubscribeRequest<'_>) -> Result<()> {
        match &self.session {
            Session::V3(client) => {
                client.subscribe(request.topic, v3_qos(request.qos)).await?;
            }
            Session::V5(client) => {
                let mut filter = Filter::new(request.topic, v5_qos(request.qos));
                filter.nolocal = request.no_local;
                let properties = SubscribeProperties {
                    id: None,
                    user_properties: user_property_pairs(request.properties),
                };
                client
                    .subscribe_many_with_properties([filter], properties)
                    .await?;
            }
        }
        Ok(())
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn v3_options(config: &ClientConfig, client_id: &str) -> Result<MqttOptions> {
    let addr = parse_broker_uri(&config.broker_uri)?;
    let mut options = MqttOptions::new(client_id, &addr.host, addr.port);
    options.set_clean_session(config.clean_session);
    apply_keep_alive(&mut options, config.keep_alive, client_id);

    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        options.set_credentials(user, pass);
    }

    let will = &config.last_will;
    options.set_last_will(V3LastWill::new(
        will.topic.as_str(),
        will.message.clone(),
        v3_qos(will.qos),
        will.retain,
    ));

    if addr.scheme == TransportScheme::Tls {
        options.set_transport(Transport::tls_with_config(tls_configuration(
            &config.verification,
        )?));
    }

    Ok(options)
}

fn v5_options(config: &ClientConfig, client_id: &str) -> Result<v5::MqttOptions> {
    let addr = parse_broker_uri(&config.broker_uri)?;
    let mut options = v5::MqttOptions::new(client_id, &addr.host, addr.port);
    options.set_clean_start(config.clean_session);
    if config.keep_alive >= MIN_KEEP_ALIVE {
        options.set_keep_alive(config.keep_alive);
    } else {
        warn!(
            "[{client_id}] keep-alive below {}s not supported, using default",
            MIN_KEEP_ALIVE.as_secs()
        );
    }

    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        options.set_credentials(user, pass);
    }

    let will = &config.last_will;
    options.set_last_will(V5LastWill {
        topic: Bytes::from(will.topic.clone().into_bytes()),
        message: Bytes::from(will.message.clone()),
        qos: v5_qos(will.qos),
        retain: will.retain,
        properties: None,
    });

    if addr.scheme == TransportScheme::Tls {
        options.set_transport(Transport::tls_with_config(tls_configuration(
            &config.verification,
        )?));
    }

    Ok(options)
}

fn apply_keep_alive(options: &mut MqttOptions, keep_alive: Duration, client_id: &str) {
    if keep_alive >= MIN_KEEP_ALIVE {
        options.set_keep_alive(keep_alive);
    } else {
        warn!(
            "[{client_id}] keep-alive below {}s not supported, using default",
            MIN_KEEP_ALIVE.as_secs()
        );
    }
}

/// Translate the configured trust mode into a rumqttc TLS configuration.
fn tls_configuration(verification: &Verification) -> Result<TlsConfiguration> {
    match verification {
        Verification::Unspecified => bail!(
            "TLS endpoint but no trust configuration; \
             configure platform roots, a CA certificate, or insecure mode"
        ),
        Verification::PlatformRoots => {
            let mut roots = RootCertStore::empty();
            let native_certs = rustls_native_certs::load_native_certs()
                .context("failed to load the platform trust store")?;
            for cert in native_certs {
                roots
                    .add(cert)
                    .context("rejected certificate in the platform trust store")?;
            }
            Ok(rustls_transport(
                RustlsClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            ))
        }
        Verification::CaCertificate { pem, .. } => {
            // The stored buffer may carry a trailing NUL from the C-style
            // length convention; the PEM parser must not see it.
            let pem = match pem.split_last() {
                Some((&0, head)) => head,
                _ => pem.as_slice(),
            };
            let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to parse the configured CA certificate")?;
            if certs.is_empty() {
                bail!("no certificates found in the configured CA PEM");
            }
            let mut roots = RootCertStore::empty();
            roots.add_parsable_certificates(certs);
            Ok(rustls_transport(
                RustlsClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            ))
        }
        Verification::Insecure => {
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let config = RustlsClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
                .with_no_client_auth();
            Ok(rustls_transport(config))
        }
    }
}

fn rustls_transport(config: RustlsClientConfig) -> TlsConfiguration {
    TlsConfiguration::Rustls(Arc::new(config))
}

/// Verifier that accepts any server certificate. Signatures are still checked
/// so the handshake itself stays well-formed; only peer identity is skipped.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

async fn run_v3_loop(
    mut eventloop: ::rumqttc::EventLoop,
    events: EventSink,
    mut shutdown: oneshot::Receiver<()>,
    client_id: String,
) {
    info!("[{client_id}] MQTT network task started");
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("[{client_id}] Shutdown signal received");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => events(BackendEvent::Connected),
                Ok(Event::Incoming(Incoming::Publish(publish))) => events(BackendEvent::Data {
                    topic: Bytes::from(publish.topic.into_bytes()),
                    payload: publish.payload,
                }),
                Ok(Event::Incoming(Incoming::Disconnect)) => events(BackendEvent::Disconnected),
                Ok(_) => events(BackendEvent::Other),
                Err(e) => {
                    error!("[{client_id}] MQTT connection error: {e}");
                    events(BackendEvent::Disconnected);
                    // rumqttc reconnects on the next poll
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                }
            }
        }
    }
    info!("[{client_id}] MQTT network task stopped");
}

async fn run_v5_loop(
    mut eventloop: v5::EventLoop,
    events: EventSink,
    mut shutdown: oneshot::Receiver<()>,
    client_id: String,
) {
    info!("[{client_id}] MQTT v5 network task started");
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("[{client_id}] Shutdown signal received");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(v5::Event::Incoming(V5Packet::ConnAck(_))) => events(BackendEvent::Connected),
                Ok(v5::Event::Incoming(V5Packet::Publish(publish))) => {
                    events(BackendEvent::Data {
                        topic: publish.topic.clone(),
                        payload: publish.payload,
                    })
                }
                Ok(v5::Event::Incoming(V5Packet::Disconnect(_))) => {
                    events(BackendEvent::Disconnected)
                }
                Ok(_) => events(BackendEvent::Other),
                Err(e) => {
                    error!("[{client_id}] MQTT connection error: {e}");
                    events(BackendEvent::Disconnected);
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                }
            }
        }
    }
    info!("[{client_id}] MQTT v5 network task stopped");
}

fn user_property_pairs(properties: &[crate::config::UserProperty]) -> Vec<(String, String)> {
    properties
        .iter()
        .map(|p| (p.key.clone(), p.value.clone()))
        .collect()
}

fn v3_qos(qos: QoS) -> ::rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => ::rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => ::rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => ::rumqttc::QoS::ExactlyOnce,
    }
}

fn v5_qos(qos: QoS) -> v5::mqttbytes::QoS {
    match qos {
        QoS::AtMostOnce => v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => v5::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => v5::mqttbytes::QoS::ExactlyOnce,
    }
}
