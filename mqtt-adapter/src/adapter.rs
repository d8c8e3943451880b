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

//! The adapter: configuration marshaling and event dispatch over a backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::backend::rumqttc::RumqttcBackend;
use crate::backend::{Backend, BackendClient, BackendEvent, EventSink, PublishRequest, SubscribeRequest};
use crate::config::{ClientConfig, ProtocolVersion, QoS, UserProperty, Verification};

/// Optional session parameters for [`MqttClientAdapter::begin`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Request an MQTT v5 session. Honored only when the backend supports v5.
    pub use_v5: bool,
}

type MessageCallback = Box<dyn FnMut(&[u8], &[u8]) + Send>;
type ConnectionCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct CallbackSet {
    message: Mutex<Option<MessageCallback>>,
    connected: Mutex<Option<ConnectionCallback>>,
    disconnected: Mutex<Option<ConnectionCallback>>,
}

/// Thin MQTT client adapter.
///
/// Holds one backend client at a time and forwards its lifecycle events to
/// three user callbacks. All protocol work (handshake, framing, QoS
/// retransmission, reconnection) lives in the backend; the adapter only
/// marshals configuration and dispatches events.
///
/// Mutating calls assume a single logical owner; callbacks run synchronously
/// on the backend's task and must not re-enter the adapter.
///
/// # Example
///
/// ```ignore
/// use mqtt_adapter::{MqttClientAdapter, QoS, SessionOptions};
///
/// let mut client = MqttClientAdapter::default();
/// client.begin("mqtt://broker.local:1883", SessionOptions::default());
/// client.on_message(|topic, payload| {
///     println!("{}: {} bytes", String::from_utf8_lossy(topic), payload.len());
/// });
/// if client.connect().await {
///     client.subscribe("sensors/#", QoS::AtLeastOnce, false, &[]).await;
/// }
/// ```
pub struct MqttClientAdapter {
    backend: Arc<dyn Backend>,
    config: ClientConfig,
    client: Option<Box<dyn BackendClient>>,
    connected: Arc<AtomicBool>,
    callbacks: Arc<CallbackSet>,
}

impl MqttClientAdapter {
    /// Wrap the given backend. No configuration exists until
    /// [`begin`](Self::begin) is called.
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::with_backend(Arc::new(backend))
    }

    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            config: ClientConfig::new(""),
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(CallbackSet::default()),
        }
    }

    /// (Re)initialize the session configuration from scratch.
    ///
    /// Every field is reset: credentials and client id from `options` (absent
    /// fields become absent again, they do not survive from an earlier
    /// `begin`), TLS trust back to unconfigured, keep-alive back to the
    /// default, and the fixed default last-will installed. Connection state
    /// is cleared. The current client handle, if any, is left untouched.
    ///
    /// A v5 request falls back to 3.1.1 when the backend has no v5 support.
    pub fn begin(&mut self, uri: &str, options: SessionOptions) {
        self.connected.store(false, Ordering::SeqCst);

        let mut config = ClientConfig::new(uri);
        config.client_id = options.client_id;
        config.username = options.username;
        config.password = options.password;
        if options.use_v5 {
            if self.backend.supports_v5() {
                config.protocol_version = ProtocolVersion::V5;
            } else {
                warn!("MQTT v5 requested but the backend only supports 3.1.1, falling back");
            }
        }
        self.config = config;
    }

    /// Tear down any existing client and build a new one from the current
    /// configuration, then start its network task.
    ///
    /// Returns whether the task was started. The connection itself is
    /// established asynchronously; only the Connected event flips
    /// [`is_connected`](Self::is_connected). On a construction failure the
    /// handle stays empty and `connect()` may simply be called again.
    pub async fn connect(&mut self) -> bool {
        // Wholesale recreation, no incremental reconfiguration.
        self.client = None;
        self.connected.store(false, Ordering::SeqCst);

        let sink = self.event_sink();
        let client = match self.backend.create_client(&self.config, sink).await {
            Ok(client) => client,
            Err(e) => {
                error!("MQTT client construction failed: {e:#}");
                return false;
            }
        };

        let client = self.client.insert(client);
        match client.start().await {
            Ok(()) => true,
            Err(e) => {
                error!("MQTT network task failed to start: {e:#}");
                false
            }
        }
    }

    /// Stop the network task (waiting until it has stopped) and mark the
    /// session disconnected immediately, without waiting for the event.
    pub async fn disconnect(&mut self) {
        if let Some(client) = self.client.as_mut() {
            if let Err(e) = client.stop().await {
                warn!("MQTT network task stop failed: {e:#}");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Hand a message to the backend.
    ///
    /// Returns whether the backend accepted it locally; acceptance does not
    /// guarantee delivery. Always `false` before a successful
    /// [`connect`](Self::connect). `properties` only reach the wire on v5
    /// sessions.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        properties: &[UserProperty],
    ) -> bool {
        let Some(client) = self.client.as_ref() else {
            return false;
        };
        let request = PublishRequest {
            topic,
            payload,
            qos,
            retain,
            properties,
        };
        match client.publish(request).await {
            Ok(()) => true,
            Err(e) => {
                warn!("MQTT publish on '{topic}' rejected: {e:#}");
                false
            }
        }
    }

    /// Register a subscription with the backend. On v5 sessions the
    /// subscription carries the no-local flag and any user properties.
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        no_local: bool,
        properties: &[UserProperty],
    ) -> bool {
        let Some(client) = self.client.as_ref() else {
            return false;
        };
        let request = SubscribeRequest {
            topic,
            qos,
            no_local,
            properties,
        };
        match client.subscribe(request).await {
            Ok(()) => true,
            Err(e) => {
                warn!("MQTT subscribe to '{topic}' rejected: {e:#}");
                false
            }
        }
    }

    /// Set the callback for inbound messages. The topic and payload byte
    /// views are valid only for the duration of the call and must not be
    /// retained.
    pub fn on_message(&self, callback: impl FnMut(&[u8], &[u8]) + Send + 'static) {
        *lock(&self.callbacks.message) = Some(Box::new(callback));
    }

    pub fn on_connected(&self, callback: impl FnMut() + Send + 'static) {
        *lock(&self.callbacks.connected) = Some(Box::new(callback));
    }

    pub fn on_disconnected(&self, callback: impl FnMut() + Send + 'static) {
        *lock(&self.callbacks.disconnected) = Some(Box::new(callback));
    }

    /// Whether a Connected event has been seen since the last Disconnected
    /// event or [`disconnect`](Self::disconnect) call. May lag the backend
    /// task by a moment.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether a backend client currently exists.
    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Verify the peer against the operating system trust store. Disabling
    /// clears the trust configuration entirely, whatever mode was active.
    pub fn use_platform_roots(&mut self, enable: bool) {
        self.config.verification = if enable {
            Verification::PlatformRoots
        } else {
            Verification::Unspecified
        };
    }

    /// Verify the peer against the given PEM certificate, replacing any other
    /// trust method. A zero `len` records `cert.len() + 1`, matching the
    /// NUL-terminated length convention of C-style config structs. `None`
    /// clears trust configuration entirely.
    pub fn set_ca_certificate(&mut self, cert: Option<&[u8]>, len: usize) {
        self.config.verification = match cert {
            Some(pem) => {
                let len = if len == 0 { pem.len() + 1 } else { len };
                Verification::CaCertificate {
                    pem: pem.to_vec(),
                    len,
                }
            }
            None => Verification::Unspecified,
        };
    }

    /// Skip peer verification entirely: the transport stays encrypted on TLS
    /// endpoints but the broker's identity is not checked. Disabling only
    /// removes insecure mode; it does not restore a previous trust method.
    pub fn set_insecure(&mut self, enable: bool) {
        if enable {
            self.config.verification = Verification::Insecure;
        } else if matches!(self.config.verification, Verification::Insecure) {
            self.config.verification = Verification::Unspecified;
        }
    }

    /// Keep-alive interval for the next [`connect`](Self::connect).
    pub fn set_keep_alive(&mut self, keep_alive: Duration) {
        self.config.keep_alive = keep_alive;
    }

    /// Clean-session flag for the next [`connect`](Self::connect).
    pub fn set_clean_session(&mut self, clean: bool) {
        self.config.clean_session = clean;
    }

    /// The configuration the next [`connect`](Self::connect) will use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn event_sink(&self) -> EventSink {
        let connected = Arc::clone(&self.connected);
        let callbacks = Arc::clone(&self.callbacks);
        Arc::new(move |event| dispatch(event, &connected, &callbacks))
    }
}

impl Default for MqttClientAdapter {
    /// An adapter over the rumqttc backend.
    fn default() -> Self {
        Self::new(RumqttcBackend::new())
    }
}

/// Single dispatch point for all backend events, run on the backend's task.
fn dispatch(event: BackendEvent, connected: &AtomicBool, callbacks: &CallbackSet) {
    match event {
        BackendEvent::Connected => {
            connected.store(true, Ordering::SeqCst);
            if let Some(callback) = lock(&callbacks.connected).as_mut() {
                callback();
            }
        }
        BackendEvent::Disconnected => {
            connected.store(false, Ordering::SeqCst);
            if let Some(callback) = lock(&callbacks.disconnected).as_mut() {
                callback();
            }
        }
        BackendEvent::Data { topic, payload } => {
            if let Some(callback) = lock(&callbacks.message).as_mut() {
                callback(&topic, &payload);
            }
        }
        BackendEvent::Other => {}
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
