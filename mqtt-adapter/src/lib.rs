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

//! Callback-driven MQTT client adapter over pluggable backend engines.
//!
//! The adapter translates simple connect/publish/subscribe calls into backend
//! configuration and forwards the backend's lifecycle events (connected,
//! disconnected, message received) to user callbacks. The backend owns the
//! protocol: handshake, framing, QoS retransmission, TLS, reconnection.
//!
//! [`backend::rumqttc::RumqttcBackend`] drives real brokers over MQTT 3.1.1
//! or 5; [`backend::memory::MemoryBackend`] is an in-process loopback for
//! tests and local development.
//!
//! # Example
//!
//! ```ignore
//! use mqtt_adapter::{MqttClientAdapter, QoS, SessionOptions};
//!
//! let mut client = MqttClientAdapter::default();
//! client.begin("mqtts://broker.local", SessionOptions::default());
//! client.use_platform_roots(true);
//! client.on_connected(|| log::info!("connected"));
//! if client.connect().await {
//!     client.publish("devices/bridge/state", b"online", QoS::AtLeastOnce, true, &[]).await;
//! }
//! ```

pub mod adapter;
pub mod backend;
pub mod config;

pub use adapter::{MqttClientAdapter, SessionOptions};
pub use backend::{
    Backend, BackendClient, BackendEvent, EventSink, PublishRequest, SubscribeRequest,
};
pub use config::{
    ClientConfig, LastWill, ProtocolVersion, QoS, UserProperty, Verification,
};
