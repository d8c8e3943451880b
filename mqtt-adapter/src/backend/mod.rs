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

//! Backend engine seam.
//!
//! A [`Backend`] is the MQTT engine that actually speaks the protocol:
//! handshake, packet framing, QoS retransmission, reconnection. The adapter
//! is a pure consumer of this interface and never reaches around it.
//!
//! Two implementations ship with the crate: [`self::rumqttc::RumqttcBackend`]
//! for real brokers and [`self::memory::MemoryBackend`], an in-process
//! loopback used by tests and local development.

pub mod memory;
pub mod rumqttc;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{ClientConfig, QoS, UserProperty};

/// Lifecycle and traffic events surfaced by a backend's network task.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// The session reached the broker (CONNACK received).
    Connected,
    /// The session dropped; the backend keeps retrying in the background.
    Disconnected,
    /// An inbound application message.
    Data { topic: Bytes, payload: Bytes },
    /// Anything else (acks, pings). The adapter ignores these.
    Other,
}

/// Event sink registered at client construction.
///
/// Invoked synchronously from the backend's own task, never from the caller's
/// context. Handlers must stay short and must not re-enter the adapter's
/// mutating operations.
pub type EventSink = Arc<dyn Fn(BackendEvent) + Send + Sync>;

/// One publish call. Built transiently per call; user properties only reach
/// the wire on v5 sessions.
#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
    pub properties: &'a [UserProperty],
}

/// One subscribe call. `no_local` and the properties are v5-only and ignored
/// by 3.1.1 sessions.
#[derive(Debug, Clone)]
pub struct SubscribeRequest<'a> {
    pub topic: &'a str,
    pub qos: QoS,
    pub no_local: bool,
    pub properties: &'a [UserProperty],
}

/// Factory side of the engine: capability reporting and client construction.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Whether this backend can run MQTT v5 sessions. Backends without v5
    /// cause [`begin`](crate::MqttClientAdapter::begin) to fall back to 3.1.1.
    fn supports_v5(&self) -> bool;

    /// Build a client from `config` and register `events` as its event sink.
    ///
    /// Construction performs no network activity; that starts with
    /// [`BackendClient::start`].
    async fn create_client(
        &self,
        config: &ClientConfig,
        events: EventSink,
    ) -> Result<Box<dyn BackendClient>>;
}

/// A constructed client. Exclusively owned by the adapter; dropping it
/// releases all engine-side resources.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Start the background network task. Connection progress is reported
    /// through the event sink, not through this return value.
    async fn start(&mut self) -> Result<()>;

    /// Stop the background network task, waiting until it has exited.
    async fn stop(&mut self) -> Result<()>;

    /// Hand a message to the engine. `Ok` means locally accepted, not
    /// delivered.
    async fn publish(&self, request: PublishRequest<'_>) -> Result<()>;

    /// Register a subscription with the engine.
    async fn subscribe(&self, request: SubscribeRequest<'_>) -> Result<()>;
}
