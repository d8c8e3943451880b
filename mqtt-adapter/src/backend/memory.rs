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

//! In-process backend.
//!
//! Simulates a broker entirely within the process and is the reference
//! implementation of backend semantics: subscriptions are registered
//! immediately, published messages are delivered synchronously to every
//! matching client, and topic filters use MQTT `+`/`#` wildcard matching.
//!
//! Unlike a real backend, events are delivered on the caller's task rather
//! than a background one. Tests additionally get call recording, lifecycle
//! counters, event injection, and failure injection.
//!
//! Non-goals: persistence, retained messages, network or timing behavior.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;

use super::{Backend, BackendClient, BackendEvent, EventSink, PublishRequest, SubscribeRequest};
use crate::config::{ClientConfig, QoS, UserProperty};

/// A publish accepted by the broker, as recorded for assertions.
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Vec<UserProperty>,
}

/// A subscription registered with the broker.
#[derive(Debug, Clone)]
pub struct SubscribeRecord {
    pub topic: String,
    pub qos: QoS,
    pub no_local: bool,
    pub properties: Vec<UserProperty>,
}

struct FilterEntry {
    filter: String,
    no_local: bool,
}

struct ClientSlot {
    id: usize,
    sink: EventSink,
    filters: Vec<FilterEntry>,
}

#[derive(Default)]
struct BrokerState {
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    fail_publish: AtomicBool,
    created: AtomicUsize,
    dropped: AtomicUsize,
    next_id: AtomicUsize,
    clients: Mutex<Vec<ClientSlot>>,
    configs: Mutex<Vec<ClientConfig>>,
    publishes: Mutex<Vec<PublishRecord>>,
    subscribes: Mutex<Vec<SubscribeRecord>>,
}

/// In-process loopback backend. Clones share the same broker state, so one
/// instance can serve several adapters that talk to each other.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<BrokerState>,
    supports_v5: bool,
    /// When set, `start`/`stop` emit Connected/Disconnected themselves, the
    /// way a loopback broker that is always reachable would.
    auto_events: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState::default()),
            supports_v5: true,
            auto_events: true,
        }
    }

    /// A backend without v5 support, for exercising the 3.1.1 fallback.
    pub fn v3_only() -> Self {
        Self {
            supports_v5: false,
            ..Self::new()
        }
    }

    /// Disable automatic Connected/Disconnected emission so a test drives
    /// the full event sequence through [`inject`](Self::inject).
    pub fn manual_events(mut self) -> Self {
        self.auto_events = false;
        self
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Total clients ever constructed.
    pub fn created_clients(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    /// Total clients dropped again.
    pub fn dropped_clients(&self) -> usize {
        self.state.dropped.load(Ordering::SeqCst)
    }

    pub fn live_clients(&self) -> usize {
        self.created_clients() - self.dropped_clients()
    }

    /// Config the most recent client was constructed from.
    pub fn last_config(&self) -> Option<ClientConfig> {
        lock(&self.state.configs).last().cloned()
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        lock(&self.state.publishes).clone()
    }

    pub fn subscriptions(&self) -> Vec<SubscribeRecord> {
        lock(&self.state.subscribes).clone()
    }

    /// Deliver `event` to every live client, as the broker side would.
    pub fn inject(&self, event: BackendEvent) {
        let sinks: Vec<EventSink> = lock(&self.state.clients)
            .iter()
            .map(|slot| Arc::clone(&slot.sink))
            .collect();
        for sink in sinks {
            sink(event.clone());
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn supports_v5(&self) -> bool {
        self.supports_v5
    }

    async fn create_client(
        &self,
        config: &ClientConfig,
        events: EventSink,
    ) -> Result<Box<dyn BackendClient>> {
        if self.state.fail_create.load(Ordering::SeqCst) {
            bail!("injected client construction failure");
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        self.state.created.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.configs).push(config.clone());
        lock(&self.state.clients).push(ClientSlot {
            id,
            sink: Arc::clone(&events),
            filters: Vec::new(),
        });

        Ok(Box::new(MemoryClient {
            state: Arc::clone(&self.state),
            id,
            sink: events,
            auto_events: self.auto_events,
        }))
    }
}

struct MemoryClient {
    state: Arc<BrokerState>,
    id: usize,
    sink: EventSink,
    auto_events: bool,
}

#[async_trait]
impl BackendClient for MemoryClient {
    async fn start(&mut self) -> Result<()> {
        if self.state.fail_start.load(Ordering::SeqCst) {
            bail!("injected network task start failure");
        }
        // The loopback broker is always reachable.
        if self.auto_events {
            (self.sink)(BackendEvent::Connected);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.auto_events {
            (self.sink)(BackendEvent::Disconnected);
        }
        Ok(())
    }

    async fn publish(&self, request: PublishRequest<'_>) -> Result<()> {
        if self.state.fail_publish.load(Ordering::SeqCst) {
            bail!("injected publish failure");
        }

        lock(&self.state.publishes).push(PublishRecord {
            topic: request.topic.to_string(),
            payload: request.payload.to_vec(),
            qos: request.qos,
            retain: request.retain,
            properties: request.properties.to_vec(),
        });

        // Collect matching sinks first; the sink may run user callbacks and
        // must not be invoked while the broker lock is held.
        let sinks: Vec<EventSink> = lock(&self.state.clients)
            .iter()
            .filter(|slot| {
                slot.filters.iter().any(|entry| {
                    topic_matches(&entry.filter, request.topic)
                        && !(entry.no_local && slot.id == self.id)
                })
            })
            .map(|slot| Arc::clone(&slot.sink))
            .collect();

        let topic = Bytes::copy_from_slice(request.topic.as_bytes());
        let payload = Bytes::copy_from_slice(request.payload);
        for sink in sinks {
            sink(BackendEvent::Data {
                topic: topic.clone(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn subscribe(&self, request: SubscribeRequest<'_>) -> Result<()> {
        lock(&self.state.subscribes).push(SubscribeRecord {
            topic: request.topic.to_string(),
            qos: request.qos,
            no_local: request.no_local,
            properties: request.properties.to_vec(),
        });

        let mut clients = lock(&self.state.clients);
        if let Some(slot) = clients.iter_mut().find(|slot| slot.id == self.id) {
            slot.filters.push(FilterEntry {
                filter: request.topic.to_string(),
                no_local: request.no_local,
            });
        }
        Ok(())
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.state.dropped.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.clients).retain(|slot| slot.id != self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// MQTT topic filter matching with `+` (single level) and `#` (multi level,
/// final segment only) wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
