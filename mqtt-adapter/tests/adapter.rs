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

//! Adapter lifecycle tests against the in-process backend.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use mqtt_adapter::backend::memory::MemoryBackend;
use mqtt_adapter::{
    BackendEvent, MqttClientAdapter, ProtocolVersion, QoS, SessionOptions, UserProperty,
};

fn begin(client: &mut MqttClientAdapter, client_id: &str) {
    client.begin(
        "mqtt://broker:1883",
        SessionOptions {
            client_id: Some(client_id.to_string()),
            ..Default::default()
        },
    );
}

#[tokio::test]
async fn publish_and_subscribe_require_a_client() {
    let backend = MemoryBackend::new();
    let client = MqttClientAdapter::new(backend.clone());

    assert!(!client.publish("t", b"x", QoS::AtMostOnce, false, &[]).await);
    assert!(!client.subscribe("t", QoS::AtMostOnce, false, &[]).await);

    // Nothing reached the backend.
    assert_eq!(backend.created_clients(), 0);
    assert!(backend.published().is_empty());
    assert!(backend.subscriptions().is_empty());
}

#[tokio::test]
async fn connect_builds_a_v3_client() {
    let backend = MemoryBackend::new();
    let mut client = MqttClientAdapter::new(backend.clone());
    begin(&mut client, "dev1");

    assert!(client.connect().await);
    assert!(client.has_client());

    let config = backend.last_config().expect("client was constructed");
    assert_eq!(config.client_id.as_deref(), Some("dev1"));
    assert_eq!(config.protocol_version, ProtocolVersion::V3_1_1);
}

#[tokio::test]
async fn connection_state_follows_events() {
    let backend = MemoryBackend::new().manual_events();
    let mut client = MqttClientAdapter::new(backend.clone());
    begin(&mut client, "dev1");

    assert!(client.connect().await);
    // The task started but no CONNACK has arrived yet.
    assert!(!client.is_connected());

    backend.inject(BackendEvent::Connected);
    assert!(client.is_connected());

    backend.inject(BackendEvent::Disconnected);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn disconnect_clears_state_without_waiting_for_the_event() {
    let backend = MemoryBackend::new().manual_events();
    let mut client = MqttClientAdapter::new(backend.clone());
    begin(&mut client, "dev1");

    assert!(client.connect().await);
    backend.inject(BackendEvent::Connected);
    assert!(client.is_connected());

    client.disconnect().await;
    assert!(!client.is_connected());
    // The handle survives a disconnect; only connect() replaces it.
    assert!(client.has_client());
}

#[tokio::test]
async fn connection_callbacks_fire() {
    let backend = MemoryBackend::new().manual_events();
    let mut client = MqttClientAdapter::new(backend.clone());
    begin(&mut client, "dev1");

    let ups = Arc::new(Mutex::new(0));
    let downs = Arc::new(Mutex::new(0));
    {
        let ups = Arc::clone(&ups);
        client.on_connected(move || *ups.lock().unwrap() += 1);
    }
    {
        let downs = Arc::clone(&downs);
        client.on_disconnected(move || *downs.lock().unwrap() += 1);
    }

    assert!(client.connect().await);
    backend.inject(BackendEvent::Connected);
    backend.inject(BackendEvent::Disconnected);
    backend.inject(BackendEvent::Connected);

    assert_eq!(*ups.lock().unwrap(), 2);
    assert_eq!(*downs.lock().unwrap(), 1);
}

#[tokio::test]
async fn message_callback_sees_exact_bytes() {
    let backend = MemoryBackend::new().manual_events();
    let mut client = MqttClientAdapter::new(backend.clone());
    begin(&mut client, "dev1");

    let seen = Arc::new(Mutex::new(Vec::<(Vec<u8>, Vec<u8>)>::new()));
    {
        let seen = Arc::clone(&seen);
        client.on_message(move |topic, payload| {
            seen.lock().unwrap().push((topic.to_vec(), payload.to_vec()));
        });
    }

    assert!(client.connect().await);
    backend.inject(BackendEvent::Data {
        topic: Bytes::from_static(b"sensors/1/temp"),
        payload: Bytes::from_static(&[0x00, 0xff, 0x42]),
    });

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, b"sensors/1/temp");
    assert_eq!(seen[0].1, [0x00, 0xff, 0x42]);
}

#[tokio::test]
async fn ignored_events_do_not_touch_state_or_callbacks() {
    let backend = MemoryBackend::new().manual_events();
    let mut client = MqttClientAdapter::new(backend.clone());
    begin(&mut client, "dev1");

    let messages = Arc::new(Mutex::new(0));
    {
        let messages = Arc::clone(&messages);
        client.on_message(move |_, _| *messages.lock().unwrap() += 1);
    }

    assert!(client.connect().await);
    backend.inject(BackendEvent::Other);
    assert!(!client.is_connected());
    assert_eq!(*messages.lock().unwrap(), 0);
}

#[tokio::test]
async fn reconnect_drops_the_previous_client() {
    let backend = MemoryBackend::new();
    let mut client = MqttClientAdapter::new(backend.clone());
    begin(&mut client, "dev1");

    assert!(client.connect().await);
    assert!(client.connect().await);

    assert_eq!(backend.created_clients(), 2);
    assert_eq!(backend.dropped_clients(), 1);
    assert_eq!(backend.live_clients(), 1);
}

#[tokio::test]
async fn failed_construction_leaves_no_client_and_is_retryable() {
    let backend = MemoryBackend::new();
    let mut client = MqttClientAdapter::new(backend.clone());
    begin(&mut client, "dev1");

    backend.fail_create(true);
    assert!(!client.connect().await);
    assert!(!client.has_client());

    backend.fail_create(false);
    assert!(client.connect().await);
    assert!(client.has_client());
}

#[tokio::test]
async fn failed_start_reports_false_but_keeps_the_handle() {
    let backend = MemoryBackend::new();
    let mut client = MqttClientAdapter::new(backend.clone());
    begin(&mut client, "dev1");

    backend.fail_start(true);
    assert!(!client.connect().await);
    assert!(client.has_client());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn rejected_publish_returns_false() {
    let backend = MemoryBackend::new();
    let mut client = MqttClientAdapter::new(backend.clone());
    begin(&mut client, "dev1");
    assert!(client.connect().await);

    backend.fail_publish(true);
    assert!(!client.publish("t", b"x", QoS::AtLeastOnce, false, &[]).await);
    backend.fail_publish(false);
    assert!(client.publish("t", b"x", QoS::AtLeastOnce, false, &[]).await);
}

#[tokio::test]
async fn publish_and_subscribe_forward_all_arguments() {
    let backend = MemoryBackend::new();
    let mut client = MqttClientAdapter::new(backend.clone());
    client.begin(
        "mqtt://broker:1883",
        SessionOptions {
            client_id: Some("dev1".into()),
            use_v5: true,
            ..Default::default()
        },
    );
    assert!(client.connect().await);

    let props = [UserProperty::new("trace", "abc123")];
    assert!(
        client
            .subscribe("commands/#", QoS::ExactlyOnce, true, &props)
            .await
    );
    assert!(
        client
            .publish("devices/1/state", b"online", QoS::AtLeastOnce, true, &props)
            .await
    );

    let subs = backend.subscriptions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].topic, "commands/#");
    assert_eq!(subs[0].qos, QoS::ExactlyOnce);
    assert!(subs[0].no_local);
    assert_eq!(subs[0].properties, props);

    let published = backend.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "devices/1/state");
    assert_eq!(published[0].payload, b"online");
    assert_eq!(published[0].qos, QoS::AtLeastOnce);
    assert!(published[0].retain);
    assert_eq!(published[0].properties, props);
}

#[tokio::test]
async fn loopback_delivery_between_two_adapters() {
    let backend = MemoryBackend::new();

    let mut subscriber = MqttClientAdapter::new(backend.clone());
    begin(&mut subscriber, "sub");
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let seen = Arc::clone(&seen);
        subscriber.on_message(move |topic, _| {
            seen.lock()
                .unwrap()
                .push(String::from_utf8_lossy(topic).into_owned());
        });
    }
    assert!(subscriber.connect().await);
    assert!(
        subscriber
            .subscribe("sensors/+/temp", QoS::AtMostOnce, false, &[])
            .await
    );

    let mut publisher = MqttClientAdapter::new(backend.clone());
    begin(&mut publisher, "pub");
    assert!(publisher.connect().await);
    assert!(
        publisher
            .publish("sensors/3/temp", b"21.5", QoS::AtMostOnce, false, &[])
            .await
    );
    assert!(
        publisher
            .publish("sensors/3/humidity", b"40", QoS::AtMostOnce, false, &[])
            .await
    );

    assert_eq!(*seen.lock().unwrap(), vec!["sensors/3/temp".to_string()]);
}

#[tokio::test]
async fn no_local_suppresses_own_messages() {
    let backend = MemoryBackend::new();
    let mut client = MqttClientAdapter::new(backend.clone());
    begin(&mut client, "dev1");

    let count = Arc::new(Mutex::new(0));
    {
        let count = Arc::clone(&count);
        client.on_message(move |_, _| *count.lock().unwrap() += 1);
    }

    assert!(client.connect().await);
    assert!(client.subscribe("loop", QoS::AtMostOnce, true, &[]).await);
    assert!(client.publish("loop", b"x", QoS::AtMostOnce, false, &[]).await);
    assert_eq!(*count.lock().unwrap(), 0);

    assert!(client.subscribe("echo", QoS::AtMostOnce, false, &[]).await);
    assert!(client.publish("echo", b"x", QoS::AtMostOnce, false, &[]).await);
    assert_eq!(*count.lock().unwrap(), 1);
}
