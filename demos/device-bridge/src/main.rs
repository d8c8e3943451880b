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

//! Minimal device bridge: subscribes to a command topic and publishes a
//! periodic heartbeat. Broker settings come from the environment.

use std::env;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use mqtt_adapter::{MqttClientAdapter, QoS, SessionOptions};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let broker_uri =
        env::var("MQTT_BROKER_URI").unwrap_or_else(|_| "mqtt://localhost:1883".to_string());
    let options = SessionOptions {
        client_id: env::var("MQTT_CLIENT_ID").ok(),
        username: env::var("MQTT_USERNAME").ok(),
        password: env::var("MQTT_PASSWORD").ok(),
        use_v5: env::var("MQTT_USE_V5").is_ok(),
    };

    let mut client = MqttClientAdapter::default();
    client.begin(&broker_uri, options);
    client.set_keep_alive(Duration::from_secs(30));
    if env::var("MQTT_INSECURE").is_ok() {
        client.set_insecure(true);
    } else {
        client.use_platform_roots(true);
    }

    client.on_connected(|| info!("Connected to broker"));
    client.on_disconnected(|| warn!("Connection lost, backend is retrying"));
    client.on_message(|topic, payload| {
        info!(
            "{} <- {}",
            String::from_utf8_lossy(topic),
            String::from_utf8_lossy(payload)
        );
    });

    info!("Starting device bridge (broker={broker_uri})");
    if !client.connect().await {
        anyhow::bail!("failed to start the MQTT client");
    }

    if !client.subscribe("commands/#", QoS::AtLeastOnce, false, &[]).await {
        warn!("command subscription was rejected");
    }

    let mut heartbeat = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = heartbeat.tick() => {
                if client.is_connected() {
                    client
                        .publish("devices/bridge/heartbeat", b"online", QoS::AtMostOnce, false, &[])
                        .await;
                }
            }
        }
    }

    info!("Shutdown signal received");
    client.disconnect().await;
    Ok(())
}
