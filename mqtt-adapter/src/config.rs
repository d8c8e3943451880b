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

//! Configuration types consumed by the adapter and its backends.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Topic of the last-will installed by [`begin`](crate::MqttClientAdapter::begin).
pub const DEFAULT_LWT_TOPIC: &str = "devices/esp32/lwt";
/// Payload of the default last-will.
pub const DEFAULT_LWT_MESSAGE: &[u8] = b"offline";
/// Keep-alive interval used until [`set_keep_alive`](crate::MqttClientAdapter::set_keep_alive)
/// overrides it.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// MQTT quality-of-service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Protocol revision requested for the session.
///
/// `V5` is only honored by backends that report v5 support; otherwise the
/// adapter falls back to 3.1.1 at [`begin`](crate::MqttClientAdapter::begin).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V3_1_1,
    V5,
}

/// Message the broker publishes on the client's behalf after an unclean
/// disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWill {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl Default for LastWill {
    fn default() -> Self {
        Self {
            topic: DEFAULT_LWT_TOPIC.to_string(),
            message: DEFAULT_LWT_MESSAGE.to_vec(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    }
}

/// MQTT v5 user property: a key/value metadata pair attached to publish and
/// subscribe packets. Ignored on 3.1.1 sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProperty {
    pub key: String,
    pub value: String,
}

impl UserProperty {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// TLS trust configuration.
///
/// The variants are mutually exclusive by construction: installing one mode
/// replaces whatever was configured before, so the trust setup can never be
/// ambiguous at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verification {
    /// Nothing configured. Connecting to a TLS endpoint fails.
    Unspecified,
    /// Verify the peer against the operating system trust store.
    PlatformRoots,
    /// Verify the peer against a caller-supplied PEM certificate.
    ///
    /// `len` mirrors the C convention of a NUL-terminated config string: a
    /// recorded length of zero at the call site becomes `pem.len() + 1`.
    CaCertificate { pem: Vec<u8>, len: usize },
    /// Encrypt the transport but accept any peer certificate.
    Insecure,
}

/// Everything a backend needs to construct a client.
///
/// Mutated only through the adapter's configuration surface and consumed once
/// per [`connect`](crate::MqttClientAdapter::connect) call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker URI, e.g. `mqtt://broker.local:1883` or `mqtts://broker.local`.
    pub broker_uri: String,
    /// Client identifier. A random one is generated by the backend when unset.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub last_will: LastWill,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub protocol_version: ProtocolVersion,
    pub verification: Verification,
}

impl ClientConfig {
    /// Baseline config for `uri`: no credentials, default last-will, no TLS
    /// trust configured, MQTT 3.1.1.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            broker_uri: uri.into(),
            client_id: None,
            username: None,
            password: None,
            last_will: LastWill::default(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            protocol_version: ProtocolVersion::V3_1_1,
            verification: Verification::Unspecified,
        }
    }
}

/// Transport selected by the broker URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportScheme {
    Tcp,
    Tls,
}

/// Parsed broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: TransportScheme,
    pub host: String,
    pub port: u16,
}

/// Parse a broker URI of the form `scheme://host[:port]`.
///
/// Accepts `mqtt`/`tcp` (plain, default port 1883) and `mqtts`/`ssl` (TLS,
/// default port 8883). A bare `host[:port]` is treated as plain TCP.
pub fn parse_broker_uri(uri: &str) -> Result<BrokerAddress> {
    let (scheme, rest) = match uri.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("mqtt", uri),
    };

    let scheme = match scheme {
        "mqtt" | "tcp" => TransportScheme::Tcp,
        "mqtts" | "ssl" => TransportScheme::Tls,
        other => bail!("unsupported broker URI scheme '{other}'"),
    };

    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("invalid broker port '{port}'"))?;
            (host, port)
        }
        None => {
            let default = match scheme {
                TransportScheme::Tcp => 1883,
                TransportScheme::Tls => 8883,
            };
            (rest, default)
        }
    };

    if host.is_empty() {
        bail!("broker URI '{uri}' has no host");
    }

    Ok(BrokerAddress {
        scheme,
        host: host.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_uri_with_port() {
        let addr = parse_broker_uri("mqtt://broker.local:1884").unwrap();
        assert_eq!(addr.scheme, TransportScheme::Tcp);
        assert_eq!(addr.host, "broker.local");
        assert_eq!(addr.port, 1884);
    }

    #[test]
    fn plain_uri_defaults_to_1883() {
        let addr = parse_broker_uri("mqtt://broker.local").unwrap();
        assert_eq!(addr.port, 1883);
    }

    #[test]
    fn tls_uri_defaults_to_8883() {
        let addr = parse_broker_uri("mqtts://broker.local").unwrap();
        assert_eq!(addr.scheme, TransportScheme::Tls);
        assert_eq!(addr.port, 8883);
    }

    #[test]
    fn accepts_scheme_aliases() {
        assert_eq!(
            parse_broker_uri("tcp://h:1").unwrap().scheme,
            TransportScheme::Tcp
        );
        assert_eq!(
            parse_broker_uri("ssl://h:1").unwrap().scheme,
            TransportScheme::Tls
        );
    }

    #[test]
    fn bare_host_is_plain_tcp() {
        let addr = parse_broker_uri("broker.local:2000").unwrap();
        assert_eq!(addr.scheme, TransportScheme::Tcp);
        assert_eq!(addr.port, 2000);
    }

    #[test]
    fn ignores_trailing_slash() {
        let addr = parse_broker_uri("mqtt://broker.local/").unwrap();
        assert_eq!(addr.host, "broker.local");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse_broker_uri("ws://broker.local").is_err());
    }

    #[test]
    fn rejects_missing_host() {
        assert!(parse_broker_uri("mqtt://").is_err());
        assert!(parse_broker_uri("mqtt://:1883").is_err());
    }

    #[test]
    fn rejects_bad_port() {
        assert!(parse_broker_uri("mqtt://broker.local:notaport").is_err());
        assert!(parse_broker_uri("mqtt://broker.local:70000").is_err());
    }

    #[test]
    fn baseline_config_defaults() {
        let config = ClientConfig::new("mqtt://broker:1883");
        assert_eq!(config.last_will.topic, DEFAULT_LWT_TOPIC);
        assert_eq!(config.last_will.message, DEFAULT_LWT_MESSAGE);
        assert_eq!(config.last_will.qos, QoS::AtLeastOnce);
        assert!(config.last_will.retain);
        assert_eq!(config.keep_alive, DEFAULT_KEEP_ALIVE);
        assert!(config.clean_session);
        assert_eq!(config.protocol_version, ProtocolVersion::V3_1_1);
        assert_eq!(config.verification, Verification::Unspecified);
    }
}
