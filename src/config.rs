use crate::{
    amf,
    endpoint::{self, Address, Direction, Endpoint, Kind},
};
use serde::Deserialize;
use std::{collections::BTreeSet, fs, net::ToSocketAddrs, path::Path};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("server has no usable listen address: {0:?}")]
    BadListenAddress(Vec<String>),
    #[error("endpoint has no resolvable address: {0:?}")]
    BadEndpointAddress(Vec<String>),
    #[error("unsupported typed-value version {0} (only 0 and 3 exist)")]
    BadAmfVersion(u32),
}

/// The configuration document (§6.2): a status address and a list of
/// servers, each with listen endpoints, an application pattern, and
/// push/pull descriptor lists.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub status_address: Option<String>,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: Vec<String>,
    #[serde(default)]
    pub application: String,
    #[serde(default)]
    pub push: Vec<EndpointConfig>,
    #[serde(default)]
    pub pull: Vec<EndpointConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub addresses: Vec<String>,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: f32,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: f32,
    #[serde(default)]
    pub reconnect_count: u32,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: f32,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u32,
    #[serde(default)]
    pub amf_version: u32,
    #[serde(default = "default_true")]
    pub video: bool,
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default = "default_true")]
    pub data: bool,
    #[serde(default)]
    pub application_name: String,
    #[serde(default)]
    pub stream_name: String,
    #[serde(default)]
    pub meta_data_blacklist: BTreeSet<String>,
}

fn default_connection_timeout() -> f32 {
    5.0
}
fn default_reconnect_interval() -> f32 {
    5.0
}
fn default_ping_interval() -> f32 {
    60.0
}
fn default_buffer_size() -> u32 {
    3000
}
fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// A server's resolved startup shape: where to listen and the full endpoint
/// slice (implied host endpoints plus configured client endpoints).
pub struct ResolvedServer {
    pub listen: Vec<std::net::SocketAddr>,
    pub endpoints: Vec<Endpoint>,
}

impl ServerConfig {
    pub fn resolve(&self) -> Result<ResolvedServer, ConfigError> {
        let listen_strings = if self.listen.is_empty() {
            vec![format!("0.0.0.0:{}", crate::DEFAULT_PORT)]
        } else {
            self.listen.clone()
        };

        let mut listen = Vec::new();
        let mut listen_addresses = Vec::new();
        for text in &listen_strings {
            let addrs: Vec<_> = text
                .to_socket_addrs()
                .map_err(|_| ConfigError::BadListenAddress(listen_strings.clone()))?
                .filter(std::net::SocketAddr::is_ipv4)
                .collect();
            for addr in addrs {
                listen.push(addr);
                listen_addresses.push(Address {
                    url: text.clone(),
                    addr,
                });
            }
        }
        if listen.is_empty() {
            return Err(ConfigError::BadListenAddress(listen_strings));
        }

        // Accepted publishers and subscribers route through implied host
        // endpoints carrying the server's application pattern.
        let mut endpoints = Vec::new();
        for direction in [Direction::Input, Direction::Output] {
            endpoints.push(Endpoint {
                kind: Kind::Host,
                direction,
                addresses: listen_addresses.clone(),
                connection_timeout: default_connection_timeout(),
                reconnect_interval: default_reconnect_interval(),
                reconnect_count: 0,
                ping_interval: default_ping_interval(),
                buffer_size: default_buffer_size(),
                amf_version: amf::Version::Amf0,
                video_stream: true,
                audio_stream: true,
                data_stream: true,
                application_name: self.application.clone(),
                stream_name: String::new(),
                meta_data_blacklist: BTreeSet::new(),
            });
        }

        for (configs, direction) in [(&self.push, Direction::Output), (&self.pull, Direction::Input)] {
            for config in configs {
                endpoints.push(config.resolve(direction)?);
            }
        }

        Ok(ResolvedServer { listen, endpoints })
    }
}

impl EndpointConfig {
    fn resolve(&self, direction: Direction) -> Result<Endpoint, ConfigError> {
        let addresses: Vec<Address> = self
            .addresses
            .iter()
            .flat_map(|text| endpoint::resolve_address(text))
            .collect();
        if addresses.is_empty() {
            return Err(ConfigError::BadEndpointAddress(self.addresses.clone()));
        }

        let amf_version = match self.amf_version {
            0 => amf::Version::Amf0,
            3 => amf::Version::Amf3,
            other => return Err(ConfigError::BadAmfVersion(other)),
        };

        Ok(Endpoint {
            kind: Kind::Client,
            direction,
            addresses,
            connection_timeout: self.connection_timeout,
            reconnect_interval: self.reconnect_interval,
            reconnect_count: self.reconnect_count,
            ping_interval: self.ping_interval,
            buffer_size: self.buffer_size,
            amf_version,
            video_stream: self.video,
            audio_stream: self.audio,
            data_stream: self.data,
            application_name: self.application_name.clone(),
            stream_name: self.stream_name.clone(),
            meta_data_blacklist: self.meta_data_blacklist.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_document() {
        let config: Config = serde_json::from_str(
            r#"{
                "statusAddress": "0.0.0.0:8080",
                "servers": [{
                    "listen": ["0.0.0.0:1935"],
                    "application": "live",
                    "push": [{
                        "addresses": ["127.0.0.1:19350"],
                        "reconnectInterval": 2.0,
                        "reconnectCount": 3,
                        "video": true,
                        "audio": false,
                        "streamName": "{streamName}-backup",
                        "metaDataBlacklist": ["audiodatarate"]
                    }],
                    "pull": [{
                        "addresses": ["rtmp://127.0.0.1:19351"]
                    }]
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.status_address.as_deref(), Some("0.0.0.0:8080"));
        let server = &config.servers[0];
        assert_eq!(server.application, "live");
        assert_eq!(server.push[0].reconnect_interval, 2.0);
        assert!(!server.push[0].audio);
        assert_eq!(server.push[0].stream_name, "{streamName}-backup");

        let resolved = server.resolve().unwrap();
        assert_eq!(resolved.listen, vec!["0.0.0.0:1935".parse().unwrap()]);
        // Two implied host endpoints plus one push and one pull.
        assert_eq!(resolved.endpoints.len(), 4);
        assert_eq!(resolved.endpoints[2].kind, Kind::Client);
        assert_eq!(resolved.endpoints[2].direction, Direction::Output);
        assert_eq!(resolved.endpoints[3].direction, Direction::Input);
        assert_eq!(resolved.endpoints[3].ping_interval, 60.0);
    }

    #[test]
    fn defaults_listen_to_1935() {
        let config: Config =
            serde_json::from_str(r#"{"servers": [{"application": "live"}]}"#).unwrap();
        let resolved = config.servers[0].resolve().unwrap();
        assert_eq!(resolved.listen[0].port(), 1935);
    }

    #[test]
    fn rejects_unknown_typed_value_version() {
        let config: EndpointConfig = serde_json::from_str(
            r#"{"addresses": ["127.0.0.1:19350"], "amfVersion": 2}"#,
        )
        .unwrap();
        assert!(matches!(
            config.resolve(Direction::Output),
            Err(ConfigError::BadAmfVersion(2))
        ));
    }
}
