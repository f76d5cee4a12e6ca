use crate::amf;
use log::warn;
use std::{collections::BTreeSet, net::SocketAddr};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Direction {
    #[display(fmt = "NONE")]
    None,
    #[display(fmt = "INPUT")]
    Input,
    #[display(fmt = "OUTPUT")]
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Kind {
    /// A peer we accepted.
    #[display(fmt = "HOST")]
    Host,
    /// A connection we dial out.
    #[display(fmt = "CLIENT")]
    Client,
}

/// A configured address: the resolved socket address plus the original
/// host:port text, which client connections embed in their `tcUrl`.
#[derive(Debug, Clone)]
pub struct Address {
    pub url: String,
    pub addr: SocketAddr,
}

/// Immutable configuration record describing either a listen surface or a
/// dial-out target, with naming and propagation policy.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub kind: Kind,
    pub direction: Direction,
    pub addresses: Vec<Address>,
    pub connection_timeout: f32,
    pub reconnect_interval: f32,
    pub reconnect_count: u32,
    pub ping_interval: f32,
    pub buffer_size: u32,
    pub amf_version: amf::Version,
    pub video_stream: bool,
    pub audio_stream: bool,
    pub data_stream: bool,
    /// Name templates; `{id}`, `{streamName}`, `{applicationName}`,
    /// `{ipAddress}` and `{port}` expand, and an empty template matches
    /// anything during endpoint lookup.
    pub application_name: String,
    pub stream_name: String,
    pub meta_data_blacklist: BTreeSet<String>,
}

impl Endpoint {
    pub fn is_name_known(&self) -> bool {
        !self.application_name.is_empty()
            && !self.stream_name.is_empty()
            && !self.application_name.contains('{')
            && !self.stream_name.contains('{')
    }

    /// Does this endpoint serve the given local listen address? A wildcard
    /// bind (0.0.0.0) matches on port alone.
    pub fn serves_address(&self, local: SocketAddr) -> bool {
        self.addresses.iter().any(|address| {
            address.addr.port() == local.port()
                && (address.addr.ip().is_unspecified() || address.addr.ip() == local.ip())
        })
    }

    pub fn matches(&self, direction: Direction, application: &str, stream: &str) -> bool {
        self.direction == direction
            && template_matches(&self.application_name, application)
            && template_matches(&self.stream_name, stream)
    }
}

/// Literal-text replacement of `{placeholder}` tokens from the fixed
/// vocabulary; duplicates in the template all expand.
pub fn replace_tokens(template: &str, tokens: &[(&str, String)]) -> String {
    let mut result = template.to_owned();
    for (token, value) in tokens {
        result = result.replace(&format!("{{{}}}", token), value);
    }
    result
}

/// Template matching for endpoint lookup: placeholders act as wildcards, so
/// the template's literal fragments must appear in order, anchored at both
/// ends. An empty template matches anything.
pub fn template_matches(template: &str, value: &str) -> bool {
    if template.is_empty() {
        return true;
    }
    if !template.contains('{') {
        return template == value;
    }

    let mut remaining = value;
    let mut fragments = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        fragments.push(&rest[..start]);
        match rest[start..].find('}') {
            Some(end) => rest = &rest[start + end + 1..],
            None => return template == value,
        }
    }
    fragments.push(rest);

    let last = fragments.len() - 1;
    for (i, fragment) in fragments.iter().enumerate() {
        if fragment.is_empty() {
            continue;
        }
        if i == 0 {
            match remaining.strip_prefix(fragment) {
                Some(rest) => remaining = rest,
                None => return false,
            }
        } else if i == last {
            return remaining.ends_with(fragment);
        } else {
            match remaining.find(fragment) {
                Some(at) => remaining = &remaining[at + fragment.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Resolves a configured address string to its IPv4 socket addresses.
/// Accepts `host:port`, bare `host` (default port 1935), or an
/// `rtmp://host:port` URL; resolution itself is the standard resolver's
/// business.
pub fn resolve_address(input: &str) -> Vec<Address> {
    let text = if input.contains("://") {
        input.to_owned()
    } else {
        format!("rtmp://{}", input)
    };

    let url = match Url::parse(&text) {
        Ok(url) => url,
        Err(err) => {
            warn!("ignoring unparsable address \"{}\": {}", input, err);
            return Vec::new();
        }
    };

    let host = match url.host_str() {
        Some(host) => host.to_owned(),
        None => {
            warn!("ignoring address without a host: \"{}\"", input);
            return Vec::new();
        }
    };
    let port = url.port().unwrap_or(crate::DEFAULT_PORT);

    match url.socket_addrs(|| Some(crate::DEFAULT_PORT)) {
        Ok(addrs) => addrs
            .into_iter()
            .filter(SocketAddr::is_ipv4)
            .map(|addr| Address {
                url: format!("{}:{}", host, port),
                addr,
            })
            .collect(),
        Err(err) => {
            warn!("failed to resolve \"{}\": {}", input, err);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_expand_including_duplicates() {
        let tokens = [
            ("id", "7".to_owned()),
            ("streamName", "cam1".to_owned()),
            ("applicationName", "live".to_owned()),
        ];
        assert_eq!(
            replace_tokens("{applicationName}/{streamName}-{id}-{streamName}", &tokens),
            "live/cam1-7-cam1"
        );
        assert_eq!(replace_tokens("plain", &tokens), "plain");
        assert_eq!(replace_tokens("{unknown}", &tokens), "{unknown}");
    }

    #[test]
    fn template_matching_treats_placeholders_as_wildcards() {
        assert!(template_matches("", "anything"));
        assert!(template_matches("live", "live"));
        assert!(!template_matches("live", "vod"));
        assert!(template_matches("{streamName}", "cam1"));
        assert!(template_matches("live-{id}", "live-42"));
        assert!(!template_matches("live-{id}", "vod-42"));
        assert!(template_matches("{app}/backup", "live/backup"));
        assert!(!template_matches("{app}/backup", "live/primary"));
        assert!(template_matches("a-{x}-b-{y}-c", "a-1-b-2-c"));
        assert!(!template_matches("a-{x}-b-{y}-c", "a-1-c-2-b"));
    }

    #[test]
    fn resolve_accepts_bare_and_url_forms() {
        let plain = resolve_address("127.0.0.1:2000");
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].addr, "127.0.0.1:2000".parse().unwrap());
        assert_eq!(plain[0].url, "127.0.0.1:2000");

        let defaulted = resolve_address("127.0.0.1");
        assert_eq!(defaulted[0].addr.port(), 1935);

        let url = resolve_address("rtmp://127.0.0.1:1940");
        assert_eq!(url[0].addr, "127.0.0.1:1940".parse().unwrap());

        assert!(resolve_address("not a url at all \u{7f}").is_empty());
    }

    #[test]
    fn wildcard_bind_matches_on_port() {
        let endpoint = Endpoint {
            kind: Kind::Host,
            direction: Direction::Input,
            addresses: vec![Address {
                url: "0.0.0.0:1935".to_owned(),
                addr: "0.0.0.0:1935".parse().unwrap(),
            }],
            connection_timeout: 5.0,
            reconnect_interval: 5.0,
            reconnect_count: 3,
            ping_interval: 60.0,
            buffer_size: 3000,
            amf_version: amf::Version::Amf0,
            video_stream: true,
            audio_stream: true,
            data_stream: true,
            application_name: String::new(),
            stream_name: String::new(),
            meta_data_blacklist: BTreeSet::new(),
        };
        assert!(endpoint.serves_address("192.168.1.5:1935".parse().unwrap()));
        assert!(!endpoint.serves_address("192.168.1.5:1936".parse().unwrap()));
    }
}
