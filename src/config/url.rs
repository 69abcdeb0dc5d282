//! Connection URLs
//!
//! `service:mqmx:<protocol>://<host>/<transport-uri>?<query>`, for example
//! `service:mqmx:memory:///local?destination-kind=Queue` or
//! `service:mqmx:activemq:///tcp://localhost:61616?timeout-ms=5000`.
//!
//! Query parameters naming connection keys configure mqmx itself; every
//! other parameter is forwarded verbatim to the transport as part of its
//! broker URI.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::{ConfigError, KNOWN_KEYS};

/// URL prefix every connection URL starts with
pub const SCHEME: &str = "service:mqmx:";

// Characters left untouched when re-encoding forwarded parameters.
const QUERY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'*');

fn decode(component: &str) -> Result<String, ConfigError> {
    let spaced = component.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| ConfigError::MalformedUrl(format!("invalid query encoding: {}", e)))
}

fn decode_pair(pair: &str) -> Result<(String, Option<String>), ConfigError> {
    match pair.split_once('=') {
        Some((key, value)) => Ok((decode(key)?, Some(decode(value)?))),
        None => Ok((decode(pair)?, None)),
    }
}

fn raw_pairs(query: &str) -> impl Iterator<Item = &str> {
    let query = query.strip_prefix('?').unwrap_or(query);
    query.split('&').filter(|pair| !pair.is_empty())
}

/// Split a query string into decoded `(key, value)` pairs, in order.
pub fn parse_query(query: &str) -> Result<Vec<(String, Option<String>)>, ConfigError> {
    raw_pairs(query).map(decode_pair).collect()
}

/// One query parameter, decoded, with the text it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Param {
    key: String,
    value: Option<String>,
    raw: String,
}

/// Encode `params` as a query string, skipping every key in `ignore`.
pub fn rebuild_query(params: &[(String, Option<String>)], ignore: &[&str]) -> String {
    params
        .iter()
        .filter(|(key, _)| !ignore.contains(&key.as_str()))
        .map(|(key, value)| {
            let key = utf8_percent_encode(key, QUERY_ENCODE).to_string();
            match value {
                Some(value) => format!("{}={}", key, utf8_percent_encode(value, QUERY_ENCODE)),
                None => key,
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// A parsed connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrl {
    raw: String,
    protocol: String,
    host: String,
    transport_uri: String,
    params: Vec<Param>,
}

impl ServiceUrl {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let rest = url.strip_prefix(SCHEME).ok_or_else(|| {
            ConfigError::MalformedUrl(format!("'{}' does not start with {}", url, SCHEME))
        })?;
        let (protocol, rest) = rest.split_once("://").ok_or_else(|| {
            ConfigError::MalformedUrl(format!("'{}' is missing '://' after the protocol", url))
        })?;
        let valid_protocol = !protocol.is_empty()
            && protocol
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '.'));
        if !valid_protocol {
            return Err(ConfigError::MalformedUrl(format!(
                "invalid protocol '{}'",
                protocol
            )));
        }

        let (host, path) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => (rest, ""),
        };
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Err(ConfigError::MalformedUrl(format!(
                "'{}' has no transport URI",
                url
            )));
        }

        let (transport_uri, query) = path.split_once('?').unwrap_or((path, ""));
        let params = raw_pairs(query)
            .map(|pair| {
                let (key, value) = decode_pair(pair)?;
                Ok(Param {
                    key,
                    value,
                    raw: pair.to_string(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            raw: url.to_string(),
            protocol: protocol.to_string(),
            host: host.to_string(),
            transport_uri: transport_uri.to_string(),
            params,
        })
    }

    /// Transport protocol, e.g. `memory`
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Transport URI without its query
    pub fn transport_uri(&self) -> &str {
        &self.transport_uri
    }

    /// Decoded query parameters; keys without `=` map to an empty value
    pub fn parameters(&self) -> BTreeMap<String, String> {
        self.params
            .iter()
            .map(|p| (p.key.clone(), p.value.clone().unwrap_or_default()))
            .collect()
    }

    /// URI handed to the transport: the transport URI plus every query
    /// parameter that is not a connection key, exactly as written.
    pub fn broker_uri(&self) -> String {
        let query = self
            .params
            .iter()
            .filter(|p| !KNOWN_KEYS.contains(&p.key.as_str()))
            .map(|p| p.raw.as_str())
            .collect::<Vec<_>>()
            .join("&");
        if query.is_empty() {
            self.transport_uri.clone()
        } else {
            format!("{}?{}", self.transport_uri, query)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for ServiceUrl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
