//! Resource identifiers: `domain:key=value[,key=value...]`.
//!
//! Patterns use `*` and `?` in the domain and a trailing `*` in the key
//! property list (`mqmx:type=Counter,*`). Equality and hashing use the
//! canonical form, where properties are sorted by key.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::ManagementError;

#[derive(Clone)]
pub struct ObjectName {
    domain: String,
    properties: Vec<(String, String)>,
    property_pattern: bool,
    canonical: String,
}

fn malformed(name: &str, reason: &str) -> ManagementError {
    ManagementError::MalformedObjectName(format!("'{}': {}", name, reason))
}

/// `*` matches any run of characters, `?` exactly one.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

impl ObjectName {
    pub fn parse(name: &str) -> Result<Self, ManagementError> {
        let (domain, list) = name
            .split_once(':')
            .ok_or_else(|| malformed(name, "missing ':' after the domain"))?;

        let mut properties: Vec<(String, String)> = Vec::new();
        let mut property_pattern = false;
        for part in list.split(',') {
            if property_pattern {
                return Err(malformed(name, "'*' must be the last key property"));
            }
            if part == "*" {
                property_pattern = true;
                continue;
            }
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| malformed(name, "key properties must be key=value"))?;
            if key.is_empty() || value.is_empty() {
                return Err(malformed(name, "empty key or value"));
            }
            if properties.iter().any(|(k, _)| k == key) {
                return Err(malformed(name, "duplicate key"));
            }
            properties.push((key.to_string(), value.to_string()));
        }
        if properties.is_empty() && !property_pattern {
            return Err(malformed(name, "no key properties"));
        }

        let mut sorted: Vec<String> = properties.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        sorted.sort();
        if property_pattern {
            sorted.push("*".to_string());
        }
        let canonical = format!("{}:{}", domain, sorted.join(","));

        Ok(Self {
            domain: domain.to_string(),
            properties,
            property_pattern,
            canonical,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn key_property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Properties sorted by key
    pub fn canonical_name(&self) -> &str {
        &self.canonical
    }

    pub fn is_pattern(&self) -> bool {
        self.property_pattern || self.domain.contains(|c: char| c == '*' || c == '?')
    }

    /// Whether `name` is selected by this (possibly pattern) name.
    pub fn matches(&self, name: &ObjectName) -> bool {
        if !glob_match(self.domain.as_bytes(), name.domain.as_bytes()) {
            return false;
        }
        let all_present = self
            .properties
            .iter()
            .all(|(k, v)| name.key_property(k) == Some(v.as_str()));
        all_present && (self.property_pattern || self.properties.len() == name.properties.len())
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.domain)?;
        let mut first = true;
        for (key, value) in &self.properties {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        if self.property_pattern {
            f.write_str(if first { "*" } else { ",*" })?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectName({})", self)
    }
}

impl PartialEq for ObjectName {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for ObjectName {}

impl Hash for ObjectName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for ObjectName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl FromStr for ObjectName {
    type Err = ManagementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ObjectName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
