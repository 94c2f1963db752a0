//! Logical endpoint names of multi-endpoint devices
//!
//! A two-gang switch exposes `state_left` and `state_right`; both are the same `state`
//! property routed to a different endpoint. The map below resolves the suffix back to an
//! endpoint id, and names inbound properties the other way round.

use compact_str::{CompactString, ToCompactString};

/// Separator between a property and its endpoint name
pub const SEPARATOR: char = '_';

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("key {key:?} has no endpoint and no default endpoint is declared")]
    NoEndpoint { key: CompactString },
}

/// A key split into its property and the endpoint it addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved<'a> {
    pub property: &'a str,
    pub endpoint_name: Option<&'a str>,
    pub endpoint: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointMap {
    names: Vec<(CompactString, u8)>,
    default: Option<u8>,
}

impl EndpointMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, endpoint: u8) -> Self {
        self.names.push((name.into(), endpoint));
        self
    }

    pub fn with_default(mut self, endpoint: u8) -> Self {
        self.default = Some(endpoint);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn default_endpoint(&self) -> Option<u8> {
        self.default
    }

    pub fn id(&self, name: &str) -> Option<u8> {
        self.names
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, endpoint)| *endpoint)
    }

    /// First name mapped to `endpoint`
    pub fn name(&self, endpoint: u8) -> Option<&str> {
        self.names
            .iter()
            .find(|(_, e)| *e == endpoint)
            .map(|(name, _)| name.as_str())
    }

    /// Splits `action_row_2` into (`action`, `row_2`) when `row_2` is a mapped name. When
    /// several suffixes are mapped, the longest one wins.
    pub fn split_key<'a>(&self, key: &'a str) -> (&'a str, Option<&'a str>) {
        for (i, _) in key.match_indices(SEPARATOR) {
            let (property, suffix) = (&key[..i], &key[i + 1..]);
            if !property.is_empty() && self.id(suffix).is_some() {
                return (property, Some(suffix));
            }
        }

        (key, None)
    }

    /// Resolves a key to its endpoint; unsuffixed keys go to the declared default
    pub fn resolve<'a>(&self, key: &'a str) -> Resolved<'a> {
        let (property, endpoint_name) = self.split_key(key);
        let endpoint = match endpoint_name {
            Some(name) => self.id(name),
            None => self.default,
        };

        Resolved { property, endpoint_name, endpoint }
    }

    /// Like [`Self::resolve`], but requires an endpoint to come out of it
    pub fn require<'a>(&self, key: &'a str) -> Result<Resolved<'a>, EndpointError> {
        let resolved = self.resolve(key);
        match resolved.endpoint {
            Some(_) => Ok(resolved),
            None => Err(EndpointError::NoEndpoint { key: key.into() }),
        }
    }

    /// Suffix used when naming a property reported by `endpoint`.
    ///
    /// Unmapped devices use the raw endpoint id; mapped devices only name mapped endpoints.
    pub fn suffix_for(&self, endpoint: u8) -> Option<CompactString> {
        if self.is_empty() {
            Some(endpoint.to_compact_string())
        } else {
            self.name(endpoint).map(CompactString::from)
        }
    }
}
