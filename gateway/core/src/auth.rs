//! Credential Extraction
//!
//! Clients present their API key in different places depending on the SDK
//! they use. Each place is one [`CredentialExtractor`]; a [`CredentialChain`]
//! tries them in priority order and the first hit wins:
//!
//! | Extractor              | Source                                         |
//! |------------------------|------------------------------------------------|
//! | [`BearerExtractor`]    | `Authorization: Bearer sk-...`                 |
//! | [`HeaderKeyExtractor`] | `x-api-key`, `x-goog-api-key`, `api-key`       |
//! | [`QueryParamExtractor`]| `?key=...` (WebSocket upgrades, Gemini SDKs)   |

use std::collections::HashMap;
use std::net::IpAddr;

use crate::error::{GatewayError, Result};

// ============================================================================
// Request Parts
// ============================================================================

/// The transport-neutral parts of an inbound request that carry credentials
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestParts {
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    /// Peer address, used as the rate-limit key for anonymous traffic
    pub client_ip: Option<IpAddr>,
}

impl RequestParts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header; names are case-insensitive
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Add a query parameter
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Parse `a=1&b=2` into query parameters (no percent-decoding)
    #[must_use]
    pub fn with_query_string(mut self, query: &str) -> Self {
        for pair in query.trim_start_matches('?').split('&') {
            if let Some((name, value)) = pair.split_once('=') {
                self.query.insert(name.to_owned(), value.to_owned());
            }
        }
        self
    }

    #[must_use]
    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

// ============================================================================
// Extractors
// ============================================================================

/// Where a credential was found
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    Bearer,
    Header(&'static str),
    Query(&'static str),
}

/// An API key pulled from a request
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Token key with any `sk-` prefix removed
    pub key: String,
    pub source: CredentialSource,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("key", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

/// One place a credential may be found
pub trait CredentialExtractor: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// The credential, if this extractor's source carries one
    fn extract(&self, parts: &RequestParts) -> Option<Credential>;
}

fn normalize_key(raw: &str) -> Option<String> {
    let key = raw.trim();
    let key = key.strip_prefix("sk-").unwrap_or(key);
    (!key.is_empty()).then(|| key.to_owned())
}

/// `Authorization: Bearer <key>`
#[derive(Clone, Copy, Debug, Default)]
pub struct BearerExtractor;

impl CredentialExtractor for BearerExtractor {
    fn name(&self) -> &'static str {
        "bearer"
    }

    fn extract(&self, parts: &RequestParts) -> Option<Credential> {
        let value = parts.header("authorization")?.trim();
        let (scheme, token) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        Some(Credential {
            key: normalize_key(token)?,
            source: CredentialSource::Bearer,
        })
    }
}

/// Vendor API-key headers, first present one wins
#[derive(Clone, Debug)]
pub struct HeaderKeyExtractor {
    headers: Vec<&'static str>,
}

impl Default for HeaderKeyExtractor {
    fn default() -> Self {
        Self::new(vec!["x-api-key", "x-goog-api-key", "api-key"])
    }
}

impl HeaderKeyExtractor {
    /// Extractor over `headers`, in priority order
    pub fn new(headers: Vec<&'static str>) -> Self {
        Self { headers }
    }
}

impl CredentialExtractor for HeaderKeyExtractor {
    fn name(&self) -> &'static str {
        "header"
    }

    fn extract(&self, parts: &RequestParts) -> Option<Credential> {
        self.headers.iter().find_map(|&name| {
            Some(Credential {
                key: normalize_key(parts.header(name)?)?,
                source: CredentialSource::Header(name),
            })
        })
    }
}

/// Query-string key, for clients that cannot set headers
#[derive(Clone, Debug)]
pub struct QueryParamExtractor {
    param: &'static str,
}

impl Default for QueryParamExtractor {
    fn default() -> Self {
        Self::new("key")
    }
}

impl QueryParamExtractor {
    pub fn new(param: &'static str) -> Self {
        Self { param }
    }
}

impl CredentialExtractor for QueryParamExtractor {
    fn name(&self) -> &'static str {
        "query"
    }

    fn extract(&self, parts: &RequestParts) -> Option<Credential> {
        Some(Credential {
            key: normalize_key(parts.query(self.param)?)?,
            source: CredentialSource::Query(self.param),
        })
    }
}

// ============================================================================
// Chain
// ============================================================================

/// Ordered list of extractors
pub struct CredentialChain {
    extractors: Vec<Box<dyn CredentialExtractor>>,
}

impl Default for CredentialChain {
    /// Bearer, then vendor headers, then `?key=`
    fn default() -> Self {
        Self::empty()
            .with(BearerExtractor)
            .with(HeaderKeyExtractor::default())
            .with(QueryParamExtractor::default())
    }
}

impl std::fmt::Debug for CredentialChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.extractors.iter().map(|e| e.name()).collect();
        f.debug_struct("CredentialChain").field("extractors", &names).finish()
    }
}

impl CredentialChain {
    /// Chain with no extractors
    pub fn empty() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    /// Append an extractor at the lowest priority
    #[must_use]
    pub fn with(mut self, extractor: impl CredentialExtractor + 'static) -> Self {
        self.extractors.push(Box::new(extractor));
        self
    }

    /// First credential found, or `NotFound`
    pub fn extract(&self, parts: &RequestParts) -> Result<Credential> {
        for extractor in &self.extractors {
            if let Some(credential) = extractor.extract(parts) {
                tracing::trace!(extractor = extractor.name(), "credential extracted");
                return Ok(credential);
            }
        }
        Err(GatewayError::NotFound("no API key in request".into()))
    }
}
