//! Centralized configuration for the object-call protocol.
//!
//! Protocol constants that both peers must agree on, plus the runtime
//! options a peer may tune locally.

use std::collections::BTreeSet;
use std::time::Duration;

/// Protocol-level constants.
pub struct RpcConfig;

impl RpcConfig {
    /// Method name reserved for batch requests.
    pub const BATCH_METHOD_NAME: &'static str = "rpc-batch";
    /// Field written onto revivable objects naming their registered type.
    pub const REVIVAL_TAG_FIELD: &'static str = "__revive__";
    /// Prefix for ids synthesized for batch subcalls.
    pub const BATCH_SUBCALL_ID_PREFIX: &'static str = "rpc-batch-";
    pub const DEFAULT_DELIMITER: char = '.';

    /// Path segments that resolution never traverses.
    pub const DEFAULT_BLACKLIST: &'static [&'static str] = &[
        "__proto__",
        "prototype",
        "constructor",
        "__defineGetter__",
        "__defineSetter__",
        "__lookupGetter__",
        "__lookupSetter__",
        "then",
        "toStringTag",
    ];
}

/// Stream transport configuration.
pub struct TransportConfig;

impl TransportConfig {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_CONNECTIONS: usize = 64;
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Resolver tuning for an exposed object graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverOptions {
    pub delimiter: char,
    /// Extra forbidden segments, merged with [`RpcConfig::DEFAULT_BLACKLIST`].
    pub blacklist: BTreeSet<String>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            delimiter: RpcConfig::DEFAULT_DELIMITER,
            blacklist: BTreeSet::new(),
        }
    }
}

impl ResolverOptions {
    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn forbid(mut self, segment: impl Into<String>) -> Self {
        self.blacklist.insert(segment.into());
        self
    }

    /// The effective blacklist: defaults plus user additions.
    pub fn effective_blacklist(&self) -> BTreeSet<String> {
        RpcConfig::DEFAULT_BLACKLIST
            .iter()
            .map(|s| s.to_string())
            .chain(self.blacklist.iter().cloned())
            .collect()
    }
}
