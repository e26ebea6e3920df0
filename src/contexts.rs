//! Cluster context lookup
//!
//! The multiplexer resolves a cluster identity to the REST configuration
//! needed to reach its API server: host URL, TLS material, and TLS
//! verification mode. Lookup goes through the [`ContextStore`] trait so the
//! hosting process decides where contexts come from (kubeconfig
//! reconciliation, dynamic registration, tests).

use dashmap::DashMap;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Connection parameters for one cluster's API server.
#[derive(Clone, Debug, Default)]
pub struct RestConfig {
    /// Base URL of the API server, e.g. `https://10.0.0.1:6443`.
    pub host: String,
    /// PEM-encoded CA bundle used to verify the server certificate.
    pub ca_data: Option<Vec<u8>>,
    /// PEM-encoded client certificate for mTLS, if the cluster requires it.
    pub client_cert_data: Option<Vec<u8>>,
    /// PEM-encoded client private key paired with `client_cert_data`.
    pub client_key_data: Option<Vec<u8>>,
    /// Skip server certificate verification.
    pub insecure_skip_tls_verify: bool,
}

/// Lookup of [`RestConfig`] by cluster key.
///
/// Keys are either a plain cluster ID or, for per-session dynamic clusters,
/// the cluster ID concatenated with the user ID (see
/// [`Multiplexer`](crate::mux::Multiplexer)).
#[cfg_attr(test, mockall::automock)]
pub trait ContextStore: Send + Sync {
    /// Return the REST config stored under `key`.
    fn rest_config(&self, key: &str) -> Result<RestConfig>;
}

/// In-memory [`ContextStore`].
#[derive(Default)]
pub struct MemoryContextStore {
    contexts: DashMap<String, RestConfig>,
}

impl MemoryContextStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the context stored under `key`.
    pub fn add_context(&self, key: impl Into<String>, config: RestConfig) {
        self.contexts.insert(key.into(), config);
    }

    /// Remove the context stored under `key`.
    pub fn remove_context(&self, key: &str) {
        self.contexts.remove(key);
    }

    /// Load contexts from a JSON file (see [`ContextFile`]).
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("reading context file: {e}")))?;
        let file: ContextFile = serde_json::from_str(&raw)
            .map_err(|e| Error::Internal(format!("parsing context file: {e}")))?;

        let store = Self::new();
        for (name, entry) in file.clusters {
            let ca_data = match &entry.ca_file {
                Some(ca_path) => Some(
                    std::fs::read(ca_path)
                        .map_err(|e| Error::Internal(format!("reading CA for {name}: {e}")))?,
                ),
                None => None,
            };
            store.add_context(
                name,
                RestConfig {
                    host: entry.server,
                    ca_data,
                    client_cert_data: None,
                    client_key_data: None,
                    insecure_skip_tls_verify: entry.insecure_skip_tls_verify,
                },
            );
        }

        Ok(store)
    }
}

impl ContextStore for MemoryContextStore {
    fn rest_config(&self, key: &str) -> Result<RestConfig> {
        self.contexts
            .get(key)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::UnknownCluster(key.to_string()))
    }
}

/// On-disk format accepted by [`MemoryContextStore::from_file`].
#[derive(Deserialize)]
pub struct ContextFile {
    /// Cluster name to connection parameters.
    pub clusters: std::collections::HashMap<String, ContextEntry>,
}

/// One cluster entry in a [`ContextFile`].
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    /// API server base URL.
    pub server: String,
    /// Path to a PEM CA bundle on disk.
    #[serde(default)]
    pub ca_file: Option<std::path::PathBuf>,
    /// Skip server certificate verification.
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}
