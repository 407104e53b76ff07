//! Declarative tenants file
//!
//! ```json
//! { "tenants": [ { "namespace": "alpha", "prefixes": ["10.1.0.0/24"] } ] }
//! ```
//!
//! The file is JSON, or YAML when its extension is `.yaml`/`.yml`. A file
//! that cannot be read or parsed is reported as a source error and the last
//! good state is kept.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use vpnv4_common::{AgentError, AgentResult};

use super::ChangeSource;
use crate::types::{normalize_prefix, ChangeEvent};

#[derive(Debug, Deserialize)]
struct TenantsFile {
    tenants: Vec<TenantEntry>,
}

#[derive(Debug, Deserialize)]
struct TenantEntry {
    #[serde(default, alias = "name")]
    namespace: Option<String>,
    #[serde(default)]
    prefixes: Vec<String>,
}

/// Identity of the last content read
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    digest: Vec<u8>,
}

/// Change source backed by a tenants file
#[derive(Debug)]
pub struct FileSource {
    name: String,
    path: PathBuf,
    interval: Duration,
    resync_every: u32,
    polls: u64,
    last_seen: Option<Fingerprint>,
    state: BTreeMap<String, BTreeSet<IpNet>>,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>, interval: Duration, resync_every: u32) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: format!("file:{}", path.display()),
            path,
            interval,
            resync_every: resync_every.max(1),
            polls: 0,
            last_seen: None,
            state: BTreeMap::new(),
        }
    }

    /// Tenants from the last successfully parsed file
    pub fn state(&self) -> &BTreeMap<String, BTreeSet<IpNet>> {
        &self.state
    }

    fn is_yaml(&self) -> bool {
        matches!(
            self.path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        )
    }

    fn parse(&self, content: &[u8]) -> AgentResult<BTreeMap<String, BTreeSet<IpNet>>> {
        let file: TenantsFile = if self.is_yaml() {
            serde_yaml::from_slice(content).map_err(|e| AgentError::source(&self.name, e.to_string()))?
        } else {
            serde_json::from_slice(content).map_err(|e| AgentError::source(&self.name, e.to_string()))?
        };

        let mut desired = BTreeMap::new();
        for entry in file.tenants {
            let Some(namespace) = entry.namespace.filter(|n| !n.is_empty()) else {
                debug!(source = %self.name, "Skipping tenant entry without a name");
                continue;
            };
            let prefixes = entry
                .prefixes
                .iter()
                .map(|p| normalize_prefix(p))
                .collect::<Result<BTreeSet<_>, _>>()
                .map_err(|e| AgentError::source(&self.name, format!("tenant {}: {}", namespace, e)))?;
            desired.insert(namespace, prefixes);
        }
        Ok(desired)
    }

    fn diff(&self, desired: &BTreeMap<String, BTreeSet<IpNet>>, full: bool) -> Vec<ChangeEvent> {
        let mut events: Vec<ChangeEvent> = desired
            .iter()
            .filter(|(name, prefixes)| full || self.state.get(*name) != Some(*prefixes))
            .map(|(name, prefixes)| ChangeEvent::upsert(name.clone(), prefixes.iter().copied()))
            .collect();
        events.extend(
            self.state
                .keys()
                .filter(|name| !desired.contains_key(*name))
                .map(|name| ChangeEvent::delete(name.clone())),
        );
        events
    }
}

#[async_trait]
impl ChangeSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll(&mut self) -> AgentResult<Vec<ChangeEvent>> {
        self.polls += 1;
        let resync = self.polls % u64::from(self.resync_every) == 0;

        let (content, modified) = match tokio::fs::read(&self.path).await {
            Ok(content) => {
                let modified = tokio::fs::metadata(&self.path)
                    .await
                    .and_then(|m| m.modified())
                    .ok();
                (content, modified)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Tenants file does not exist yet");
                return Ok(if resync { self.diff(&self.state, true) } else { Vec::new() });
            }
            Err(e) => return Err(AgentError::source(&self.name, e.to_string())),
        };

        let fingerprint = Fingerprint {
            modified,
            digest: Sha256::digest(&content).to_vec(),
        };
        if !resync && self.last_seen.as_ref() == Some(&fingerprint) {
            return Ok(Vec::new());
        }
        self.last_seen = Some(fingerprint);

        let desired = self.parse(&content)?;
        let events = self.diff(&desired, resync);
        if !events.is_empty() {
            info!(
                source = %self.name,
                tenants = desired.len(),
                events = events.len(),
                resync,
                "Tenants file changed"
            );
        }
        self.state = desired;
        Ok(events)
    }
}
