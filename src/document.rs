// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Declarative control document: the single durable state of the relay.
//!
//! One YAML file is simultaneously the startup cache, the user-edited policy
//! surface, and the discovered-tool inventory. Saves go through a temporary
//! sibling plus rename so a crashing writer can never leave a torn file.
//! Backend order follows document insertion order; tool keys are kept in a
//! `BTreeMap` so serialized output is sorted and diffs stay meaningful.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::RelayError;
use crate::retrieval::RetrievalSettings;

/// Namespace separator between backend name and local item name.
pub const NAMESPACE_SEPARATOR: &str = "::";

/// Build the exposed name for a backend-local item: `B::t`.
pub fn qualify_name(backend: &str, item: &str) -> String {
    format!("{}{}{}", backend, NAMESPACE_SEPARATOR, item)
}

/// Split an exposed name on the *first* separator. Backend names cannot
/// contain `::`, so the remainder is the backend-local name verbatim.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout_minutes() -> u64 {
    5
}

/// Per-tool policy and inventory entry.
///
/// Discovery only ever touches `stale` and `description`; `enabled` belongs
/// to the user (document edits) or an explicit administrative action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEntry {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub description: String,
}

impl Default for ToolEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            stale: false,
            description: String::new(),
        }
    }
}

/// Transport hint for URL backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportHint {
    #[serde(rename = "stdio")]
    Stdio,
    #[serde(rename = "streamable-http", alias = "streamablehttp")]
    StreamableHttp,
    #[serde(rename = "sse", alias = "http")]
    Sse,
}

/// Declared configuration for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Local subprocess command. Exclusive with `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment for the subprocess. Values are coerced to strings on load.
    #[serde(
        default,
        deserialize_with = "de_string_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub env: BTreeMap<String, String>,
    /// Remote endpoint. Exclusive with `command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Optional transport hint for URL backends.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportHint>,
    /// Pinned backends stay connected for the lifetime of the relay.
    #[serde(default)]
    pub always_on: bool,
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, ToolEntry>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            url: None,
            transport: None,
            always_on: false,
            idle_timeout_minutes: default_idle_timeout_minutes(),
            tools: BTreeMap::new(),
        }
    }
}

impl BackendConfig {
    /// Exactly one of `command` / `url` must be declared.
    pub fn validate(&self, name: &str) -> Result<(), RelayError> {
        if name.contains(NAMESPACE_SEPARATOR) {
            return Err(RelayError::InvalidName(name.to_string()));
        }
        match (&self.command, &self.url) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(RelayError::InvalidBackendConfig(name.to_string())),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes * 60)
    }
}

/// Coerce every scalar env value to a string so numeric or boolean YAML
/// values do not fail deserialization before reaching the transport factory.
fn de_string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, serde_yaml::Value> = BTreeMap::deserialize(deserializer)?;
    let mut out = BTreeMap::new();
    for (key, value) in raw {
        let coerced = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Null => String::new(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "env value for '{}' must be a scalar, got {:?}",
                    key, other
                )))
            }
        };
        out.insert(key, coerced);
    }
    Ok(out)
}

/// Map of backend name to config that preserves document insertion order.
///
/// YAML mappings carry an order that matters to humans editing the file and
/// to deterministic listings, so a hash map will not do here.
#[derive(Debug, Clone, Default)]
pub struct ServerMap {
    entries: Vec<(String, BackendConfig)>,
}

impl ServerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&BackendConfig> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut BackendConfig> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    /// Insert or replace. A replace keeps the original position.
    pub fn insert(&mut self, name: String, config: BackendConfig) -> Option<BackendConfig> {
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            return Some(std::mem::replace(&mut slot.1, config));
        }
        self.entries.push((name, config));
        None
    }

    pub fn remove(&mut self, name: &str) -> Option<BackendConfig> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BackendConfig)> {
        self.entries.iter().map(|(n, c)| (n, c))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut BackendConfig)> {
        self.entries.iter_mut().map(|(n, c)| (&*n, c))
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.iter().map(|(n, _)| n)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ServerMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, config) in &self.entries {
            map.serialize_entry(name, config)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ServerMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ServerMapVisitor;

        impl<'de> Visitor<'de> for ServerMapVisitor {
            type Value = ServerMap;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a mapping of backend name to backend config")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, config)) = access.next_entry::<String, BackendConfig>()? {
                    entries.push((name, config));
                }
                Ok(ServerMap { entries })
            }
        }

        deserializer.deserialize_map(ServerMapVisitor)
    }
}

/// Top-level control document. Unknown keys are ignored for forward
/// compatibility; an empty or missing file is equivalent to `servers: {}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub servers: ServerMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalSettings>,
}

impl Document {
    /// Validate every declared backend.
    pub fn validate(&self) -> Result<(), RelayError> {
        for (name, config) in self.servers.iter() {
            config.validate(name)?;
        }
        Ok(())
    }
}

/// Owner of the on-disk document file.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    path: PathBuf,
}

impl DocumentStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// `<user-config-dir>/mcp-relay/servers.yaml`
    pub fn default_path() -> Option<PathBuf> {
        directories::BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("mcp-relay").join("servers.yaml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing file is an empty document, not an error.
    pub fn load(&self) -> Result<Document, RelayError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "control document not found, starting empty");
            return Ok(Document::default());
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| RelayError::ConfigCorrupt(format!("{}: {}", self.path.display(), e)))?;

        if content.trim().is_empty() {
            return Ok(Document::default());
        }

        let document: Document = serde_yaml::from_str(&content)
            .map_err(|e| RelayError::ConfigCorrupt(format!("{}: {}", self.path.display(), e)))?;
        document
            .validate()
            .map_err(|e| RelayError::ConfigCorrupt(e.to_string()))?;

        info!(
            path = %self.path.display(),
            backends = document.servers.len(),
            "loaded control document"
        );
        Ok(document)
    }

    /// Save atomically: write a temporary sibling, then rename into place.
    pub fn save(&self, document: &Document) -> Result<(), RelayError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RelayError::ConfigUnwritable(format!("create dir: {}", e)))?;
        }

        let content = serde_yaml::to_string(document)
            .map_err(|e| RelayError::ConfigUnwritable(format!("serialize: {}", e)))?;

        let temp_path = self.path.with_extension("yaml.tmp");
        fs::write(&temp_path, content)
            .map_err(|e| RelayError::ConfigUnwritable(format!("write temp: {}", e)))?;
        fs::rename(&temp_path, &self.path)
            .map_err(|e| RelayError::ConfigUnwritable(format!("rename: {}", e)))?;

        debug!(path = %self.path.display(), "control document saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stdio_backend(command: &str) -> BackendConfig {
        BackendConfig {
            command: Some(command.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_file_is_empty_document() {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::new(dir.path().join("servers.yaml"));
        let doc = store.load().unwrap();
        assert!(doc.servers.is_empty());
    }

    #[test]
    fn test_empty_file_is_empty_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.yaml");
        fs::write(&path, "\n").unwrap();
        let doc = DocumentStore::new(&path).load().unwrap();
        assert!(doc.servers.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.yaml");
        fs::write(&path, "servers: [not, a, mapping").unwrap();
        let err = DocumentStore::new(&path).load().unwrap_err();
        assert!(matches!(err, RelayError::ConfigCorrupt(_)));
    }

    #[test]
    fn test_backend_must_have_exactly_one_endpoint() {
        let mut both = stdio_backend("npx");
        both.url = Some("https://example.com/mcp".into());
        assert!(matches!(
            both.validate("alpha"),
            Err(RelayError::InvalidBackendConfig(_))
        ));

        let neither = BackendConfig::default();
        assert!(neither.validate("alpha").is_err());
        assert!(stdio_backend("npx").validate("alpha").is_ok());
    }

    #[test]
    fn test_separator_rejected_in_backend_name() {
        let err = stdio_backend("npx").validate("bad::name").unwrap_err();
        assert!(matches!(err, RelayError::InvalidName(_)));
    }

    #[test]
    fn test_save_load_roundtrip_preserves_insertion_order() {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::new(dir.path().join("servers.yaml"));

        let mut doc = Document::default();
        doc.servers.insert("zeta".into(), stdio_backend("npx"));
        doc.servers.insert("alpha".into(), stdio_backend("uvx"));
        doc.servers.insert("mid".into(), stdio_backend("node"));
        store.save(&doc).unwrap();

        let loaded = store.load().unwrap();
        let names: Vec<&String> = loaded.servers.names().collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_tool_keys_serialize_sorted() {
        let mut config = stdio_backend("npx");
        config.tools.insert("zebra".into(), ToolEntry::default());
        config.tools.insert("apple".into(), ToolEntry::default());
        config.tools.insert("mango".into(), ToolEntry::default());

        let mut doc = Document::default();
        doc.servers.insert("alpha".into(), config);

        let yaml = serde_yaml::to_string(&doc).unwrap();
        let apple = yaml.find("apple").unwrap();
        let mango = yaml.find("mango").unwrap();
        let zebra = yaml.find("zebra").unwrap();
        assert!(apple < mango && mango < zebra);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let yaml = r#"
servers:
  alpha:
    command: npx
    future_field: whatever
banner: "hello"
"#;
        let doc: Document = serde_yaml::from_str(yaml).unwrap();
        assert!(doc.servers.contains("alpha"));
    }

    #[test]
    fn test_env_values_coerced_to_strings() {
        let yaml = r#"
servers:
  alpha:
    command: npx
    env:
      PORT: 8080
      DEBUG: true
      NAME: plain
"#;
        let doc: Document = serde_yaml::from_str(yaml).unwrap();
        let env = &doc.servers.get("alpha").unwrap().env;
        assert_eq!(env.get("PORT").unwrap(), "8080");
        assert_eq!(env.get("DEBUG").unwrap(), "true");
        assert_eq!(env.get("NAME").unwrap(), "plain");
    }

    #[test]
    fn test_defaults_applied() {
        let yaml = r#"
servers:
  alpha:
    command: npx
    tools:
      search: {}
"#;
        let doc: Document = serde_yaml::from_str(yaml).unwrap();
        let config = doc.servers.get("alpha").unwrap();
        assert!(!config.always_on);
        assert_eq!(config.idle_timeout_minutes, 5);
        let entry = config.tools.get("search").unwrap();
        assert!(entry.enabled);
        assert!(!entry.stale);
    }

    #[test]
    fn test_save_leaves_no_temp_sibling() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.yaml");
        let store = DocumentStore::new(&path);
        store.save(&Document::default()).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("yaml.tmp").exists());
    }

    #[test]
    fn test_qualified_name_round_trip() {
        let name = qualify_name("alpha", "search");
        assert_eq!(name, "alpha::search");
        assert_eq!(split_qualified(&name), Some(("alpha", "search")));
        // Local names may themselves contain the separator.
        assert_eq!(
            split_qualified("alpha::ns::tool"),
            Some(("alpha", "ns::tool"))
        );
        assert_eq!(split_qualified("unqualified"), None);
    }

    #[test]
    fn test_transport_hint_aliases() {
        let yaml = r#"
servers:
  a:
    url: https://example.com/mcp
    type: streamablehttp
  b:
    url: https://example.com/sse
    type: http
"#;
        let doc: Document = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            doc.servers.get("a").unwrap().transport,
            Some(TransportHint::StreamableHttp)
        );
        assert_eq!(doc.servers.get("b").unwrap().transport, Some(TransportHint::Sse));
    }
}
