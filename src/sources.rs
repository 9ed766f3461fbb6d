// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Backend import from MCP client config files.
//!
//! First-run bootstrap can seed the control document from the JSON formats
//! other MCP clients already use: a `mcpServers` / `servers` / `mcp` section,
//! or a bare top-level map of server entries. Unknown keys inside an entry
//! are dropped with a warning; `command` given as a list is split into
//! command + args.

use serde_json::Value;
use std::collections::BTreeSet;
use tracing::warn;

use crate::document::BackendConfig;

/// Keys a backend entry may carry; everything else is ignored.
const KNOWN_ENTRY_KEYS: &[&str] = &[
    "command",
    "args",
    "env",
    "url",
    "type",
    "always_on",
    "idle_timeout_minutes",
    "tools",
];

/// Keys that make a bare top-level map look like a server section.
const ENTRY_MARKER_KEYS: &[&str] = &["command", "args", "url", "type"];

/// Extract backend entries from a client config document.
pub fn extract_backends(data: &Value) -> Vec<(String, BackendConfig)> {
    let Some(root) = data.as_object() else {
        return Vec::new();
    };

    for section_key in ["mcpServers", "servers", "mcp"] {
        if let Some(section) = root.get(section_key).and_then(|v| v.as_object()) {
            if !section.is_empty() {
                return normalize_entries(section);
            }
        }
    }

    // Bare format: every top-level key is a server name (plugin manifests).
    let all_objects = !root.is_empty() && root.values().all(|v| v.is_object());
    if all_objects {
        let looks_like_servers = root.values().any(|v| {
            v.as_object()
                .map(|entry| ENTRY_MARKER_KEYS.iter().any(|k| entry.contains_key(*k)))
                .unwrap_or(false)
        });
        if looks_like_servers {
            return normalize_entries(root);
        }
    }

    Vec::new()
}

fn normalize_entries(section: &serde_json::Map<String, Value>) -> Vec<(String, BackendConfig)> {
    let mut backends = Vec::new();

    for (name, entry) in section {
        let Some(entry) = entry.as_object() else {
            continue;
        };

        let mut entry = entry.clone();

        // Some clients write `command` as the full argv.
        if let Some(Value::Array(argv)) = entry.get("command").cloned() {
            let mut parts = argv.into_iter().filter_map(|v| match v {
                Value::String(s) => Some(Value::String(s)),
                other => Some(Value::String(other.to_string())),
            });
            match parts.next() {
                Some(first) => {
                    entry.insert("command".to_string(), first);
                    entry.insert("args".to_string(), Value::Array(parts.collect()));
                }
                None => continue,
            }
        }

        let unknown: BTreeSet<String> = entry
            .keys()
            .filter(|k| !KNOWN_ENTRY_KEYS.contains(&k.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            warn!(backend = %name, keys = ?unknown, "ignoring unknown config keys");
            for key in &unknown {
                entry.remove(key);
            }
        }

        match serde_json::from_value::<BackendConfig>(Value::Object(entry)) {
            Ok(config) => {
                if config.validate(name).is_ok() {
                    backends.push((name.clone(), config));
                } else {
                    warn!(backend = %name, "skipping entry without a usable endpoint");
                }
            }
            Err(e) => {
                warn!(backend = %name, error = %e, "skipping malformed entry");
            }
        }
    }

    backends
}
