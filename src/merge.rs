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

//! Reconciliation of discovery observations with the control document.
//!
//! The merge preserves user intent across rediscovery: `enabled` is never
//! touched here, only `stale` and `description`. All functions are pure and
//! total; nothing in this module suspends or fails.

use std::collections::BTreeSet;

use crate::document::{Document, ToolEntry};

/// One observed tool from a discovery pass.
#[derive(Debug, Clone)]
pub struct ObservedTool {
    pub name: String,
    pub description: Option<String>,
}

/// Merge a freshly observed tool list for `backend` into the document.
///
/// - observed and new: inserted enabled and fresh
/// - observed and known: `enabled` kept, `stale` cleared, description refreshed
/// - known but unobserved: marked stale, `enabled` preserved
///
/// A backend absent from the document is left untouched.
pub fn merge_discovered(document: &mut Document, backend: &str, observed: &[ObservedTool]) {
    let Some(config) = document.servers.get_mut(backend) else {
        return;
    };

    let observed_names: BTreeSet<&str> = observed.iter().map(|t| t.name.as_str()).collect();

    for (tool_name, entry) in config.tools.iter_mut() {
        if !observed_names.contains(tool_name.as_str()) {
            entry.stale = true;
        }
    }

    for tool in observed {
        let description = tool.description.clone().unwrap_or_default();
        match config.tools.get_mut(&tool.name) {
            Some(entry) => {
                entry.stale = false;
                entry.description = description;
            }
            None => {
                config.tools.insert(
                    tool.name.clone(),
                    ToolEntry {
                        enabled: true,
                        stale: false,
                        description,
                    },
                );
            }
        }
    }
}

/// Remove tools that are both stale and disabled. Runs only on explicit
/// administrative action, never as part of a discovery sweep.
/// Returns the number of entries removed.
pub fn prune_stale_disabled(document: &mut Document, backend: &str) -> usize {
    let Some(config) = document.servers.get_mut(backend) else {
        return 0;
    };
    let before = config.tools.len();
    config.tools.retain(|_, entry| !(entry.stale && !entry.enabled));
    before - config.tools.len()
}

/// Tool names a backend should currently expose: enabled and not stale.
pub fn enabled_tools(document: &Document, backend: &str) -> BTreeSet<String> {
    let Some(config) = document.servers.get(backend) else {
        return BTreeSet::new();
    };
    config
        .tools
        .iter()
        .filter(|(_, entry)| entry.enabled && !entry.stale)
        .map(|(name, _)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::BackendConfig;

    fn observed(name: &str, description: &str) -> ObservedTool {
        ObservedTool {
            name: name.to_string(),
            description: Some(description.to_string()),
        }
    }

    fn doc_with_backend(backend: &str) -> Document {
        let mut doc = Document::default();
        doc.servers.insert(
            backend.into(),
            BackendConfig {
                command: Some("npx".into()),
                ..Default::default()
            },
        );
        doc
    }

    #[test]
    fn test_new_tool_inserted_enabled_and_fresh() {
        let mut doc = doc_with_backend("alpha");
        merge_discovered(&mut doc, "alpha", &[observed("x", "does x")]);

        let entry = doc.servers.get("alpha").unwrap().tools.get("x").unwrap();
        assert!(entry.enabled);
        assert!(!entry.stale);
        assert_eq!(entry.description, "does x");
    }

    #[test]
    fn test_disabled_stays_disabled_across_rediscovery() {
        let mut doc = doc_with_backend("alpha");
        merge_discovered(&mut doc, "alpha", &[observed("x", "v1")]);
        doc.servers
            .get_mut("alpha")
            .unwrap()
            .tools
            .get_mut("x")
            .unwrap()
            .enabled = false;

        merge_discovered(&mut doc, "alpha", &[observed("x", "v2")]);

        let entry = doc.servers.get("alpha").unwrap().tools.get("x").unwrap();
        assert!(!entry.enabled, "rediscovery must not overwrite user policy");
        assert_eq!(entry.description, "v2");
        assert!(!entry.stale);
    }

    #[test]
    fn test_stale_round_trip() {
        let mut doc = doc_with_backend("alpha");
        merge_discovered(&mut doc, "alpha", &[observed("x", "does x")]);

        // Tool disappears.
        merge_discovered(&mut doc, "alpha", &[]);
        let entry = doc.servers.get("alpha").unwrap().tools.get("x").unwrap();
        assert!(entry.stale);
        assert!(entry.enabled);

        // Tool reappears.
        merge_discovered(&mut doc, "alpha", &[observed("x", "does x again")]);
        let entry = doc.servers.get("alpha").unwrap().tools.get("x").unwrap();
        assert!(!entry.stale);
        assert!(entry.enabled);
        assert_eq!(entry.description, "does x again");
    }

    #[test]
    fn test_prune_removes_only_stale_and_disabled() {
        let mut doc = doc_with_backend("alpha");
        merge_discovered(
            &mut doc,
            "alpha",
            &[observed("keep", ""), observed("gone_enabled", ""), observed("gone_disabled", "")],
        );
        doc.servers
            .get_mut("alpha")
            .unwrap()
            .tools
            .get_mut("gone_disabled")
            .unwrap()
            .enabled = false;

        // Both "gone" tools vanish from the backend.
        merge_discovered(&mut doc, "alpha", &[observed("keep", "")]);

        let removed = prune_stale_disabled(&mut doc, "alpha");
        assert_eq!(removed, 1);

        let tools = &doc.servers.get("alpha").unwrap().tools;
        assert!(tools.contains_key("keep"));
        assert!(tools.contains_key("gone_enabled"), "stale but enabled survives");
        assert!(!tools.contains_key("gone_disabled"));
    }

    #[test]
    fn test_enabled_tools_excludes_stale_and_disabled() {
        let mut doc = doc_with_backend("alpha");
        merge_discovered(
            &mut doc,
            "alpha",
            &[observed("a", ""), observed("b", ""), observed("c", "")],
        );
        doc.servers
            .get_mut("alpha")
            .unwrap()
            .tools
            .get_mut("b")
            .unwrap()
            .enabled = false;
        merge_discovered(&mut doc, "alpha", &[observed("a", ""), observed("b", "")]);
        // c is now stale, b is disabled.
        let exposed = enabled_tools(&doc, "alpha");
        assert_eq!(exposed.into_iter().collect::<Vec<_>>(), ["a"]);
    }

    #[test]
    fn test_merge_for_unknown_backend_is_noop() {
        let mut doc = Document::default();
        merge_discovered(&mut doc, "ghost", &[observed("x", "")]);
        assert!(doc.servers.is_empty());
        assert_eq!(prune_stale_disabled(&mut doc, "ghost"), 0);
        assert!(enabled_tools(&doc, "ghost").is_empty());
    }

    #[test]
    fn test_missing_description_becomes_empty() {
        let mut doc = doc_with_backend("alpha");
        merge_discovered(
            &mut doc,
            "alpha",
            &[ObservedTool {
                name: "x".into(),
                description: None,
            }],
        );
        let entry = doc.servers.get("alpha").unwrap().tools.get("x").unwrap();
        assert_eq!(entry.description, "");
    }
}
