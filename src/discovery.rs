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

//! Discovery sweep: connect briefly, enumerate, disconnect unless pinned.
//!
//! Runs over the document's backends in insertion order. Each backend failure
//! is recorded as an empty observation and the sweep continues; discovery
//! never aborts the boot. The caller persists the updated document.

use std::collections::HashMap;
use tracing::{info, warn};

use crate::document::{qualify_name, Document};
use crate::manager::BackendManager;
use crate::mcp::protocol::{ServerCapabilities, Tool};
use crate::merge::{merge_discovered, ObservedTool};

/// What a sweep learned, beyond the document updates it applied.
#[derive(Default)]
pub struct SweepOutcome {
    /// Capability snapshot per backend that answered initialize.
    pub capabilities: HashMap<String, ServerCapabilities>,
    /// Live tool metadata keyed by qualified name (real input schemas).
    pub tool_schemas: HashMap<String, Tool>,
    /// Qualified prompt name to owning backend.
    pub prompt_index: HashMap<String, String>,
    /// Raw resource URI to owning backend.
    pub resource_index: HashMap<String, String>,
    /// Backends whose discovery failed.
    pub failures: Vec<String>,
}

/// Enumerate every backend declared in the document, merging observations
/// into it through the merge engine.
pub async fn run_sweep(manager: &BackendManager, document: &mut Document) -> SweepOutcome {
    let mut outcome = SweepOutcome::default();
    let names: Vec<String> = document.servers.names().cloned().collect();

    for name in names {
        let config = match document.servers.get(&name) {
            Some(config) => config.clone(),
            None => continue,
        };
        if let Err(e) = manager.register(&name, config) {
            warn!(backend = %name, error = %e, "skipping invalid backend");
            outcome.failures.push(name);
            continue;
        }

        let session = match manager.get_or_open(&name).await {
            Ok(session) => session,
            Err(e) => {
                warn!(backend = %name, error = %e, "discovery failed");
                // Empty observation: everything this backend had goes stale.
                merge_discovered(document, &name, &[]);
                outcome.failures.push(name);
                continue;
            }
        };

        let capabilities = session.capabilities();

        let mut observed = Vec::new();
        if capabilities.has_tools() {
            match session.list_tools().await {
                Ok(tools) => {
                    for tool in tools {
                        observed.push(ObservedTool {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                        });
                        outcome
                            .tool_schemas
                            .insert(qualify_name(&name, &tool.name), tool);
                    }
                }
                Err(e) => {
                    warn!(backend = %name, error = %e, "advertises tools but tools/list failed");
                }
            }
        }
        merge_discovered(document, &name, &observed);

        if capabilities.has_prompts() {
            match session.list_prompts().await {
                Ok(prompts) => {
                    for prompt in prompts {
                        outcome
                            .prompt_index
                            .insert(qualify_name(&name, &prompt.name), name.clone());
                    }
                }
                Err(e) => {
                    warn!(backend = %name, error = %e, "advertises prompts but prompts/list failed");
                }
            }
        }

        if capabilities.has_resources() {
            match session.list_resources().await {
                Ok(resources) => {
                    for resource in resources {
                        outcome.resource_index.insert(resource.uri, name.clone());
                    }
                }
                Err(e) => {
                    warn!(backend = %name, error = %e, "advertises resources but resources/list failed");
                }
            }
        }

        info!(
            backend = %name,
            tools = observed.len(),
            pinned = manager.is_pinned(&name),
            "discovered backend"
        );
        outcome.capabilities.insert(name.clone(), capabilities);

        if !manager.is_pinned(&name) {
            manager.close(&name).await;
        }
    }

    outcome
}
