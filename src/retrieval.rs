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

//! Pluggable tool retrieval.
//!
//! `tools/list` hands the ordered candidate list through a single extension
//! point that may reorder or filter it. The default is a passthrough; a
//! keyword scorer is available for sessions that opt in through the control
//! document's `retrieval` section.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::mcp::protocol::Tool;

fn default_strategy() -> String {
    "keyword".to_string()
}

fn default_min_score() -> f64 {
    0.05
}

/// Retrieval section of the control document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Tools scoring below this are dropped from the listing.
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    /// Cap on returned tools. Zero means no cap.
    #[serde(default)]
    pub max_tools: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: default_strategy(),
            min_score: default_min_score(),
            max_tools: 0,
        }
    }
}

/// What the retriever knows about the downstream session.
#[derive(Debug, Clone, Default)]
pub struct RetrievalContext {
    /// Client identity captured at initialize time plus recent request text.
    pub fingerprint: String,
}

/// A candidate tool with its relevance score.
#[derive(Debug, Clone)]
pub struct ScoredTool {
    pub tool: Tool,
    pub score: f64,
}

/// Strategy interface. Implementations are read-only consumers of the
/// candidate list.
#[async_trait]
pub trait ToolRetriever: Send + Sync {
    async fn retrieve(&self, context: &RetrievalContext, candidates: Vec<Tool>) -> Vec<ScoredTool>;
}

/// Returns all candidates with score 1.0, order untouched. Used when no
/// retriever is configured.
pub struct PassthroughRetriever;

#[async_trait]
impl ToolRetriever for PassthroughRetriever {
    async fn retrieve(&self, _context: &RetrievalContext, candidates: Vec<Tool>) -> Vec<ScoredTool> {
        candidates
            .into_iter()
            .map(|tool| ScoredTool { tool, score: 1.0 })
            .collect()
    }
}

/// Scores tools by token overlap between the session fingerprint and the
/// tool's name and description.
pub struct KeywordRetriever {
    min_score: f64,
    max_tools: usize,
}

impl KeywordRetriever {
    pub fn new(min_score: f64, max_tools: usize) -> Self {
        Self {
            min_score,
            max_tools,
        }
    }

    fn tokenize(text: &str) -> BTreeSet<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| token.len() >= 3)
            .map(|token| token.to_string())
            .collect()
    }

    fn score(context_tokens: &BTreeSet<String>, tool: &Tool) -> f64 {
        if context_tokens.is_empty() {
            // No signal: everything stays visible.
            return 1.0;
        }
        let haystack = format!(
            "{} {}",
            tool.name,
            tool.description.as_deref().unwrap_or_default()
        );
        let tool_tokens = Self::tokenize(&haystack);
        let overlap = context_tokens.intersection(&tool_tokens).count();
        overlap as f64 / context_tokens.len() as f64
    }
}

#[async_trait]
impl ToolRetriever for KeywordRetriever {
    async fn retrieve(&self, context: &RetrievalContext, candidates: Vec<Tool>) -> Vec<ScoredTool> {
        let context_tokens = Self::tokenize(&context.fingerprint);

        let mut scored: Vec<ScoredTool> = candidates
            .into_iter()
            .map(|tool| {
                let score = Self::score(&context_tokens, &tool);
                ScoredTool { tool, score }
            })
            .filter(|scored| scored.score >= self.min_score)
            .collect();

        // Stable sort keeps candidate order for equal scores.
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        if self.max_tools > 0 {
            scored.truncate(self.max_tools);
        }
        scored
    }
}

/// Resolve the retriever for a document's retrieval section. Anything other
/// than an enabled, recognized strategy is a passthrough.
pub fn build_retriever(settings: Option<&RetrievalSettings>) -> Arc<dyn ToolRetriever> {
    match settings {
        Some(settings) if settings.enabled && settings.strategy == "keyword" => {
            Arc::new(KeywordRetriever::new(settings.min_score, settings.max_tools))
        }
        _ => Arc::new(PassthroughRetriever),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::empty_object_schema;

    fn tool(name: &str, description: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema: empty_object_schema(),
        }
    }

    #[tokio::test]
    async fn test_passthrough_preserves_order_and_scores_one() {
        let candidates = vec![tool("b::z", ""), tool("a::a", "")];
        let result = PassthroughRetriever
            .retrieve(&RetrievalContext::default(), candidates)
            .await;
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].tool.name, "b::z");
        assert!(result.iter().all(|s| s.score == 1.0));
    }

    #[tokio::test]
    async fn test_keyword_ranks_matching_tools_first() {
        let retriever = KeywordRetriever::new(0.0, 0);
        let context = RetrievalContext {
            fingerprint: "search the filesystem".to_string(),
        };
        let candidates = vec![
            tool("db::query", "run sql statements"),
            tool("fs::find", "search files on the filesystem"),
        ];
        let result = retriever.retrieve(&context, candidates).await;
        assert_eq!(result[0].tool.name, "fs::find");
        assert!(result[0].score > result[1].score);
    }

    #[tokio::test]
    async fn test_keyword_min_score_filters() {
        let retriever = KeywordRetriever::new(0.5, 0);
        let context = RetrievalContext {
            fingerprint: "filesystem search".to_string(),
        };
        let candidates = vec![
            tool("fs::find", "search the filesystem"),
            tool("weather::now", "current temperature"),
        ];
        let result = retriever.retrieve(&context, candidates).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].tool.name, "fs::find");
    }

    #[tokio::test]
    async fn test_keyword_empty_fingerprint_passes_everything() {
        let retriever = KeywordRetriever::new(0.5, 0);
        let candidates = vec![tool("a::a", ""), tool("b::b", "")];
        let result = retriever
            .retrieve(&RetrievalContext::default(), candidates)
            .await;
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn test_keyword_max_tools_truncates() {
        let retriever = KeywordRetriever::new(0.0, 1);
        let candidates = vec![tool("a::a", ""), tool("b::b", "")];
        let result = retriever
            .retrieve(&RetrievalContext::default(), candidates)
            .await;
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn test_build_retriever_defaults_to_passthrough() {
        // Absent section, disabled section, unknown strategy: all passthrough,
        // so an unrelated fingerprint must not filter anything.
        let context = RetrievalContext {
            fingerprint: "completely unrelated words".to_string(),
        };
        let disabled = RetrievalSettings::default();
        let unknown = RetrievalSettings {
            enabled: true,
            strategy: "embeddings".into(),
            ..Default::default()
        };
        for retriever in [
            build_retriever(None),
            build_retriever(Some(&disabled)),
            build_retriever(Some(&unknown)),
        ] {
            let result = retriever
                .retrieve(&context, vec![tool("a::a", "alpha"), tool("b::b", "beta")])
                .await;
            assert_eq!(result.len(), 2);
            assert!(result.iter().all(|s| s.score == 1.0));
        }
    }
}
