//! Budgeted prompt assembly.
//!
//! Sections are kept in insertion order. When the total exceeds the budget,
//! preview sections are dropped from the end first, then metadata sections;
//! required sections are never dropped, only hard-truncated as a last resort.

use serde_json::json;

use crate::cache::ArtifactCache;
use crate::helpers::truncate_chars;

use super::ToolDigest;

const SEPARATOR: &str = "\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Preview,
    Metadata,
    Required,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub priority: Priority,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub text: String,
    pub dropped: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    sections: Vec<Section>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, priority: Priority, text: impl Into<String>) -> &mut Self {
        self.sections.push(Section {
            priority,
            text: text.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Join sections within `budget` characters. Never fails.
    pub fn assemble(&self, budget: usize) -> Assembled {
        let mut kept: Vec<&Section> = self.sections.iter().collect();
        let mut dropped = 0;

        while joined_len(&kept) > budget {
            let victim = [Priority::Preview, Priority::Metadata]
                .into_iter()
                .find_map(|priority| kept.iter().rposition(|s| s.priority == priority));
            let Some(idx) = victim else {
                break;
            };
            kept.remove(idx);
            dropped += 1;
        }

        let text = kept
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(SEPARATOR);
        let cut = truncate_chars(&text, budget);
        let truncated = cut.len() < text.len();

        Assembled {
            text: cut.to_owned(),
            dropped,
            truncated,
        }
    }
}

fn joined_len(sections: &[&Section]) -> usize {
    let text: usize = sections.iter().map(|s| s.text.chars().count()).sum();
    text + sections.len().saturating_sub(1) * SEPARATOR.len()
}

/// One JSON line per tool (required), per artifact (metadata) and per
/// non-empty preview (preview).
pub fn digest_sections(digests: &[ToolDigest], cache: &ArtifactCache) -> PromptBuilder {
    let mut builder = PromptBuilder::new();
    let entries: Vec<_> = digests
        .iter()
        .map(|digest| (digest, cache.get_all(&digest.artifacts)))
        .collect();

    for digest in digests {
        let line = json!({
            "tool": digest.tool,
            "status": digest.status.map(|s| s.as_ref().to_owned()),
            "log": digest.log_path.as_ref().map(|p| p.display().to_string()),
            "artifacts": digest.artifacts.len(),
        });
        builder.push(Priority::Required, line.to_string());
    }

    for (digest, artifacts) in &entries {
        for entry in artifacts {
            let line = json!({
                "tool": digest.tool,
                "artifact": entry.file_name(),
                "kind": entry.kind.as_ref(),
                "exists": entry.exists(),
                "size": entry.total_size(),
                "modified": entry.modified.map(|t| t.to_string()),
                "error": entry.error,
            });
            builder.push(Priority::Metadata, line.to_string());
        }
    }

    for (digest, artifacts) in &entries {
        for entry in artifacts.iter().filter(|e| !e.preview.is_empty()) {
            let line = json!({
                "tool": digest.tool,
                "artifact": entry.file_name(),
                "preview": entry.preview,
            });
            builder.push(Priority::Preview, line.to_string());
        }
    }

    builder
}
