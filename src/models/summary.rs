use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::helpers::atomic_write;

/// Coarse certainty extracted from a generated summary.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    AsRefStr,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Confidence {
    Unknown,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    pub confidence: Confidence,
    pub generated_at: Timestamp,
    pub prompt_hash: String,
    pub model: String,
}

/// Sidecar contents: everything about a summary except its text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryMeta {
    pub confidence: Confidence,
    pub generated_at: Timestamp,
    pub prompt_hash: String,
    pub model: String,
}

impl Summary {
    /// Sidecar holding everything but the text.
    pub fn meta_path(text_path: &Path) -> PathBuf {
        text_path.with_extension("toml")
    }

    /// Write the text and its metadata sidecar next to each other.
    pub fn write_files(&self, text_path: &Path) -> Result<()> {
        atomic_write(text_path, self.text.as_bytes())?;

        let meta = SummaryMeta {
            confidence: self.confidence,
            generated_at: self.generated_at,
            prompt_hash: self.prompt_hash.clone(),
            model: self.model.clone(),
        };
        let content = toml::to_string(&meta).context("Failed to serialize summary metadata")?;
        atomic_write(&Self::meta_path(text_path), content.as_bytes())
    }

    /// Sidecar of the summary at `text_path`, if one was written.
    pub fn read_meta(text_path: &Path) -> Result<Option<SummaryMeta>> {
        let path = Self::meta_path(text_path);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content)
            .map(Some)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tempfile::TempDir;

    #[test]
    fn confidence_orders_by_severity() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
        assert!(Confidence::Low > Confidence::Unknown);
        assert_eq!(Confidence::from_str("HIGH").unwrap(), Confidence::High);
    }

    // The text file holds only the summary; metadata goes to the sidecar.
    #[test]
    fn write_files_splits_text_and_meta() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("CASE_llm_summary.txt");
        let summary = Summary {
            text: "| Tool | Confidence |\n| x | High |".into(),
            confidence: Confidence::High,
            generated_at: Timestamp::from_second(1_700_000_000).unwrap(),
            prompt_hash: "abc123".into(),
            model: "local-model".into(),
        };
        summary.write_files(&path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), summary.text);
        let meta = std::fs::read_to_string(dir.path().join("CASE_llm_summary.toml")).unwrap();
        assert!(meta.contains("confidence = \"high\""));
        assert!(meta.contains("prompt_hash = \"abc123\""));

        let read = Summary::read_meta(&path).unwrap().unwrap();
        assert_eq!(read.confidence, Confidence::High);
        assert_eq!(read.model, "local-model");
        assert!(Summary::read_meta(&dir.path().join("other.txt")).unwrap().is_none());
    }
}
