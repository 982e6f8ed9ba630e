use std::fs::Metadata;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use jiff::Timestamp;
use serde::Serialize;
use strum::AsRefStr;

/// Cheap file identity: size plus modification time. Not a content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Fingerprint {
    Missing,
    Present { len: u64, modified_ns: i128, is_dir: bool },
}

impl Fingerprint {
    pub fn from_metadata(meta: &Metadata) -> Self {
        let modified_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| i128::try_from(d.as_nanos()).unwrap_or(i128::MAX));
        Self::Present {
            len: meta.len(),
            modified_ns,
            is_dir: meta.is_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactKind {
    Missing,
    Csv,
    Spreadsheet,
    Directory,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetPreview {
    pub name: String,
    pub rows: usize,
    pub columns: usize,
    pub head: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Bounded view of an artifact's content.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Preview {
    Empty,
    Table {
        columns: Vec<String>,
        head: Vec<Vec<String>>,
        /// Data rows seen inside the read bound.
        rows_scanned: usize,
        /// True when the read bound was hit before end of file.
        truncated: bool,
    },
    Workbook {
        sheet_count: usize,
        sheets: Vec<SheetPreview>,
    },
    Listing {
        total_children: usize,
        children: Vec<ChildEntry>,
    },
}

impl Preview {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Cached description of one output file or directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactEntry {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<Timestamp>,
    #[serde(skip)]
    pub fingerprint: Fingerprint,
    pub preview: Preview,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArtifactEntry {
    pub fn missing(path: PathBuf) -> Self {
        Self {
            path,
            kind: ArtifactKind::Missing,
            size: 0,
            modified: None,
            fingerprint: Fingerprint::Missing,
            preview: Preview::Empty,
            error: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.kind != ArtifactKind::Missing
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| self.path.display().to_string(), |n| n.to_string_lossy().into_owned())
    }

    /// Bytes on disk: file size, or the sum of listed children for directories.
    pub fn total_size(&self) -> u64 {
        match &self.preview {
            Preview::Listing { children, .. } => children.iter().map(|c| c.size).sum(),
            _ => self.size,
        }
    }
}
