//! Process-lifetime cache of artifact metadata and bounded previews.
//!
//! Entries are keyed by path and validated against a size + mtime
//! fingerprint on every lookup. Each path has its own lock slot, so
//! concurrent callers asking for the same stale path build it once while
//! lookups of other paths proceed.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use calamine::Reader;
use jiff::Timestamp;
use tracing::{debug, warn};

use crate::error::OpsError;
use crate::helpers::truncate_chars;
use crate::models::{
    ArtifactEntry, ArtifactKind, ChildEntry, Fingerprint, Preview, SheetPreview,
};

const SPREADSHEET_EXTENSIONS: [&str; 4] = ["xlsx", "xlsm", "xls", "ods"];

/// Caps that keep preview cost independent of artifact size.
#[derive(Debug, Clone, Copy)]
pub struct PreviewLimits {
    pub rows: usize,
    pub columns: usize,
    pub cell_chars: usize,
    pub csv_bytes: u64,
    pub spreadsheet_bytes: u64,
    pub sheets: usize,
    pub children: usize,
}

impl Default for PreviewLimits {
    fn default() -> Self {
        Self {
            rows: 3,
            columns: 6,
            cell_chars: 80,
            csv_bytes: 64 * 1024,
            spreadsheet_bytes: 16 * 1024 * 1024,
            sheets: 4,
            children: 20,
        }
    }
}

type Slot = Mutex<Option<Arc<ArtifactEntry>>>;

#[derive(Debug, Default)]
pub struct ArtifactCache {
    slots: Mutex<HashMap<PathBuf, Arc<Slot>>>,
    builds: AtomicUsize,
    limits: PreviewLimits,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: PreviewLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Memoized entry for `path`, rebuilt when the fingerprint on disk moved.
    pub fn get(&self, path: &Path) -> Arc<ArtifactEntry> {
        let current = fingerprint_of(path);
        let slot = self.slot(path);
        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = cached.as_ref() {
            if entry.fingerprint == current {
                return Arc::clone(entry);
            }
            debug!(path = %path.display(), "artifact changed on disk, rebuilding");
        }

        let entry = Arc::new(self.build(path));
        *cached = Some(Arc::clone(&entry));
        entry
    }

    pub fn get_all<'a, I>(&self, paths: I) -> Vec<Arc<ArtifactEntry>>
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        paths.into_iter().map(|path| self.get(path)).collect()
    }

    /// Number of times an entry was computed from disk.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn slot(&self, path: &Path) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(path.to_path_buf()).or_default())
    }

    fn build(&self, path: &Path) -> ArtifactEntry {
        self.builds.fetch_add(1, Ordering::SeqCst);

        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return ArtifactEntry::missing(path.to_path_buf());
            }
            Err(err) => {
                let mut entry = ArtifactEntry::missing(path.to_path_buf());
                entry.error = Some(read_failure(path, &err).to_string());
                return entry;
            }
        };

        let mut entry = ArtifactEntry {
            path: path.to_path_buf(),
            kind: ArtifactKind::Other,
            size: meta.len(),
            modified: meta.modified().ok().and_then(|t| Timestamp::try_from(t).ok()),
            fingerprint: Fingerprint::from_metadata(&meta),
            preview: Preview::Empty,
            error: None,
        };

        let outcome = if meta.is_dir() {
            entry.kind = ArtifactKind::Directory;
            self.list_directory(path).map(|(size, preview)| {
                entry.size = size;
                preview
            })
        } else {
            match extension_of(path).as_deref() {
                Some("csv") => {
                    entry.kind = ArtifactKind::Csv;
                    self.preview_csv(path, meta.len())
                }
                Some(ext) if SPREADSHEET_EXTENSIONS.contains(&ext) => {
                    entry.kind = ArtifactKind::Spreadsheet;
                    self.preview_workbook(path, meta.len())
                }
                _ => Ok(Preview::Empty),
            }
        };

        match outcome {
            Ok(preview) => entry.preview = preview,
            Err(err) => {
                warn!("{err}");
                entry.error = Some(err.to_string());
            }
        }
        entry
    }

    fn list_directory(&self, path: &Path) -> Result<(u64, Preview), OpsError> {
        let mut children = Vec::new();
        let mut total = 0;

        for child in fs::read_dir(path).map_err(|e| read_failure(path, &e))? {
            let child = child.map_err(|e| read_failure(path, &e))?;
            let meta = child.metadata().map_err(|e| read_failure(&child.path(), &e))?;
            let size = if meta.is_dir() { 0 } else { meta.len() };
            total += size;
            children.push(ChildEntry {
                name: child.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size,
            });
        }

        children.sort_by(|a, b| a.name.cmp(&b.name));
        let total_children = children.len();
        children.truncate(self.limits.children);

        Ok((
            total,
            Preview::Listing {
                total_children,
                children,
            },
        ))
    }

    fn preview_csv(&self, path: &Path, len: u64) -> Result<Preview, OpsError> {
        let file = File::open(path).map_err(|e| read_failure(path, &e))?;
        let mut reader = BufReader::new(file.take(self.limits.csv_bytes));
        let mut record = Vec::new();
        let mut columns = Vec::new();
        let mut head = Vec::new();
        let mut rows_scanned = 0;
        let mut first = true;

        loop {
            record.clear();
            // A quoted field may span lines; read until its quotes balance.
            let exhausted = loop {
                let read = reader
                    .read_until(b'\n', &mut record)
                    .map_err(|e| read_failure(path, &e))?;
                if read == 0 || quotes_balanced(&record) {
                    break read == 0;
                }
            };
            if record.is_empty() {
                break;
            }
            // A record cut by the byte bound, or left open at the end, is not complete.
            if exhausted || (!record.ends_with(b"\n") && len > self.limits.csv_bytes) {
                break;
            }

            let text = String::from_utf8_lossy(&record);
            let fields = split_csv_record(text.trim_end_matches(['\r', '\n']));
            if first {
                columns = fields;
                first = false;
                continue;
            }

            rows_scanned += 1;
            if head.len() < self.limits.rows {
                head.push(self.clip_row(fields.into_iter()));
            }
        }

        Ok(Preview::Table {
            columns,
            head,
            rows_scanned,
            truncated: len > self.limits.csv_bytes,
        })
    }

    fn preview_workbook(&self, path: &Path, len: u64) -> Result<Preview, OpsError> {
        if len > self.limits.spreadsheet_bytes {
            return Err(OpsError::CacheReadFailure {
                path: path.to_path_buf(),
                reason: format!(
                    "workbook larger than {} bytes, preview skipped",
                    self.limits.spreadsheet_bytes
                ),
            });
        }

        let mut workbook = calamine::open_workbook_auto(path).map_err(|e| OpsError::CacheReadFailure {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let names = workbook.sheet_names();
        let mut sheets = Vec::new();
        for name in names.iter().take(self.limits.sheets) {
            let range = match workbook.worksheet_range(name) {
                Ok(range) => range,
                Err(err) => {
                    warn!(sheet = %name, "failed to read sheet in {}: {err}", path.display());
                    continue;
                }
            };
            let (rows, columns) = range.get_size();
            let head = range
                .rows()
                .take(self.limits.rows)
                .map(|row| self.clip_row(row.iter().map(ToString::to_string)))
                .collect();
            sheets.push(SheetPreview {
                name: name.clone(),
                rows,
                columns,
                head,
            });
        }

        Ok(Preview::Workbook {
            sheet_count: names.len(),
            sheets,
        })
    }

    fn clip_row(&self, cells: impl Iterator<Item = String>) -> Vec<String> {
        cells
            .take(self.limits.columns)
            .map(|cell| truncate_chars(&cell, self.limits.cell_chars).to_owned())
            .collect()
    }
}

fn fingerprint_of(path: &Path) -> Fingerprint {
    fs::metadata(path).map_or(Fingerprint::Missing, |meta| Fingerprint::from_metadata(&meta))
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn read_failure(path: &Path, err: &std::io::Error) -> OpsError {
    OpsError::CacheReadFailure {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Split one CSV record, honoring double-quoted fields and `""` escapes.
fn quotes_balanced(record: &[u8]) -> bool {
    record.iter().filter(|&&b| b == b'"').count() % 2 == 0
}

fn split_csv_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => quoted = false,
            ('"', false) if field.is_empty() => quoted = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{FileTime, set_file_mtime};
    use rstest::{fixture, rstest};
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    #[fixture]
    fn dir() -> TempDir {
        TempDir::new().unwrap()
    }

    fn write_csv(path: &Path, rows: usize) {
        let mut content = String::from("Timestamp,RuleTitle,Level\n");
        for i in 0..rows {
            content.push_str(&format!("2024-01-0{}T00:00:00Z,Rule {i},high\n", i % 9 + 1));
        }
        fs::write(path, content).unwrap();
    }

    // Two lookups without a change on disk hand back the very same entry and
    // touch the read path once.
    #[rstest]
    fn repeated_get_is_memoized(dir: TempDir) {
        let path = dir.path().join("CASE_hayabusa_output.csv");
        write_csv(&path, 5);
        let cache = ArtifactCache::new();

        let first = cache.get(&path);
        let second = cache.get(&path);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.builds(), 1);
    }

    // Moving the mtime invalidates the entry, and the new preview reflects
    // the new content.
    #[rstest]
    fn changed_mtime_rebuilds(dir: TempDir) {
        let path = dir.path().join("report.csv");
        write_csv(&path, 1);
        set_file_mtime(&path, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
        let cache = ArtifactCache::new();

        let first = cache.get(&path);
        fs::write(&path, "Timestamp,RuleTitle,Level\nnew,Fresh Rule,low\n").unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
        let second = cache.get(&path);

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.builds(), 2);
        let Preview::Table { head, .. } = &second.preview else {
            panic!("expected table preview, got {:?}", second.preview);
        };
        assert_eq!(head[0][1], "Fresh Rule");
    }

    // Concurrent readers of one path share a single build.
    #[rstest]
    fn concurrent_get_builds_once(dir: TempDir) {
        let path = dir.path().join("big.csv");
        write_csv(&path, 200);
        let cache = ArtifactCache::new();
        let barrier = Barrier::new(8);

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    barrier.wait();
                    cache.get(&path)
                });
            }
        });

        assert_eq!(cache.builds(), 1);
    }

    // CSV previews keep the header plus a bounded number of rows and columns.
    #[rstest]
    fn csv_preview_is_bounded(dir: TempDir) {
        let path = dir.path().join("wide.csv");
        let header = (0..10).map(|i| format!("c{i}")).collect::<Vec<_>>().join(",");
        let row = (0..10).map(|_| "x".repeat(200)).collect::<Vec<_>>().join(",");
        let mut content = format!("{header}\n");
        for _ in 0..10 {
            content.push_str(&row);
            content.push('\n');
        }
        fs::write(&path, content).unwrap();

        let entry = ArtifactCache::new().get(&path);
        let Preview::Table { columns, head, rows_scanned, truncated } = &entry.preview else {
            panic!("expected table preview");
        };
        assert_eq!(columns.len(), 10);
        assert_eq!(head.len(), 3);
        assert_eq!(head[0].len(), 6);
        assert_eq!(head[0][0].chars().count(), 80);
        assert_eq!(*rows_scanned, 10);
        assert!(!truncated);
    }

    // Files bigger than the byte bound are only read up to the bound.
    #[rstest]
    fn csv_preview_stops_at_byte_bound(dir: TempDir) {
        let path = dir.path().join("huge.csv");
        write_csv(&path, 5_000);
        let limits = PreviewLimits {
            csv_bytes: 1024,
            ..PreviewLimits::default()
        };

        let entry = ArtifactCache::with_limits(limits).get(&path);
        let Preview::Table { rows_scanned, truncated, .. } = &entry.preview else {
            panic!("expected table preview");
        };
        assert!(*truncated);
        assert!(*rows_scanned < 100);
    }

    // A quoted field holding line breaks stays one record.
    #[rstest]
    fn csv_preview_keeps_multiline_fields_whole(dir: TempDir) {
        let path = dir.path().join("events.csv");
        fs::write(
            &path,
            "Message,Count\n\"multi\nline\",2\n\"one \"\"quoted\"\"\nand\r\nmore\",3\nplain,4\n",
        )
        .unwrap();

        let entry = ArtifactCache::new().get(&path);
        let Preview::Table { columns, head, rows_scanned, .. } = &entry.preview else {
            panic!("expected table preview");
        };
        assert_eq!(columns, &vec!["Message".to_owned(), "Count".to_owned()]);
        assert_eq!(*rows_scanned, 3);
        assert_eq!(head[0], vec!["multi\nline".to_owned(), "2".to_owned()]);
        assert_eq!(head[1][0], "one \"quoted\"\nand\r\nmore");
        assert_eq!(head[2][1], "4");
    }

    // An unterminated quote at the end of the file is not counted as a row.
    #[rstest]
    fn csv_preview_drops_unterminated_record(dir: TempDir) {
        let path = dir.path().join("broken.csv");
        fs::write(&path, "a,b\n1,2\n\"open,3\nstill open\n").unwrap();

        let entry = ArtifactCache::new().get(&path);
        let Preview::Table { rows_scanned, .. } = &entry.preview else {
            panic!("expected table preview");
        };
        assert_eq!(*rows_scanned, 1);
    }

    // Directories list immediate children only, with per-child sizes.
    #[rstest]
    fn directory_listing_is_shallow(dir: TempDir) {
        let out = dir.path().join("CASE_chainsaw_output");
        fs::create_dir_all(out.join("nested")).unwrap();
        fs::write(out.join("sigma.csv"), "a,b\n1,2\n").unwrap();
        fs::write(out.join("nested").join("deep.csv"), "ignored").unwrap();

        let entry = ArtifactCache::new().get(&out);
        assert_eq!(entry.kind, ArtifactKind::Directory);
        let Preview::Listing { total_children, children } = &entry.preview else {
            panic!("expected listing");
        };
        assert_eq!(*total_children, 2);
        assert_eq!(children[0].name, "nested");
        assert!(children[0].is_dir);
        assert_eq!(children[1].size, 8);
        assert_eq!(entry.total_size(), 8);
    }

    // Missing paths are cached as missing; unreadable workbooks keep an empty
    // preview and an error note instead of failing the lookup.
    #[rstest]
    fn missing_and_corrupt_artifacts_degrade(dir: TempDir) {
        let cache = ArtifactCache::new();
        let missing = cache.get(&dir.path().join("absent.csv"));
        assert!(!missing.exists());
        assert!(missing.preview.is_empty());

        let corrupt = dir.path().join("report.xlsx");
        fs::write(&corrupt, b"not a zip archive").unwrap();
        let entry = cache.get(&corrupt);
        assert_eq!(entry.kind, ArtifactKind::Spreadsheet);
        assert!(entry.preview.is_empty());
        assert!(entry.error.is_some());
    }

    #[rstest]
    #[case::plain("a,b,c", vec!["a", "b", "c"])]
    #[case::quoted("\"a,b\",c", vec!["a,b", "c"])]
    #[case::escaped("\"say \"\"hi\"\"\",x", vec!["say \"hi\"", "x"])]
    #[case::empty_fields(",,", vec!["", "", ""])]
    fn split_csv_record_handles_quotes(#[case] line: &str, #[case] expected: Vec<&str>) {
        assert_eq!(split_csv_record(line), expected);
    }
}
