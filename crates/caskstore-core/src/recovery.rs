//! Merge recovery log and startup cleanup
//!
//! A merge swaps its results into memory first and only then moves files
//! around on disk. Before the first rename it writes `merge.manifest`,
//! naming the segment ids being retired and the ids of the compacted
//! output. If the process dies mid-way, `recover` replays the remaining
//! renames on the next open so the directory matches what the merge had
//! already made visible in memory.

use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{CaskError, CaskResult};
use crate::format::{FileSet, MANIFEST_FILENAME};
use crate::platform_durability::{durable_sync, sync_directory};

const END_MARKER: &str = "end";

/// Segment ids involved in one merge's file swap.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeManifest {
    /// Ids whose `store_*` files are superseded
    pub retired: Vec<u16>,
    /// Ids whose `merge_*` files replace them
    pub compacted: Vec<u16>,
}

impl MergeManifest {
    pub fn new(retired: Vec<u16>, compacted: Vec<u16>) -> Self {
        Self { retired, compacted }
    }

    fn encode(&self) -> String {
        format!(
            "old:{}\nnew:{}\n{}\n",
            join_ids(&self.retired),
            join_ids(&self.compacted),
            END_MARKER
        )
    }

    /// None if the text is incomplete or malformed.
    fn decode(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let retired = parse_ids(lines.next()?.strip_prefix("old:")?)?;
        let compacted = parse_ids(lines.next()?.strip_prefix("new:")?)?;
        if lines.next()? != END_MARKER {
            return None;
        }
        Some(Self { retired, compacted })
    }

    /// Write and durably sync the manifest into `dir`.
    pub fn write(&self, dir: &Path) -> CaskResult<()> {
        let path = dir.join(MANIFEST_FILENAME);
        let mut file = fs::File::create(&path)
            .map_err(|e| CaskError::io_at(&path, "failed to create merge manifest", e))?;
        file.write_all(self.encode().as_bytes())
            .map_err(|e| CaskError::io_at(&path, "failed to write merge manifest", e))?;
        durable_sync(&file)
            .map_err(|e| CaskError::io_at(&path, "failed to sync merge manifest", e))?;
        sync_directory(dir).map_err(|e| CaskError::io_at(dir, "failed to sync store directory", e))
    }

    /// Read the manifest in `dir`, if any.
    ///
    /// A manifest that never finished writing is reported as `Ok(None)`:
    /// the merge that wrote it had not touched any store file yet.
    pub fn read(dir: &Path) -> CaskResult<Option<Self>> {
        let path = dir.join(MANIFEST_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| CaskError::io_at(&path, "failed to read merge manifest", e))?;
        let manifest = Self::decode(&text);
        if manifest.is_none() {
            warn!(path = %path.display(), "ignoring incomplete merge manifest");
        }
        Ok(manifest)
    }

    pub fn remove(dir: &Path) -> CaskResult<()> {
        let path = dir.join(MANIFEST_FILENAME);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CaskError::io_at(&path, "failed to remove merge manifest", e)),
        }
    }
}

fn join_ids(ids: &[u16]) -> String {
    ids.iter().map(u16::to_string).collect::<Vec<_>>().join(",")
}

fn parse_ids(text: &str) -> Option<Vec<u16>> {
    if text.is_empty() {
        return Some(Vec::new());
    }
    text.split(',').map(|id| id.parse().ok()).collect()
}

/// What `recover` did to the directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// An interrupted merge was rolled forward
    pub rolled_forward: bool,
    /// Stray `merge_*`/`old_*` files deleted
    pub removed_files: usize,
}

pub(crate) fn move_file(from: &Path, to: &Path) -> CaskResult<()> {
    fs::rename(from, to).map_err(|e| {
        CaskError::io_at(from, &format!("failed to rename to {}", to.display()), e)
    })
}

pub(crate) fn remove_if_exists(path: &Path) -> CaskResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CaskError::io_at(path, "failed to delete file", e)),
    }
}

type PathFn = fn(FileSet, &Path, u16) -> std::path::PathBuf;

const KINDS: [PathFn; 2] = [FileSet::data_path, FileSet::hint_path];

/// Phase (a): move each retired id's `store_*` files to `old_*`.
///
/// A store file of a retired id is still old data unless a compacted file
/// has already been moved over it, which is the case exactly when the id
/// was compacted and its merge file is gone. Safe to repeat.
pub(crate) fn retire_superseded(dir: &Path, manifest: &MergeManifest) -> CaskResult<()> {
    for &id in &manifest.retired {
        let compacted = manifest.compacted.contains(&id);
        for path_of in KINDS {
            let store = path_of(FileSet::Store, dir, id);
            let pending = path_of(FileSet::Merge, dir, id);
            if store.exists() && (!compacted || pending.exists()) {
                move_file(&store, &path_of(FileSet::Old, dir, id))?;
            }
        }
    }
    Ok(())
}

/// Phase (c): delete the `old_*` files of retired ids and sync `dir`.
pub(crate) fn delete_retired(dir: &Path, manifest: &MergeManifest) -> CaskResult<()> {
    for &id in &manifest.retired {
        for path_of in KINDS {
            remove_if_exists(&path_of(FileSet::Old, dir, id))?;
        }
    }
    sync_directory(dir).map_err(|e| CaskError::io_at(dir, "failed to sync store directory", e))
}

/// Finish an interrupted merge from its manifest.
fn roll_forward(dir: &Path, manifest: &MergeManifest) -> CaskResult<()> {
    retire_superseded(dir, manifest)?;
    // Phase (b)
    for &id in &manifest.compacted {
        for path_of in KINDS {
            let pending = path_of(FileSet::Merge, dir, id);
            if pending.exists() {
                move_file(&pending, &path_of(FileSet::Store, dir, id))?;
            }
        }
    }
    delete_retired(dir, manifest)
}

/// Bring `dir` to a consistent `store_*` layout before segments are loaded.
pub fn recover(dir: &Path) -> CaskResult<RecoveryReport> {
    let mut report = RecoveryReport::default();

    if let Some(manifest) = MergeManifest::read(dir)? {
        info!(
            retired = manifest.retired.len(),
            compacted = manifest.compacted.len(),
            "rolling forward interrupted merge"
        );
        roll_forward(dir, &manifest)?;
        report.rolled_forward = true;
    }
    MergeManifest::remove(dir)?;

    let entries = fs::read_dir(dir)
        .map_err(|e| CaskError::io_at(dir, "failed to list store directory", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CaskError::io_at(dir, "failed to list store directory", e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let stray = FileSet::Merge.parse_any_name(name).is_some()
            || FileSet::Old.parse_any_name(name).is_some();
        if stray && remove_if_exists(&entry.path())? {
            debug!(file = name, "removed leftover merge file");
            report.removed_files += 1;
        }
    }
    if report.removed_files > 0 {
        sync_directory(dir)
            .map_err(|e| CaskError::io_at(dir, "failed to sync store directory", e))?;
    }
    Ok(report)
}
