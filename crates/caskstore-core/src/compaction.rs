//! Merge: dead space reclamation across archive segments
//!
//! Every archive segment is scanned in id order and only the records the
//! live index still points at are copied into fresh `merge_<id>` segments,
//! each with a hint file. The engine then rebuilds a candidate index from
//! those hints, replays whatever landed in the active segment meanwhile,
//! swaps it in, and finally `install` moves files into place:
//!
//! 1. write and sync `merge.manifest`
//! 2. rename retired `store_<id>.*` to `old_<id>.*`
//! 3. rename compacted `merge_<id>.*` to `store_<id>.*`
//! 4. delete `old_<id>.*`, sync the directory, remove the manifest
//!
//! A crash anywhere in 2-4 is finished on the next open by `recovery`; a
//! failure at runtime is retried by the next merge.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{CaskError, CaskResult};
use crate::format::FileSet;
use crate::hint::{read_hints, HintWriter};
use crate::index::Index;
use crate::recovery::{
    delete_retired, move_file, remove_if_exists, retire_superseded, MergeManifest,
};
use crate::segment::Segment;

/// Result of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Archive segments rewritten
    pub segments_merged: usize,
    /// Compacted segments produced
    pub output_segments: usize,
    /// Records carried into the output
    pub records_kept: u64,
    /// Delete markers dropped
    pub tombstones_dropped: u64,
    /// Records superseded by a later write
    pub stale_dropped: u64,
    /// Records skipped for a bad checksum
    pub corrupt_skipped: u64,
    /// Size of the merged segments
    pub bytes_before: u64,
    /// Size of the compacted segments
    pub bytes_after: u64,
}

impl MergeStats {
    /// Space saved in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }

    /// Share of scanned records that were dropped (0.0 = none, 1.0 = all).
    pub fn dead_ratio(&self) -> f64 {
        let dropped = self.tombstones_dropped + self.stale_dropped + self.corrupt_skipped;
        let scanned = dropped + self.records_kept;
        if scanned == 0 {
            return 0.0;
        }
        dropped as f64 / scanned as f64
    }
}

/// Compacted segments written by `write_compacted`, still under `merge_*` names.
pub(crate) struct MergeOutput {
    pub segments: Vec<Arc<Segment>>,
    pub stats: MergeStats,
}

/// Sequence of output segments with their hint files.
struct OutputWriter<'a> {
    dir: &'a Path,
    max_segment_size: u64,
    head_id: u16,
    last_id: u16,
    current: Option<(Segment, HintWriter)>,
    sealed: Vec<Arc<Segment>>,
}

impl<'a> OutputWriter<'a> {
    fn new(dir: &'a Path, max_segment_size: u64, head_id: u16) -> Self {
        Self {
            dir,
            max_segment_size,
            head_id,
            last_id: 0,
            current: None,
            sealed: Vec::new(),
        }
    }

    fn append(&mut self, key: &[u8], value: &[u8]) -> CaskResult<()> {
        if self.current.is_none() {
            let id = self.last_id + 1;
            let segment = Segment::create_active(&FileSet::Merge.data_path(self.dir, id), id)?;
            self.last_id = id;
            let hints = HintWriter::create(&FileSet::Merge.hint_path(self.dir, id))?;
            self.current = Some((segment, hints));
        }
        let Some((segment, hints)) = self.current.as_mut() else {
            return Err(CaskError::InvalidState("merge output missing".to_string()));
        };
        let info = segment.write(key, value, false)?;
        hints.write_hint(key, &info)?;

        // past the threshold, start another output only while its id stays
        // below the live head; otherwise keep appending to this one
        if segment.size() >= self.max_segment_size && self.last_id + 1 < self.head_id {
            self.seal()?;
        }
        Ok(())
    }

    fn seal(&mut self) -> CaskResult<()> {
        if let Some((segment, hints)) = self.current.take() {
            segment.make_archive()?;
            hints.finish()?;
            debug!(segment = segment.id(), size = segment.size(), "sealed merge output");
            self.sealed.push(Arc::new(segment));
        }
        Ok(())
    }

    fn finish(mut self) -> CaskResult<Vec<Arc<Segment>>> {
        match self.seal() {
            Ok(()) => Ok(std::mem::take(&mut self.sealed)),
            Err(e) => {
                self.discard();
                Err(e)
            }
        }
    }

    /// Close and delete everything written so far.
    fn discard(&mut self) {
        if let Some((segment, _)) = self.current.take() {
            let _ = segment.close();
        }
        for segment in self.sealed.drain(..) {
            let _ = segment.close();
        }
        for id in 1..=self.last_id {
            let data = FileSet::Merge.data_path(self.dir, id);
            for path in [data, FileSet::Merge.hint_path(self.dir, id)] {
                if let Err(e) = remove_if_exists(&path) {
                    warn!(error = %e, "failed to clean up merge output");
                }
            }
        }
    }
}

/// Copy the live records of `old` into new `merge_*` segments.
///
/// `is_current(key, segment_id, serial)` must answer against the live
/// index at the moment of the call. A read failure in an old segment
/// skips the rest of that segment; a failure writing output deletes the
/// partial output and is returned.
pub(crate) fn write_compacted<F>(
    dir: &Path,
    max_segment_size: u64,
    old: &[Arc<Segment>],
    head_id: u16,
    is_current: F,
) -> CaskResult<MergeOutput>
where
    F: Fn(&[u8], u16, u32) -> bool,
{
    let mut stats = MergeStats {
        segments_merged: old.len(),
        ..MergeStats::default()
    };
    let mut out = OutputWriter::new(dir, max_segment_size, head_id);

    for segment in old {
        stats.bytes_before += segment.size();
        let (mut kept, mut deleted, mut stale) = (0u64, 0u64, 0u64);
        let mut records = segment.records();
        for record in records.by_ref() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        segment = segment.id(),
                        error = %e,
                        "read failed, skipping rest of segment"
                    );
                    break;
                }
            };
            if record.is_tombstone() {
                deleted += 1;
                continue;
            }
            if !is_current(&record.key, segment.id(), record.serial) {
                trace!(
                    segment = segment.id(),
                    serial = record.serial,
                    "dropping superseded record"
                );
                stale += 1;
                continue;
            }
            if let Err(e) = out.append(&record.key, &record.value) {
                out.discard();
                return Err(e);
            }
            kept += 1;
        }
        debug!(
            segment = segment.id(),
            kept,
            deleted,
            stale,
            corrupt = records.corrupt_skipped(),
            "scanned segment for merge"
        );
        stats.records_kept += kept;
        stats.tombstones_dropped += deleted;
        stats.stale_dropped += stale;
        stats.corrupt_skipped += records.corrupt_skipped();
    }

    let segments = out.finish()?;
    stats.output_segments = segments.len();
    stats.bytes_after = segments.iter().map(|s| s.size()).sum();
    Ok(MergeOutput { segments, stats })
}

/// Candidate index built only from the output's hint files.
pub(crate) fn index_from_hints(outputs: &[Arc<Segment>], max_key_size: usize) -> CaskResult<Index> {
    let mut index = Index::new();
    for segment in outputs {
        for (key, info) in read_hints(&segment.hint_path(), segment.id(), max_key_size)? {
            index.insert(key, info);
        }
    }
    Ok(index)
}

/// Apply the records of `segment` from `offset` on top of `index`.
///
/// Returns the end of the last record applied, where a later call can
/// pick up.
pub(crate) fn replay(index: &mut Index, segment: &Segment, offset: u64) -> CaskResult<u64> {
    let mut keys = segment.keys_from(offset);
    for entry in keys.by_ref() {
        let (key, info) = entry?;
        index.apply(key, info);
    }
    Ok(keys.valid_end())
}

/// Delete the `merge_*` files of outputs that will not be installed.
pub(crate) fn abandon(dir: &Path, outputs: &[Arc<Segment>]) {
    for segment in outputs {
        let _ = segment.close();
        let id = segment.id();
        for path in [FileSet::Merge.data_path(dir, id), FileSet::Merge.hint_path(dir, id)] {
            if let Err(e) = remove_if_exists(&path) {
                warn!(error = %e, "failed to clean up merge output");
            }
        }
    }
}

/// Move the swapped-in merge result into place on disk.
///
/// `retired` must already be out of the live segment set. Every step
/// checks where the files are now, so after a failure the same call can
/// be repeated to finish the job.
pub(crate) fn install(
    dir: &Path,
    retired: &[Arc<Segment>],
    outputs: &[Arc<Segment>],
) -> CaskResult<()> {
    let manifest = MergeManifest::new(
        retired.iter().map(|s| s.id()).collect(),
        outputs.iter().map(|s| s.id()).collect(),
    );
    manifest.write(dir)?;

    for segment in retired {
        segment.close()?;
    }
    retire_superseded(dir, &manifest)?;

    for segment in outputs {
        let id = segment.id();
        let target = FileSet::Store.data_path(dir, id);
        if segment.path() != target {
            segment.rename(&target)?;
        }
        let hint = FileSet::Merge.hint_path(dir, id);
        if hint.exists() {
            move_file(&hint, &FileSet::Store.hint_path(dir, id))?;
        }
    }

    delete_retired(dir, &manifest)?;
    MergeManifest::remove(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn archive(dir: &Path, id: u16, records: &[(&[u8], &[u8])]) -> Arc<Segment> {
        let segment = Segment::create_active(&FileSet::Store.data_path(dir, id), id).unwrap();
        for (key, value) in records {
            segment.write(key, value, false).unwrap();
        }
        segment.make_archive().unwrap();
        Arc::new(segment)
    }

    #[test]
    fn test_stats_ratios() {
        let stats = MergeStats {
            records_kept: 3,
            tombstones_dropped: 1,
            stale_dropped: 0,
            bytes_before: 1000,
            bytes_after: 400,
            ..MergeStats::default()
        };
        assert_eq!(stats.bytes_saved(), 600);
        assert!((stats.dead_ratio() - 0.25).abs() < f64::EPSILON);
        assert_eq!(MergeStats::default().dead_ratio(), 0.0);
    }

    #[test]
    fn test_keeps_only_current_records() {
        let dir = TempDir::new().unwrap();
        let d = dir.path();
        let old = vec![
            archive(d, 1, &[(b"a", b"1"), (b"b", b"1")]),
            archive(d, 2, &[(b"a", b"2"), (b"b", b"")]),
        ];
        // live index: a -> (2, 1); b deleted
        let output = write_compacted(d, 1024, &old, 3, |key, seg, serial| {
            key == b"a" && seg == 2 && serial == 1
        })
        .unwrap();

        assert_eq!(output.stats.records_kept, 1);
        assert_eq!(output.stats.tombstones_dropped, 1);
        assert_eq!(output.stats.stale_dropped, 2);
        assert_eq!(output.segments.len(), 1);
        assert!(FileSet::Merge.data_path(d, 1).exists());

        let index = index_from_hints(&output.segments, 4096).unwrap();
        assert_eq!(index.len(), 1);
        let info = *index.get(b"a").unwrap();
        assert_eq!(info.segment_id, 1);
        assert_eq!(info.serial, 1);
        let value = output.segments[0].read_value(&info).unwrap().to_vec().unwrap();
        assert_eq!(value, b"2");
    }

    #[test]
    fn test_output_ids_stay_below_head() {
        let dir = TempDir::new().unwrap();
        let d = dir.path();
        let old = vec![
            archive(d, 1, &[(b"k1", b"v1"), (b"k2", b"v2")]),
            archive(d, 2, &[(b"k3", b"v3"), (b"k4", b"v4")]),
        ];
        // tiny threshold: one record per output, capped at head_id - 1
        let output = write_compacted(d, 1, &old, 3, |_, _, _| true).unwrap();
        let ids: Vec<u16> = output.segments.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(output.segments[1].keys().count(), 3);
        assert!(!FileSet::Merge.data_path(d, 3).exists());
    }

    #[test]
    fn test_nothing_live_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let d = dir.path();
        let old = vec![archive(d, 1, &[(b"gone", b"")])];
        let output = write_compacted(d, 1024, &old, 2, |_, _, _| false).unwrap();
        assert!(output.segments.is_empty());
        assert_eq!(output.stats.bytes_after, 0);
        assert!(!FileSet::Merge.data_path(d, 1).exists());
    }

    #[test]
    fn test_replay_applies_tombstones() {
        let dir = TempDir::new().unwrap();
        let d = dir.path();
        let head = archive(d, 5, &[(b"x", b"1"), (b"y", b"1"), (b"x", b"")]);
        let mut index = Index::new();
        let stale = crate::format::KeyInfo {
            segment_id: 1,
            serial: 1,
            value_size: 1,
            value_offset: 29,
        };
        index.insert(b"x".to_vec(), stale);
        let end = replay(&mut index, &head, 0).unwrap();
        assert_eq!(end, head.size());
        assert!(!index.contains(b"x"));
        assert!(index.points_to(b"y", 5, 2));
    }

    #[test]
    fn test_replay_resumes_at_offset() {
        let dir = TempDir::new().unwrap();
        let d = dir.path();
        let head = Segment::create_active(&FileSet::Store.data_path(d, 4), 4).unwrap();
        head.write(b"a", b"1", false).unwrap();
        let mut index = Index::new();
        let end = replay(&mut index, &head, 0).unwrap();

        head.write(b"a", b"", false).unwrap();
        head.write(b"b", b"2", false).unwrap();
        let mut tail = Index::new();
        assert_eq!(replay(&mut tail, &head, end).unwrap(), head.size());
        assert!(!tail.contains(b"a"));
        assert!(tail.points_to(b"b", 4, 3));

        replay(&mut index, &head, end).unwrap();
        assert!(!index.contains(b"a"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_install_can_be_repeated_after_failure() {
        let dir = TempDir::new().unwrap();
        let d = dir.path();
        let old = vec![archive(d, 1, &[(b"a", b"1")]), archive(d, 2, &[(b"b", b"2")])];
        let output = write_compacted(d, 1024, &old, 3, |_, _, _| true).unwrap();

        // a directory in the way of the first retirement
        let blocker = FileSet::Old.data_path(d, 1);
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();
        assert!(install(d, &old, &output.segments).is_err());
        assert!(d.join(crate::format::MANIFEST_FILENAME).exists());
        assert_eq!(output.segments[0].path(), FileSet::Merge.data_path(d, 1));

        std::fs::remove_dir_all(&blocker).unwrap();
        install(d, &old, &output.segments).unwrap();
        assert_eq!(output.segments[0].path(), FileSet::Store.data_path(d, 1));
        assert!(!FileSet::Store.data_path(d, 2).exists());
        assert!(!d.join(crate::format::MANIFEST_FILENAME).exists());
        let index = index_from_hints(&output.segments, 4096).unwrap();
        let info = *index.get(b"b").unwrap();
        let value = output.segments[0].read_value(&info).unwrap().to_vec().unwrap();
        assert_eq!(value, b"2");
    }

    #[test]
    fn test_install_moves_files() {
        let dir = TempDir::new().unwrap();
        let d = dir.path();
        let old = vec![archive(d, 1, &[(b"a", b"1")]), archive(d, 2, &[(b"b", b"2")])];
        std::fs::write(FileSet::Store.hint_path(d, 1), b"stale hint").unwrap();
        let output = write_compacted(d, 1024, &old, 3, |_, _, _| true).unwrap();

        install(d, &old, &output.segments).unwrap();

        assert!(FileSet::Store.data_path(d, 1).exists());
        assert!(FileSet::Store.hint_path(d, 1).exists());
        assert!(!FileSet::Store.data_path(d, 2).exists());
        assert!(!FileSet::Merge.data_path(d, 1).exists());
        assert!(!FileSet::Old.data_path(d, 1).exists());
        assert!(!FileSet::Old.hint_path(d, 1).exists());
        assert!(!d.join(crate::format::MANIFEST_FILENAME).exists());

        let hints = read_hints(&FileSet::Store.hint_path(d, 1), 1, 4096).unwrap();
        assert_eq!(hints.len(), 2);
        assert_eq!(output.segments[0].path(), FileSet::Store.data_path(d, 1));
    }
}
