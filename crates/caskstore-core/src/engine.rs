//! Core storage engine: the heart of CaskStore.
//!
//! `CaskStore` owns the key index, the open segments and the active
//! segment, and drives put/get/delete, rollover, merge, truncate and
//! startup recovery.
//!
//! **Write path**: append to the active segment, then point the index at it
//! **Read path**: index lookup under the read lock, then a `ValueHandle`
//! **Merge**: rewrites archive segments while writes continue on the head
//!
//! Locks are always taken merge lock first, then the state lock.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::compaction::{self, MergeStats};
use crate::config::Config;
use crate::error::{CaskError, CaskResult};
use crate::format::{FileSet, KeyInfo};
use crate::hint::read_hints;
use crate::index::Index;
use crate::platform_durability::sync_directory;
use crate::recovery::{self, remove_if_exists, MergeManifest};
use crate::segment::Segment;
use crate::value::ValueHandle;

/// What a committed mutation did to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// The key was absent before the put
    Add,
    /// The put replaced an existing value
    Change,
    /// The key was removed
    Delete,
}

/// Notification passed to the change hook after a mutation commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub key: Vec<u8>,
    pub kind: ChangeKind,
}

/// Callback invoked after every committed put or delete, outside the
/// engine's locks, on the thread that made the change.
pub type ChangeHook = Arc<dyn Fn(&Change) + Send + Sync>;

/// Merge result swapped into memory whose files are not all in place yet.
struct PendingInstall {
    retired: Vec<Arc<Segment>>,
    outputs: Vec<Arc<Segment>>,
}

struct StoreState {
    index: Index,
    /// Every open segment by id, head included
    segments: BTreeMap<u16, Arc<Segment>>,
    head: Arc<Segment>,
}

/// Embedded log-structured key-value store over one directory.
///
/// All public methods take `&self`; the store can be shared across
/// threads behind an `Arc`. Readers share the state lock, writers hold it
/// for one append plus the index update, and at most one merge runs at a
/// time.
pub struct CaskStore {
    path: PathBuf,
    config: Config,
    state: RwLock<StoreState>,
    /// Held for a whole merge; carries an install that has to be finished
    merge_lock: Mutex<Option<PendingInstall>>,
    hook: Option<ChangeHook>,
    closed: AtomicBool,
}

impl CaskStore {
    /// Open or create a store in `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> CaskResult<Self> {
        Self::open_inner(path.as_ref(), config, None)
    }

    /// Open or create a store whose mutations are reported to `hook`.
    pub fn open_with_hook<P: AsRef<Path>>(
        path: P,
        config: Config,
        hook: ChangeHook,
    ) -> CaskResult<Self> {
        Self::open_inner(path.as_ref(), config, Some(hook))
    }

    fn open_inner(path: &Path, config: Config, hook: Option<ChangeHook>) -> CaskResult<Self> {
        if path.as_os_str().is_empty() {
            return Err(CaskError::InvalidConfig("store path must not be empty".to_string()));
        }
        config.validate()?;

        let state = load(path, &config)?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
            state: RwLock::new(state),
            merge_lock: Mutex::new(None),
            hook,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> CaskResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CaskError::Closed);
        }
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> CaskResult<()> {
        if key.len() > self.config.max_key_size {
            return Err(CaskError::OversizedEntry {
                entry_size: key.len() as u64,
                max_size: self.config.max_key_size as u64,
                component: "key",
            });
        }
        Ok(())
    }

    fn notify(&self, key: &[u8], kind: ChangeKind) {
        if let Some(hook) = &self.hook {
            hook(&Change { key: key.to_vec(), kind });
        }
    }

    /// Store `value` under `key`. An empty value deletes the key.
    pub fn put(&self, key: &[u8], value: &[u8]) -> CaskResult<()> {
        if value.is_empty() {
            self.delete(key)?;
            return Ok(());
        }
        self.check_key(key)?;

        let kind = {
            let mut state = self.state.write();
            self.ensure_open()?;
            let info = state.head.write(key, value, self.config.sync_on_write)?;
            let kind = match state.index.insert(key.to_vec(), info) {
                Some(_) => ChangeKind::Change,
                None => ChangeKind::Add,
            };
            self.roll_over_if_full(&mut state);
            kind
        };
        self.notify(key, kind);
        Ok(())
    }

    /// Remove `key`. Returns false, writing nothing, if it was absent.
    pub fn delete(&self, key: &[u8]) -> CaskResult<bool> {
        {
            let mut state = self.state.write();
            self.ensure_open()?;
            if !state.index.contains(key) {
                return Ok(false);
            }
            // tombstone first: a failed append leaves the key readable
            state.head.write(key, &[], self.config.sync_on_write)?;
            state.index.remove(key);
            self.roll_over_if_full(&mut state);
        }
        self.notify(key, ChangeKind::Delete);
        Ok(true)
    }

    /// Demote a full head and start the next segment.
    ///
    /// The triggering write is already committed, so a failure here is
    /// logged and retried after the next write.
    fn roll_over_if_full(&self, state: &mut StoreState) {
        if state.head.size() < self.config.max_segment_size {
            return;
        }
        if let Err(e) = self.roll_over(state) {
            warn!(segment = state.head.id(), error = %e, "segment rollover failed");
        }
    }

    fn roll_over(&self, state: &mut StoreState) -> CaskResult<()> {
        let last_id = state.head.id();
        let id = last_id
            .checked_add(1)
            .ok_or(CaskError::SegmentIdsExhausted { last_id })?;
        let next = Arc::new(Segment::create_active(&FileSet::Store.data_path(&self.path, id), id)?);
        state.head.make_archive()?;
        debug!(from = last_id, to = id, size = state.head.size(), "rolled over to new segment");
        state.segments.insert(id, Arc::clone(&next));
        state.head = next;
        if let Err(e) = sync_directory(&self.path) {
            warn!(error = %e, "failed to sync store directory after rollover");
        }
        Ok(())
    }

    fn lookup(&self, key: &[u8]) -> CaskResult<Option<(Arc<Segment>, KeyInfo)>> {
        let state = self.state.read();
        self.ensure_open()?;
        let Some(info) = state.index.get(key).copied() else {
            return Ok(None);
        };
        let segment = state.segments.get(&info.segment_id).cloned().ok_or_else(|| {
            CaskError::InvalidState(format!("index points at missing segment {}", info.segment_id))
        })?;
        Ok(Some((segment, info)))
    }

    /// Reader over the current value of `key`.
    pub fn get(&self, key: &[u8]) -> CaskResult<Option<ValueHandle>> {
        let mut retired: Option<Arc<Segment>> = None;
        loop {
            let Some((segment, info)) = self.lookup(key)? else {
                return Ok(None);
            };
            match segment.read_value(&info) {
                Ok(handle) => return Ok(Some(handle)),
                // a merge retired the segment after the lookup; retry as
                // long as the index has moved on to a different segment
                Err(e) if e.is_segment_closed() && !is_same(&retired, &segment) => {
                    debug!(
                        segment = info.segment_id,
                        "segment closed under reader, retrying lookup"
                    );
                    retired = Some(segment);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Current value of `key`, read fully into memory.
    pub fn get_bytes(&self, key: &[u8]) -> CaskResult<Option<Vec<u8>>> {
        match self.get(key)? {
            Some(mut handle) => handle.to_vec().map(Some),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> CaskResult<bool> {
        let state = self.state.read();
        self.ensure_open()?;
        Ok(state.index.contains(key))
    }

    /// Number of live keys
    pub fn count(&self) -> CaskResult<usize> {
        let state = self.state.read();
        self.ensure_open()?;
        Ok(state.index.len())
    }

    pub fn is_empty(&self) -> CaskResult<bool> {
        Ok(self.count()? == 0)
    }

    /// Snapshot of the live key set
    pub fn keys(&self) -> CaskResult<Vec<Vec<u8>>> {
        let state = self.state.read();
        self.ensure_open()?;
        Ok(state.index.keys())
    }

    /// Lazily resolve every key in a snapshot of the key set.
    ///
    /// Keys deleted after the snapshot are skipped.
    pub fn iter(&self) -> CaskResult<Iter<'_>> {
        Ok(Iter {
            store: self,
            keys: self.keys()?.into_iter(),
        })
    }

    /// Durably sync the active segment.
    pub fn flush(&self) -> CaskResult<()> {
        let state = self.state.read();
        self.ensure_open()?;
        state.head.flush()
    }

    /// Compact every archive segment. See `compaction` for the steps.
    ///
    /// If the files of the previous merge could not all be moved into
    /// place, that is retried first; while it keeps failing, merge returns
    /// the error and writes nothing.
    pub fn merge(&self) -> CaskResult<MergeStats> {
        let mut pending = self.merge_lock.lock();
        self.ensure_open()?;
        if let Some(unfinished) = pending.as_ref() {
            compaction::install(&self.path, &unfinished.retired, &unfinished.outputs)?;
            info!(outputs = unfinished.outputs.len(), "finished installing earlier merge");
            *pending = None;
        }

        let (head_id, old, newer) = {
            let state = self.state.read();
            self.ensure_open()?;
            let head_id = state.head.id();
            let old: Vec<Arc<Segment>> =
                state.segments.range(..head_id).map(|(_, s)| Arc::clone(s)).collect();
            let newer = segments_from(&state, head_id);
            (head_id, old, newer)
        };
        debug!(segments = old.len(), head = head_id, path = %self.path.display(), "starting merge");
        if old.is_empty() {
            return Ok(MergeStats::default());
        }

        let output = compaction::write_compacted(
            &self.path,
            self.config.max_segment_size,
            &old,
            head_id,
            |key, segment_id, serial| self.state.read().index.points_to(key, segment_id, serial),
        )?;
        let outputs = output.segments;
        let stats = output.stats;

        let max_key_size = self.config.max_key_size;
        let mut candidate = match compaction::index_from_hints(&outputs, max_key_size) {
            Ok(index) => index,
            Err(e) => {
                compaction::abandon(&self.path, &outputs);
                return Err(e);
            }
        };

        // catch up on newer segments without blocking writers, then take
        // only the records appended since under the write lock
        let mut replayed: BTreeMap<u16, u64> = BTreeMap::new();
        for segment in &newer {
            match compaction::replay(&mut candidate, segment, 0) {
                Ok(end) => {
                    replayed.insert(segment.id(), end);
                }
                Err(e) => {
                    compaction::abandon(&self.path, &outputs);
                    return Err(e);
                }
            }
        }

        {
            let mut state = self.state.write();
            let newer = segments_from(&state, head_id);
            for segment in &newer {
                let from = replayed.get(&segment.id()).copied().unwrap_or(0);
                if let Err(e) = compaction::replay(&mut candidate, segment, from) {
                    drop(state);
                    compaction::abandon(&self.path, &outputs);
                    return Err(e);
                }
            }
            let mut segments = BTreeMap::new();
            for segment in outputs.iter().chain(newer.iter()) {
                segments.insert(segment.id(), Arc::clone(segment));
            }
            state.index = candidate;
            state.segments = segments;
        }

        if let Err(e) = compaction::install(&self.path, &old, &outputs) {
            warn!(
                error = %e,
                "merge swapped in memory but files were not all moved; retrying on next merge"
            );
            *pending = Some(PendingInstall { retired: old, outputs });
        }

        info!(
            merged = stats.segments_merged,
            outputs = stats.output_segments,
            kept = stats.records_kept,
            bytes_saved = stats.bytes_saved(),
            "merge complete"
        );
        Ok(stats)
    }

    /// Delete every record and start over with an empty `store_1`.
    pub fn truncate(&self) -> CaskResult<()> {
        let mut pending = self.merge_lock.lock();
        let mut state = self.state.write();
        self.ensure_open()?;

        for segment in state.segments.values() {
            if let Err(e) = segment.close() {
                warn!(segment = segment.id(), error = %e, "failed to sync segment before truncate");
            }
            remove_if_exists(&segment.path())?;
            remove_if_exists(&segment.hint_path())?;
        }
        if let Some(unfinished) = pending.as_ref() {
            for segment in &unfinished.retired {
                let id = segment.id();
                for set in [FileSet::Store, FileSet::Old] {
                    remove_if_exists(&set.data_path(&self.path, id))?;
                    remove_if_exists(&set.hint_path(&self.path, id))?;
                }
            }
            MergeManifest::remove(&self.path)?;
            *pending = None;
        }
        state.index.clear();
        state.segments.clear();

        let head = Segment::create_active(&FileSet::Store.data_path(&self.path, 1), 1)?;
        let head = Arc::new(head);
        state.segments.insert(1, Arc::clone(&head));
        state.head = head;
        sync_directory(&self.path)
            .map_err(|e| CaskError::io_at(&self.path, "failed to sync store directory", e))?;
        info!(path = %self.path.display(), "store truncated");
        Ok(())
    }

    /// Sync the head and release every file handle.
    ///
    /// Later calls on this store fail with `Closed`; closing twice is a no-op.
    pub fn close(&self) -> CaskResult<()> {
        let _merging = self.merge_lock.lock();
        let state = self.state.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_err = None;
        for segment in state.segments.values() {
            if let Err(e) = segment.close() {
                first_err.get_or_insert(e);
            }
        }
        debug!(path = %self.path.display(), "store closed");
        first_err.map_or(Ok(()), Err)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ids of the open segments, ascending; the last one is the head.
    pub fn segment_ids(&self) -> Vec<u16> {
        self.state.read().segments.keys().copied().collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for CaskStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "error closing store");
        }
    }
}

/// Segments with id `from` and up, in id order.
fn segments_from(state: &StoreState, from: u16) -> Vec<Arc<Segment>> {
    state.segments.range(from..).map(|(_, s)| Arc::clone(s)).collect()
}

fn is_same(retired: &Option<Arc<Segment>>, segment: &Arc<Segment>) -> bool {
    retired.as_ref().map_or(false, |r| Arc::ptr_eq(r, segment))
}

/// Iterator returned by `CaskStore::iter`.
pub struct Iter<'a> {
    store: &'a CaskStore,
    keys: std::vec::IntoIter<Vec<u8>>,
}

impl Iterator for Iter<'_> {
    type Item = CaskResult<(Vec<u8>, ValueHandle)>;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            match self.store.get(&key) {
                Ok(Some(handle)) => return Some(Ok((key, handle))),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

/// Index entries from a segment's hint file, checked against its size.
fn hinted_entries(segment: &Segment, max_key_size: usize) -> CaskResult<Vec<(Vec<u8>, KeyInfo)>> {
    let path = segment.hint_path();
    let entries = read_hints(&path, segment.id(), max_key_size)?;
    let size = segment.size();
    if let Some((_, info)) = entries
        .iter()
        .find(|(_, info)| info.value_offset as u64 + info.value_size as u64 > size)
    {
        return Err(CaskError::CorruptHint {
            path,
            offset: 0,
            reason: format!(
                "value at {}+{} lies past the end of a {} byte segment",
                info.value_offset, info.value_size, size
            ),
        });
    }
    Ok(entries)
}

/// Rebuild the in-memory state from the files in `dir`.
fn load(dir: &Path, config: &Config) -> CaskResult<StoreState> {
    fs::create_dir_all(dir)
        .map_err(|e| CaskError::io_at(dir, "failed to create store directory", e))?;
    let report = recovery::recover(dir)?;
    if report.rolled_forward || report.removed_files > 0 {
        info!(
            path = %dir.display(),
            rolled_forward = report.rolled_forward,
            removed_files = report.removed_files,
            "recovered store directory"
        );
    }

    let mut ids = Vec::new();
    let entries = fs::read_dir(dir)
        .map_err(|e| CaskError::io_at(dir, "failed to list store directory", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CaskError::io_at(dir, "failed to list store directory", e))?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(|n| FileSet::Store.parse_data_name(n)) {
            ids.push(id);
        }
    }
    ids.sort_unstable();

    let mut index = Index::new();
    let mut segments = BTreeMap::new();
    // serial and valid length of the last segment, for reopening it
    let mut tail = (0u32, 0u64, false);

    let last_id = ids.last().copied();
    for &id in &ids {
        let segment = Segment::open_archive(&FileSet::Store.data_path(dir, id), id)?;
        let mut max_serial = 0u32;

        // a segment that will be reopened for writing is always scanned,
        // which also finds a torn tail
        let reopens = Some(id) == last_id && segment.size() < config.max_segment_size;
        let hinted = if !reopens && segment.hint_path().exists() {
            match hinted_entries(&segment, config.max_key_size) {
                Ok(entries) => Some(entries),
                Err(e) => {
                    warn!(segment = id, error = %e, "unusable hint file, rebuilding from data");
                    None
                }
            }
        } else {
            None
        };

        let mut valid_end = segment.size();
        let mut torn = false;
        match hinted {
            Some(entries) => {
                for (key, info) in entries {
                    max_serial = max_serial.max(info.serial);
                    index.apply(key, info);
                }
            }
            None => {
                let mut keys = segment.keys();
                for entry in keys.by_ref() {
                    let (key, info) = entry?;
                    max_serial = max_serial.max(info.serial);
                    index.apply(key, info);
                }
                valid_end = keys.valid_end();
                torn = keys.hit_torn_tail();
                if torn {
                    warn!(
                        segment = id,
                        valid_end,
                        size = segment.size(),
                        "torn record at end of segment"
                    );
                }
            }
        }
        tail = (max_serial, valid_end, torn);
        segments.insert(id, Arc::new(segment));
    }

    let head = match last_id {
        Some(last) if tail.1 < config.max_segment_size => {
            let (serial, valid_end, torn) = tail;
            if let Some(archived) = segments.remove(&last) {
                archived.close()?;
            }
            let path = FileSet::Store.data_path(dir, last);
            let segment = Segment::open_active(&path, last, serial)?;
            if torn {
                segment.truncate_to(valid_end)?;
            }
            // new appends would not be in it
            remove_if_exists(&FileSet::Store.hint_path(dir, last))?;
            Arc::new(segment)
        }
        Some(last) => {
            let id = last
                .checked_add(1)
                .ok_or(CaskError::SegmentIdsExhausted { last_id: last })?;
            Arc::new(Segment::create_active(&FileSet::Store.data_path(dir, id), id)?)
        }
        None => Arc::new(Segment::create_active(&FileSet::Store.data_path(dir, 1), 1)?),
    };
    segments.insert(head.id(), Arc::clone(&head));

    info!(
        path = %dir.display(),
        segments = segments.len(),
        keys = index.len(),
        head = head.id(),
        "opened store"
    );
    Ok(StoreState { index, segments, head })
}
