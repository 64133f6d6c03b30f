//! Persistent blob cache with a journal and LRU eviction.
//!
//! Stores compressed blobs one file per entry under a dedicated directory,
//! indexed by a versioned, append-friendly text journal. Commits are atomic:
//! blob bytes are written to a temp file, fsynced, renamed over the final
//! path, and only then journaled; a reader can never observe a torn blob.
//! Entries survive process restarts and are evicted oldest-unused-first once
//! the byte ceiling is exceeded.
//!
//! Journal layout: a four-line header (magic, journal format version, an
//! application version tag, values per entry) followed by a blank line and
//! one record per line:
//!
//! ```text
//! DIRTY <stem>        an edit was opened
//! CLEAN <stem> <len>  the edit committed a <len>-byte blob
//! READ <stem>         a read touched the entry
//! REMOVE <stem>       the entry was removed or evicted
//! ```
//!
//! A header mismatch wipes the directory; a trailing `DIRTY` without a
//! `CLEAN` or `REMOVE` is rolled back on reopen.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::CacheKey;

/// Default byte ceiling for the disk tier: 10 MiB.
pub const DEFAULT_DISK_CAPACITY: usize = 10 * 1024 * 1024;

const JOURNAL_FILE: &str = "journal";
const JOURNAL_TMP: &str = "journal.tmp";
const MAGIC: &str = "longview.diskcache";
const FORMAT_VERSION: &str = "1";
const VALUE_COUNT: &str = "1";
const BLOB_EXT: &str = "blob";

/// Redundant records tolerated before the journal is rewritten in place.
const COMPACT_THRESHOLD: usize = 1000;

/// Disk-tier failure. Callers above the tiered cache never see this; the
/// tier degrades to memory-only for the failing operation.
#[derive(Debug, Error)]
pub enum DiskCacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Statistics for monitoring the disk tier.
#[derive(Debug, Clone, Default)]
pub struct DiskCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_count: usize,
    pub bytes_used: usize,
}

#[derive(Debug)]
struct Entry {
    path: PathBuf,
    len: usize,
}

struct CacheState {
    dir: PathBuf,
    capacity: usize,
    version_tag: String,
    entries: HashMap<String, Entry>,
    /// Usage order: oldest-unused at the front.
    lru_queue: VecDeque<String>,
    journal: BufWriter<File>,
    redundant_ops: usize,
    stats: DiskCacheStats,
}

/// Persistent key → blob store with crash-safe commits.
///
/// All operations serialize on one lock, which also guarantees at most one
/// open edit per key at a time.
pub struct DiskBlobCache {
    state: Mutex<CacheState>,
}

impl DiskBlobCache {
    /// Open (or create) the cache rooted at `dir`.
    ///
    /// `version_tag` identifies the writing application/platform generation;
    /// when it changes, the on-disk contents are discarded and the cache
    /// starts empty.
    pub fn open(
        dir: impl AsRef<Path>,
        capacity: usize,
        version_tag: &str,
    ) -> Result<Self, DiskCacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let replayed = match read_journal(&dir, version_tag) {
            Some(replayed) => replayed,
            None => {
                debug!(dir = %dir.display(), "journal missing, stale or corrupt; starting empty");
                wipe_cache_dir(&dir)?;
                Replayed::default()
            }
        };

        let mut entries = HashMap::new();
        let mut lru_queue = VecDeque::new();
        let mut bytes_used = 0usize;
        for stem in replayed.order {
            let path = blob_path(&dir, &stem);
            match fs::metadata(&path) {
                Ok(meta) => {
                    let len = meta.len() as usize;
                    bytes_used += len;
                    entries.insert(stem.clone(), Entry { path, len });
                    lru_queue.push_back(stem);
                }
                // The journal referenced a file that is gone; drop the entry.
                Err(_) => continue,
            }
        }

        remove_unreferenced_files(&dir, &entries)?;

        let journal = rewrite_journal(&dir, version_tag, &lru_queue, &entries)?;

        let mut state = CacheState {
            dir,
            capacity,
            version_tag: version_tag.to_string(),
            entries,
            lru_queue,
            journal,
            redundant_ops: 0,
            stats: DiskCacheStats {
                bytes_used,
                ..Default::default()
            },
        };
        state.stats.entry_count = state.entries.len();
        state.evict_to_capacity()?;

        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Read the committed blob for `key`, touching its usage order.
    ///
    /// A key with no committed snapshot is a miss, never a partial blob.
    pub fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, DiskCacheError> {
        let mut state = self.state.lock().unwrap();
        let stem = file_stem(key);

        let path = match state.entries.get(&stem) {
            Some(entry) => entry.path.clone(),
            None => {
                state.stats.misses += 1;
                return Ok(None);
            }
        };

        let blob = match fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Index is stale (file removed externally); forget the entry.
                state.forget(&stem);
                state.stats.misses += 1;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        state.touch(&stem);
        state.stats.hits += 1;
        // A lost READ record only costs recency accuracy, not correctness.
        if state.append_record(&format!("READ {stem}")).is_ok() {
            state.redundant_ops += 1;
        }
        state.maybe_compact();
        Ok(Some(blob))
    }

    /// Atomically commit `blob` under `key`, then evict oldest-unused
    /// entries until the store fits the byte ceiling again.
    pub fn put(&self, key: &CacheKey, blob: &[u8]) -> Result<(), DiskCacheError> {
        let mut state = self.state.lock().unwrap();
        let stem = file_stem(key);

        state.append_record(&format!("DIRTY {stem}"))?;

        let tmp = state.dir.join(format!("{stem}.{BLOB_EXT}.tmp"));
        let path = blob_path(&state.dir, &stem);
        if let Err(e) = commit_blob(&tmp, &path, blob) {
            // Roll the edit back; a half-written temp file must not survive.
            let _ = fs::remove_file(&tmp);
            let _ = state.append_record(&format!("REMOVE {stem}"));
            state.forget(&stem);
            return Err(e.into());
        }

        state.append_record(&format!("CLEAN {stem} {}", blob.len()))?;

        if let Some(old) = state.entries.insert(
            stem.clone(),
            Entry {
                path,
                len: blob.len(),
            },
        ) {
            state.stats.bytes_used = state.stats.bytes_used.saturating_sub(old.len);
            state.redundant_ops += 1;
        }
        state.stats.bytes_used += blob.len();
        state.touch(&stem);
        state.stats.entry_count = state.entries.len();

        state.evict_to_capacity()?;
        state.maybe_compact();
        Ok(())
    }

    /// Check for a committed entry without touching usage order.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state
            .lock()
            .unwrap()
            .entries
            .contains_key(&file_stem(key))
    }

    /// Remove the entry for `key`, if any.
    pub fn remove(&self, key: &CacheKey) -> Result<(), DiskCacheError> {
        let mut state = self.state.lock().unwrap();
        let stem = file_stem(key);
        if let Some(entry) = state.entries.remove(&stem) {
            remove_file_if_exists(&entry.path)?;
            state.stats.bytes_used = state.stats.bytes_used.saturating_sub(entry.len);
            state.lru_queue.retain(|s| s != &stem);
            state.stats.entry_count = state.entries.len();
            state.append_record(&format!("REMOVE {stem}"))?;
            state.redundant_ops += 2;
            state.maybe_compact();
        }
        Ok(())
    }

    /// Delete every entry and reset the journal.
    pub fn clear(&self) -> Result<(), DiskCacheError> {
        let mut state = self.state.lock().unwrap();
        let entries: Vec<Entry> = state.entries.drain().map(|(_, e)| e).collect();
        for entry in entries {
            remove_file_if_exists(&entry.path)?;
        }
        state.lru_queue.clear();
        state.stats.entry_count = 0;
        state.stats.bytes_used = 0;
        state.compact()?;
        Ok(())
    }

    pub fn stats(&self) -> DiskCacheStats {
        self.state.lock().unwrap().stats.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().entries.is_empty()
    }

    pub fn bytes_used(&self) -> usize {
        self.state.lock().unwrap().stats.bytes_used
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }

    pub fn dir(&self) -> PathBuf {
        self.state.lock().unwrap().dir.clone()
    }
}

impl CacheState {
    fn touch(&mut self, stem: &str) {
        self.lru_queue.retain(|s| s != stem);
        self.lru_queue.push_back(stem.to_string());
    }

    /// Drop an entry from the index without touching its file.
    fn forget(&mut self, stem: &str) {
        if let Some(entry) = self.entries.remove(stem) {
            self.stats.bytes_used = self.stats.bytes_used.saturating_sub(entry.len);
        }
        self.lru_queue.retain(|s| s != stem);
        self.stats.entry_count = self.entries.len();
    }

    fn append_record(&mut self, record: &str) -> io::Result<()> {
        writeln!(self.journal, "{record}")?;
        self.journal.flush()
    }

    /// Evict oldest-unused entries until the store fits the ceiling.
    fn evict_to_capacity(&mut self) -> Result<(), DiskCacheError> {
        while self.stats.bytes_used > self.capacity {
            let Some(stem) = self.lru_queue.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&stem) {
                remove_file_if_exists(&entry.path)?;
                self.stats.bytes_used = self.stats.bytes_used.saturating_sub(entry.len);
                self.stats.evictions += 1;
                self.append_record(&format!("REMOVE {stem}"))?;
                self.redundant_ops += 2;
            }
        }
        self.stats.entry_count = self.entries.len();
        Ok(())
    }

    fn maybe_compact(&mut self) {
        if self.redundant_ops >= COMPACT_THRESHOLD && self.redundant_ops >= self.entries.len() {
            if let Err(e) = self.compact() {
                warn!(error = %e, "journal compaction failed");
            }
        }
    }

    fn compact(&mut self) -> io::Result<()> {
        let journal =
            rewrite_journal(&self.dir, &self.version_tag, &self.lru_queue, &self.entries)?;
        self.journal = journal;
        self.redundant_ops = 0;
        Ok(())
    }
}

#[derive(Default)]
struct Replayed {
    /// Committed stems in least-recently-used order.
    order: Vec<String>,
}

/// Parse and replay the journal. `None` means absent, corrupt, or written by
/// a different version; the caller starts empty.
fn read_journal(dir: &Path, version_tag: &str) -> Option<Replayed> {
    let file = File::open(dir.join(JOURNAL_FILE)).ok()?;
    let mut lines = BufReader::new(file).lines();

    let magic = lines.next()?.ok()?;
    let format = lines.next()?.ok()?;
    let tag = lines.next()?.ok()?;
    let values = lines.next()?.ok()?;
    let blank = lines.next()?.ok()?;
    if magic != MAGIC
        || format != FORMAT_VERSION
        || tag != version_tag
        || values != VALUE_COUNT
        || !blank.is_empty()
    {
        return None;
    }

    fn touch(order: &mut Vec<String>, stem: &str) {
        order.retain(|s| s != stem);
        order.push(stem.to_string());
    }

    let mut order: Vec<String> = Vec::new();
    let mut committed: HashSet<String> = HashSet::new();
    let mut dirty: HashSet<String> = HashSet::new();

    for line in lines {
        let line = line.ok()?;
        let mut parts = line.split(' ');
        let op = parts.next()?;
        let stem = parts.next()?;
        match op {
            "DIRTY" => {
                dirty.insert(stem.to_string());
            }
            "CLEAN" => {
                // The length field is informative; sizes are re-read from
                // file metadata on open.
                dirty.remove(stem);
                committed.insert(stem.to_string());
                touch(&mut order, stem);
            }
            "READ" => {
                if committed.contains(stem) {
                    touch(&mut order, stem);
                }
            }
            "REMOVE" => {
                dirty.remove(stem);
                committed.remove(stem);
                order.retain(|s| s != stem);
            }
            _ => return None,
        }
    }

    // An edit that never committed is rolled back: its stem is not in the
    // committed set, and its files go away with the unreferenced-file sweep.
    order.retain(|s| committed.contains(s));

    Some(Replayed { order })
}

/// Write a compact journal (header + one CLEAN per live entry in usage
/// order) and return an appender positioned at its end.
fn rewrite_journal(
    dir: &Path,
    version_tag: &str,
    order: &VecDeque<String>,
    entries: &HashMap<String, Entry>,
) -> io::Result<BufWriter<File>> {
    let tmp_path = dir.join(JOURNAL_TMP);
    {
        let mut tmp = BufWriter::new(File::create(&tmp_path)?);
        writeln!(tmp, "{MAGIC}")?;
        writeln!(tmp, "{FORMAT_VERSION}")?;
        writeln!(tmp, "{version_tag}")?;
        writeln!(tmp, "{VALUE_COUNT}")?;
        writeln!(tmp)?;
        for stem in order {
            if let Some(entry) = entries.get(stem) {
                writeln!(tmp, "CLEAN {stem} {}", entry.len)?;
            }
        }
        tmp.flush()?;
        tmp.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, dir.join(JOURNAL_FILE))?;

    let file = File::options().append(true).open(dir.join(JOURNAL_FILE))?;
    Ok(BufWriter::new(file))
}

/// Write blob bytes to `tmp`, fsync, and rename over `path`.
fn commit_blob(tmp: &Path, path: &Path, blob: &[u8]) -> io::Result<()> {
    let mut file = File::create(tmp)?;
    file.write_all(blob)?;
    file.sync_all()?;
    fs::rename(tmp, path)
}

fn blob_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.{BLOB_EXT}"))
}

fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Delete every cache artifact in `dir` (journal, blobs, temp files).
fn wipe_cache_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let ours = name == JOURNAL_FILE
            || name == JOURNAL_TMP
            || name.ends_with(&format!(".{BLOB_EXT}"))
            || name.ends_with(".tmp");
        if ours {
            remove_file_if_exists(&path)?;
        }
    }
    Ok(())
}

/// Delete blob and temp files the replayed index does not reference.
fn remove_unreferenced_files(dir: &Path, entries: &HashMap<String, Entry>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == JOURNAL_FILE {
            continue;
        }
        if name.ends_with(".tmp") {
            remove_file_if_exists(&path)?;
        } else if let Some(stem) = name.strip_suffix(&format!(".{BLOB_EXT}")) {
            if !entries.contains_key(stem) {
                remove_file_if_exists(&path)?;
            }
        }
    }
    Ok(())
}

/// Map a cache key to a filesystem-safe, restart-stable file stem: a
/// sanitized prefix for debuggability plus an FNV-1a hash for uniqueness.
fn file_stem(key: &CacheKey) -> String {
    let mut stem: String = key
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(48)
        .collect();
    if stem.is_empty() {
        stem.push('x');
    }
    format!("{stem}-{:016x}", fnv1a64(key.as_str().as_bytes()))
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
