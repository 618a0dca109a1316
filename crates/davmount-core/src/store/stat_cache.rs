//! Path-keyed cache of POSIX stat records.
//!
//! Three kinds of state live in the KV partition:
//! - `sc:<path>` — a [`StatRecord`]: the stat proper (or a negative entry)
//!   plus the local generation it was written under.
//! - `cu:<path>` — wall-clock timestamp of the last successful refresh of
//!   the directory's direct children. Absence reads as 0 (never refreshed).
//! - a process-wide generation counter, sampled before a full directory
//!   refresh and used afterwards to prune entries the refresh did not touch.
//!
//! Freshness: a lookup is only trusted while the parent directory's
//! children-updated timestamp is within the negative TTL; outside that
//! window the entry is reported expired unless the caller asks to ignore
//! freshness (saint mode does).

use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::{STAT_CACHE_NEGATIVE_TTL_SECS, STAT_CACHE_PRUNE_THRESHOLD_SECS};
use crate::errors::DavResult;
use crate::path;
use crate::store::kv::KvStore;
use crate::util::unix_time;

const STAT_PREFIX: &str = "sc:";
const CHILDREN_PREFIX: &str = "cu:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatEntry {
    pub mode: u32,
    pub nlink: u32,
    pub size: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub blksize: u32,
    pub blocks: i64,
    pub uid: u32,
    pub gid: u32,
}

impl StatEntry {
    /// Synthesized stat record, the shape every local mutation produces:
    /// directories get nlink 3 and size 4096, files get their size from the
    /// open body when one is at hand.
    pub fn generic(mode: u32, is_dir: bool, body: Option<&File>) -> Self {
        let now = unix_time() as i64;
        let mut st = StatEntry {
            mode,
            nlink: 1,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            blksize: 4096,
            blocks: 0,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        };
        if is_dir {
            st.mode |= libc::S_IFDIR;
            st.nlink = 3;
            st.size = 4096;
        } else {
            st.mode |= libc::S_IFREG;
            st.nlink = 1;
        }
        if let Some(file) = body {
            st.size = file.metadata().map(|m| m.len() as i64).unwrap_or(0);
        }
        st.blocks = (st.size + 511) / 512;
        st
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }
}

/// Persisted record. `st == None` is a negative entry: the path was
/// observed to not exist, cacheable like any other answer.
#[derive(Debug, Serialize, Deserialize)]
struct StatRecord {
    st: Option<StatEntry>,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(StatEntry),
    Negative,
    Expired,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerateOutcome {
    Done,
    TooOld,
    NoData,
}

pub struct StatCache {
    kv: Arc<KvStore>,
    generation: AtomicU64,
    negative_ttl: u64,
    prune_threshold: u64,
}

impl StatCache {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self::with_windows(
            kv,
            STAT_CACHE_NEGATIVE_TTL_SECS,
            STAT_CACHE_PRUNE_THRESHOLD_SECS,
        )
    }

    pub fn with_windows(kv: Arc<KvStore>, negative_ttl: u64, prune_threshold: u64) -> Self {
        Self {
            kv,
            generation: AtomicU64::new(1),
            negative_ttl,
            prune_threshold,
        }
    }

    pub fn negative_ttl(&self) -> u64 {
        self.negative_ttl
    }

    fn stat_key(path: &str) -> Vec<u8> {
        format!("{STAT_PREFIX}{path}").into_bytes()
    }

    fn children_key(path: &str) -> Vec<u8> {
        format!("{CHILDREN_PREFIX}{path}").into_bytes()
    }

    /// Prefix under which a directory's descendants are keyed.
    fn child_prefix(dir: &str) -> String {
        if dir == "/" {
            format!("{STAT_PREFIX}/")
        } else {
            format!("{STAT_PREFIX}{dir}/")
        }
    }

    /// Returns the current generation and advances the counter.
    pub fn local_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self, path: &str, ignore_freshness: bool) -> DavResult<Lookup> {
        if !ignore_freshness {
            let updated = self.read_children_updated(path::parent(path))?;
            if updated + self.negative_ttl < unix_time() {
                return Ok(Lookup::Expired);
            }
        }
        match self.kv.get(&Self::stat_key(path))? {
            None => Ok(Lookup::Absent),
            Some(raw) => {
                let record: StatRecord = bincode::deserialize(&raw)?;
                Ok(match record.st {
                    Some(st) => Lookup::Hit(st),
                    None => Lookup::Negative,
                })
            }
        }
    }

    pub fn set(&self, path: &str, st: &StatEntry) -> DavResult<()> {
        self.write_record(path, Some(st.clone()))
    }

    pub fn set_negative(&self, path: &str) -> DavResult<()> {
        self.write_record(path, None)
    }

    fn write_record(&self, path: &str, st: Option<StatEntry>) -> DavResult<()> {
        let record = StatRecord {
            st,
            generation: self.local_generation(),
        };
        self.kv
            .put(&Self::stat_key(path), &bincode::serialize(&record)?)
    }

    pub fn delete(&self, path: &str) -> DavResult<()> {
        self.kv.delete(&Self::stat_key(path))
    }

    /// Streams each direct child's basename to `visit`, in key order.
    /// Negative entries are skipped; entries deeper than one level are not
    /// direct children and are skipped too.
    pub fn enumerate<F: FnMut(&str)>(
        &self,
        dir: &str,
        mut visit: F,
        ignore_freshness: bool,
    ) -> DavResult<EnumerateOutcome> {
        if !ignore_freshness {
            let updated = self.read_children_updated(dir)?;
            // Never refreshed and merely stale are different answers: the
            // first forces a full listing, the second permits a windowed one.
            if updated == 0 {
                return Ok(EnumerateOutcome::NoData);
            }
            if updated + self.negative_ttl < unix_time() {
                return Ok(EnumerateOutcome::TooOld);
            }
        }

        let prefix = Self::child_prefix(dir);
        let mut found = false;
        for item in self.kv.scan_prefix(prefix.as_bytes()) {
            let (key, raw) = item?;
            let rest = &key[prefix.len()..];
            if rest.is_empty() || rest.contains(&b'/') {
                continue;
            }
            let record: StatRecord = bincode::deserialize(&raw)?;
            if record.st.is_none() {
                continue;
            }
            found = true;
            if let Ok(name) = std::str::from_utf8(rest) {
                visit(name);
            }
        }

        if found {
            Ok(EnumerateOutcome::Done)
        } else {
            Ok(EnumerateOutcome::NoData)
        }
    }

    /// True when any live entry exists under `dir_path + "/"`.
    pub fn dir_has_child(&self, dir: &str) -> DavResult<bool> {
        let prefix = Self::child_prefix(dir);
        for item in self.kv.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            let record: StatRecord = bincode::deserialize(&raw)?;
            if record.st.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn read_children_updated(&self, dir: &str) -> DavResult<u64> {
        match self.kv.get(&Self::children_key(dir))? {
            None => Ok(0),
            Some(raw) => Ok(bincode::deserialize(&raw)?),
        }
    }

    pub fn write_children_updated(&self, dir: &str, timestamp: u64) -> DavResult<()> {
        self.kv
            .put(&Self::children_key(dir), &bincode::serialize(&timestamp)?)
    }

    /// Deletes entries under the directory prefix whose generation predates
    /// `min_generation`. Run after a full refresh has repopulated the
    /// directory: everything the refresh wrote carries a newer generation,
    /// so only entries the server no longer reports are removed.
    pub fn delete_older(&self, dir: &str, min_generation: u64) -> DavResult<()> {
        let prefix = Self::child_prefix(dir);
        let mut doomed = Vec::new();
        for item in self.kv.scan_prefix(prefix.as_bytes()) {
            let (key, raw) = item?;
            let record: StatRecord = bincode::deserialize(&raw)?;
            if record.generation < min_generation {
                doomed.push(key);
            }
        }
        for key in doomed {
            self.kv.delete(&key)?;
        }
        Ok(())
    }

    /// Drops directories that have not been listed in a long time, entries
    /// and bookkeeping both. The next access repopulates from the server.
    pub fn prune(&self) -> DavResult<()> {
        let now = unix_time();
        let mut stale_dirs = Vec::new();
        for item in self.kv.scan_prefix(CHILDREN_PREFIX.as_bytes()) {
            let (key, raw) = item?;
            let timestamp: u64 = bincode::deserialize(&raw)?;
            if timestamp + self.prune_threshold < now {
                if let Ok(dir) = std::str::from_utf8(&key[CHILDREN_PREFIX.len()..]) {
                    stale_dirs.push(dir.to_string());
                }
            }
        }

        let mut dropped = 0usize;
        for dir in &stale_dirs {
            let mut doomed = Vec::new();
            for item in self.kv.scan_prefix(Self::child_prefix(dir).as_bytes()) {
                doomed.push(item?.0);
            }
            dropped += doomed.len();
            for key in doomed {
                self.kv.delete(&key)?;
            }
            self.kv.delete(&Self::children_key(dir))?;
        }
        if !stale_dirs.is_empty() {
            tracing::info!(
                "stat cache prune: dropped {} directories, {} entries",
                stale_dirs.len(),
                dropped
            );
        }
        Ok(())
    }
}
