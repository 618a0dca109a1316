//! Per-path body files coordinated with the KV store.
//!
//! Each cached file is a pair: a body file under `<cache_path>/files/`
//! and a `fc:<path>` record naming the body file, the server's entity tag
//! for it, and when it was last revalidated. Opens either reuse the body,
//! revalidate it with a conditional GET, or replace it; syncs push the
//! body back with a PUT and record the returned tag. A periodic sweep
//! restores the invariant that body files and records reference each
//! other one-to-one.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt as _;
use serde::{Deserialize, Serialize};

use crate::constants::{AGE_OUT_THRESHOLD_SECS, ETAG_MAX, REFRESH_INTERVAL_SECS};
use crate::errors::{DavError, DavResult};
use crate::store::kv::KvStore;
use crate::util::unix_time;
use crate::webdav::{DavTransport, GetOutcome};

const FILECACHE_PREFIX: &str = "fc:";
const BODY_FILE_PREFIX: &str = "davmount-cache-";

/// Persisted record for one cached file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub body_file: PathBuf,
    pub etag: String,
    pub last_server_update: u64,
}

/// State for one filesystem open, released on close.
#[derive(Debug)]
pub struct Session {
    file: File,
    readable: bool,
    writable: bool,
    modified: bool,
}

impl Session {
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Positional read on the body file.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> DavResult<usize> {
        if !self.readable {
            return Err(DavError::BadDescriptor("session is write-only".into()));
        }
        Ok(self.file.read_at(buf, offset)?)
    }

    /// Positional write; marks the session modified.
    pub fn write(&mut self, buf: &[u8], offset: u64) -> DavResult<usize> {
        if !self.writable {
            return Err(DavError::BadDescriptor("session is read-only".into()));
        }
        let written = self.file.write_at(buf, offset)?;
        self.modified = true;
        Ok(written)
    }

    pub fn truncate(&mut self, size: u64) -> DavResult<()> {
        if !self.writable {
            return Err(DavError::BadDescriptor("session is read-only".into()));
        }
        self.file.set_len(size)?;
        self.modified = true;
        Ok(())
    }
}

/// Open flags of interest, decoded from the kernel's bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn from_bits(flags: i32) -> Self {
        let acc = flags & libc::O_ACCMODE;
        Self {
            read: acc == libc::O_RDONLY || acc == libc::O_RDWR,
            write: acc == libc::O_WRONLY || acc == libc::O_RDWR,
            create: flags & libc::O_CREAT != 0,
            truncate: flags & libc::O_TRUNC != 0,
        }
    }

    /// Revalidation may need to read the body, so write-only opens are
    /// widened to read-write.
    pub fn promote_write_only(mut self) -> Self {
        if self.write && !self.read {
            self.read = true;
        }
        self
    }
}

/// How far a failed fetch may fall back on cached content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceLevel {
    /// Fetch failures are errors.
    None,
    /// Try the server once, fall back to the cached body on failure.
    Retry,
    /// Saint mode: skip the server entirely, reuse whatever body exists.
    Saint,
}

pub struct FileCache {
    kv: Arc<KvStore>,
    files_dir: PathBuf,
    transport: Arc<dyn DavTransport>,
    refresh_interval: u64,
    age_out_threshold: u64,
}

impl FileCache {
    /// Opens the cache, ensuring `<cache_path>/files/` exists.
    pub fn new(
        kv: Arc<KvStore>,
        cache_path: &Path,
        transport: Arc<dyn DavTransport>,
    ) -> DavResult<Self> {
        Self::with_windows(
            kv,
            cache_path,
            transport,
            REFRESH_INTERVAL_SECS,
            AGE_OUT_THRESHOLD_SECS,
        )
    }

    pub fn with_windows(
        kv: Arc<KvStore>,
        cache_path: &Path,
        transport: Arc<dyn DavTransport>,
        refresh_interval: u64,
        age_out_threshold: u64,
    ) -> DavResult<Self> {
        let files_dir = cache_path.join("files");
        fs::create_dir_all(&files_dir)?;
        Ok(Self {
            kv,
            files_dir,
            transport,
            refresh_interval,
            age_out_threshold,
        })
    }

    fn key(path: &str) -> Vec<u8> {
        format!("{FILECACHE_PREFIX}{path}").into_bytes()
    }

    pub fn entry(&self, path: &str) -> DavResult<Option<FileEntry>> {
        match self.kv.get(&Self::key(path))? {
            None => Ok(None),
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
        }
    }

    pub(crate) fn put_entry(&self, path: &str, entry: &FileEntry) -> DavResult<()> {
        self.kv.put(&Self::key(path), &bincode::serialize(entry)?)
    }

    fn new_body_file(&self) -> DavResult<(File, PathBuf)> {
        let named = tempfile::Builder::new()
            .prefix(BODY_FILE_PREFIX)
            .rand_bytes(6)
            .tempfile_in(&self.files_dir)?;
        named
            .keep()
            .map_err(|err| DavError::io(format!("keep body file: {err}")))
    }

    fn open_body(&self, entry: &FileEntry, flags: OpenFlags) -> DavResult<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(flags.write)
            .open(&entry.body_file)?)
    }

    fn session(file: File, flags: OpenFlags) -> Session {
        Session {
            file,
            readable: flags.read,
            writable: flags.write,
            modified: false,
        }
    }

    /// Obtains a session for `path` per the open decision table. The
    /// second element reports that stale content had to be served under
    /// grace, which the caller escalates to the degradation controller.
    pub fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        grace: GraceLevel,
    ) -> DavResult<(Session, bool)> {
        let entry = self.entry(path)?;

        // A new file, or a truncate of something we have never cached:
        // fresh empty body, no server interaction.
        if flags.create || (flags.truncate && entry.is_none()) {
            if flags.create && entry.is_some() {
                tracing::warn!("open: creating over an existing cache entry: {path}");
            }
            let (file, body_path) = self.new_body_file()?;
            self.put_entry(
                path,
                &FileEntry {
                    body_file: body_path,
                    etag: String::new(),
                    last_server_update: unix_time(),
                },
            )?;
            let mut session = Self::session(file, flags);
            session.writable = true;
            session.modified = true;
            return Ok((session, false));
        }

        // Reusable as-is? Truncation never needs the server copy, and a
        // recently revalidated body is trusted outright.
        if let Some(entry) = &entry {
            let fresh =
                unix_time().saturating_sub(entry.last_server_update) <= self.refresh_interval;
            if flags.truncate || fresh {
                let file = self.open_body(entry, flags)?;
                if flags.truncate {
                    file.lock_shared()?;
                    file.set_len(0)?;
                    let _ = fs2::FileExt::unlock(&file);
                }
                return Ok((Self::session(file, flags), false));
            }
        }

        // Saint mode bypasses the GET and reuses whatever body exists.
        if grace == GraceLevel::Saint {
            if let Some(entry) = &entry {
                tracing::warn!("open: saint mode, reusing cached body for {path}");
                let file = self.open_body(entry, flags)?;
                return Ok((Self::session(file, flags), false));
            }
            return Err(DavError::NotFound(format!(
                "{path}: no cached body under saint mode"
            )));
        }

        match self.fetch_fresh(path, entry.as_ref(), flags) {
            Ok(session) => Ok((session, false)),
            // A 404 is a definitive answer, not a failure to fall back from.
            Err(err @ DavError::NotFound(_)) => Err(err),
            Err(err) => {
                if grace == GraceLevel::Retry {
                    if let Some(entry) = &entry {
                        tracing::warn!("open: serving stale body for {path} after: {err}");
                        let file = self.open_body(entry, flags)?;
                        return Ok((Self::session(file, flags), true));
                    }
                }
                Err(err)
            }
        }
    }

    /// The cache-or-fetch state machine: issue a conditional GET and end
    /// up with an open body file that matches the server.
    fn fetch_fresh(
        &self,
        path: &str,
        entry: Option<&FileEntry>,
        flags: OpenFlags,
    ) -> DavResult<Session> {
        let known_etag = entry.map(|e| e.etag.as_str()).filter(|tag| !tag.is_empty());

        match self.transport.get_if_none_match(path, known_etag)? {
            GetOutcome::NotModified => {
                let entry = entry.ok_or_else(|| {
                    DavError::io(format!("{path}: 304 without a stored entity tag"))
                })?;
                let mut refreshed = entry.clone();
                refreshed.last_server_update = unix_time();
                self.put_entry(path, &refreshed)?;
                tracing::debug!("open: revalidated {path} (etag {})", refreshed.etag);
                let file = self.open_body(&refreshed, flags)?;
                Ok(Self::session(file, flags))
            }
            GetOutcome::Modified { mut body, etag } => {
                let (mut file, body_path) = self.new_body_file()?;
                std::io::copy(&mut body, &mut file)?;
                self.put_entry(
                    path,
                    &FileEntry {
                        body_file: body_path,
                        etag: clamp_etag(etag),
                        last_server_update: unix_time(),
                    },
                )?;
                // The record no longer references the old body; open
                // descriptors keep it alive until they close.
                if let Some(old) = entry {
                    let _ = fs::remove_file(&old.body_file);
                }
                Ok(Self::session(file, flags))
            }
        }
    }

    /// Pushes local changes back to the server and refreshes the record.
    /// Concurrent syncs on the same body serialize on the advisory lock.
    pub fn sync(&self, path: &str, session: &mut Session, do_put: bool) -> DavResult<()> {
        session.file.lock_exclusive()?;
        let result = self.sync_locked(path, session, do_put);
        let _ = fs2::FileExt::unlock(&session.file);
        result
    }

    fn sync_locked(&self, path: &str, session: &mut Session, do_put: bool) -> DavResult<()> {
        if !session.writable {
            return Ok(());
        }

        let mut entry = self.entry(path)?;

        if do_put {
            if !session.modified {
                return Ok(());
            }
            let entry = entry
                .as_mut()
                .ok_or_else(|| DavError::NotFound(format!("{path}: file entry missing")))?;

            let mut body = session.file.try_clone()?;
            body.seek(SeekFrom::Start(0))?;
            let len = body.metadata()?.len();
            let etag = self.transport.put(path, body, len)?;
            entry.etag = clamp_etag(etag);
            session.modified = false;
        } else if let Some(entry) = entry.as_mut() {
            // The body may have diverged without being pushed; the stored
            // tag can no longer vouch for it.
            entry.etag.clear();
        }

        if let Some(entry) = entry.as_mut() {
            entry.last_server_update = unix_time();
            self.put_entry(path, entry)?;
        }
        Ok(())
    }

    /// Closes the session's descriptor.
    pub fn close(&self, session: Session) {
        drop(session);
    }

    /// Reassigns the file entry to a new key, refreshing its revalidation
    /// timestamp. The body file itself stays put. Nothing to move is fine:
    /// the file was simply never cached.
    pub fn pdata_move(&self, old_path: &str, new_path: &str) -> DavResult<()> {
        let Some(mut entry) = self.entry(old_path)? else {
            tracing::debug!("pdata_move: no entry for {old_path}");
            return Ok(());
        };
        entry.last_server_update = unix_time();
        self.put_entry(new_path, &entry)?;
        self.kv.delete(&Self::key(old_path))?;
        Ok(())
    }

    /// Removes the file entry, optionally unlinking the body file.
    pub fn delete(&self, path: &str, unlink_body: bool) -> DavResult<()> {
        if unlink_body {
            if let Some(entry) = self.entry(path)? {
                let _ = fs::remove_file(&entry.body_file);
            }
        }
        self.kv.delete(&Self::key(path))
    }

    /// Reconciliation sweep, run at startup and then daily.
    ///
    /// Pass one walks the records: a record whose body file is gone is
    /// dropped; a record past the age-out threshold is dropped along with
    /// its body; everything else gets its body's mtime touched to now.
    /// Pass two walks the body directory: any file whose mtime predates
    /// the sweep was not referenced by pass one and is an orphan.
    pub fn cleanup(&self, first_pass: bool) -> DavResult<()> {
        let start = unix_time();
        let mut visited = 0usize;
        let mut pruned = 0usize;
        let mut aged_out = 0usize;

        let mut records = Vec::new();
        for item in self.kv.scan_prefix(FILECACHE_PREFIX.as_bytes()) {
            let (key, raw) = item?;
            let entry: FileEntry = bincode::deserialize(&raw)?;
            records.push((key, entry));
        }

        for (key, entry) in records {
            visited += 1;
            if !entry.body_file.exists() {
                self.kv.delete(&key)?;
                pruned += 1;
            } else if start.saturating_sub(entry.last_server_update) > self.age_out_threshold {
                self.kv.delete(&key)?;
                let _ = fs::remove_file(&entry.body_file);
                aged_out += 1;
            } else if let Err(err) = touch(&entry.body_file) {
                tracing::warn!("cleanup: failed to touch {:?}: {err}", entry.body_file);
            }
        }

        let mut orphans = 0usize;
        for dirent in fs::read_dir(&self.files_dir)? {
            let path = dirent?.path();
            if path.is_dir() {
                continue;
            }
            let mtime = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            if mtime < start {
                let _ = fs::remove_file(&path);
                orphans += 1;
            }
        }

        tracing::info!(
            "file cache cleanup{}: visited {visited}, pruned {pruned}, aged out {aged_out}, \
             removed {orphans} orphans",
            if first_pass { " (startup)" } else { "" }
        );
        Ok(())
    }
}

/// Bounds a stored entity tag to the fixed field size.
fn clamp_etag(mut etag: String) -> String {
    if etag.len() > ETAG_MAX {
        let mut cut = ETAG_MAX;
        while !etag.is_char_boundary(cut) {
            cut -= 1;
        }
        etag.truncate(cut);
    }
    etag
}

/// Sets a file's access and modification times to now, as utime(2) with a
/// null argument does.
fn touch(path: &Path) -> std::io::Result<()> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let rc = unsafe { libc::utime(cpath.as_ptr(), std::ptr::null()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
