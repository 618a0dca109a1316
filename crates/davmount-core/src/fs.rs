//! Filesystem operations over the two caches.
//!
//! Every operation mirrors a kernel callback: paths are normalized into
//! the internal escaped form on entry, the stat cache answers attribute
//! and listing questions (refreshing directories from the server when
//! stale), and content operations go through the file cache. Descriptor
//! operations accept a missing path — the inode was unlinked while a
//! descriptor stayed open — and complete against the session alone.

use std::sync::Arc;

use crate::constants::CLOCK_SKEW_SECS;
use crate::errors::{DavError, DavResult};
use crate::path;
use crate::saint::SaintMode;
use crate::stats::{bump, OpStats};
use crate::store::file_cache::{FileCache, GraceLevel, OpenFlags, Session};
use crate::store::stat_cache::{EnumerateOutcome, Lookup, StatCache, StatEntry};
use crate::util::unix_time;
use crate::webdav::{DavTransport, Depth, MoveOutcome, PropfindOutcome};

#[derive(Debug, Clone, Default)]
pub struct FsOptions {
    pub progressive_propfind: bool,
    pub refresh_dir_for_file_stat: bool,
    pub grace: bool,
}

pub struct DavFs {
    options: FsOptions,
    /// Unescaped base directory under the server root.
    base_dir: String,
    /// Escaped form, what normalized paths compare against.
    base_escaped: String,
    transport: Arc<dyn DavTransport>,
    stat_cache: Arc<StatCache>,
    file_cache: Arc<FileCache>,
    saint: SaintMode,
    pub stats: OpStats,
}

impl DavFs {
    pub fn new(
        options: FsOptions,
        base_dir: String,
        transport: Arc<dyn DavTransport>,
        stat_cache: Arc<StatCache>,
        file_cache: Arc<FileCache>,
        saint: SaintMode,
    ) -> Self {
        let base_escaped = path::escape(&base_dir);
        Self {
            options,
            base_dir,
            base_escaped,
            transport,
            stat_cache,
            file_cache,
            saint,
            stats: OpStats::new(),
        }
    }

    pub fn saint(&self) -> &SaintMode {
        &self.saint
    }

    fn path_cvt(&self, path: &str) -> String {
        path::convert(&self.base_dir, path)
    }

    fn grace_active(&self) -> bool {
        self.options.grace && self.saint.active()
    }

    /// Listing callback: 410 means the child is gone, anything else is an
    /// upsert.
    fn apply_listing_entry(&self, entry_path: &str, st: StatEntry, status: u16) {
        let result = if status == 410 {
            tracing::debug!("listing: removing {entry_path}");
            self.stat_cache.delete(entry_path)
        } else {
            self.stat_cache.set(entry_path, &st)
        };
        if let Err(err) = result {
            tracing::warn!("listing callback failed for {entry_path}: {err}");
        }
    }

    /// Refreshes a directory's children, progressively when permitted and
    /// falling back to a full listing with generation-based pruning.
    fn update_directory(&self, dir: &str, attempt_progressive: bool) -> DavResult<()> {
        let mut needs_full = true;
        let mut refresh_started = unix_time();

        if attempt_progressive && self.options.progressive_propfind {
            let last_updated = self.stat_cache.read_children_updated(dir)?;
            let window = last_updated.saturating_sub(CLOCK_SKEW_SECS);
            tracing::debug!("freshening directory: {dir}?changes_since={window}");
            let outcome = self.transport.propfind(
                dir,
                Depth::One,
                Some(window),
                &mut |p, st, status| self.apply_listing_entry(p, st, status),
            );
            match outcome {
                Ok(PropfindOutcome::Complete) => needs_full = false,
                Ok(PropfindOutcome::StaleWindow) => {
                    tracing::debug!("windowed listing of {dir} rejected as stale");
                }
                Err(err) => {
                    return Err(DavError::io(format!(
                        "update_directory: windowed listing of {dir} failed: {err}"
                    )))
                }
            }
        }

        if needs_full {
            tracing::info!("doing complete listing: {dir}");
            refresh_started = unix_time();
            let min_generation = self.stat_cache.local_generation();
            self.transport
                .propfind(dir, Depth::One, None, &mut |p, st, status| {
                    self.apply_listing_entry(p, st, status)
                })
                .map_err(|err| {
                    DavError::io(format!(
                        "update_directory: complete listing of {dir} failed: {err}"
                    ))
                })?;
            self.stat_cache.delete_older(dir, min_generation)?;
        }

        self.stat_cache
            .write_children_updated(dir, refresh_started)?;
        Ok(())
    }

    pub fn readdir(&self, dir: &str, filler: &mut dyn FnMut(&str)) -> DavResult<()> {
        bump(&self.stats.readdir);
        let dir = self.path_cvt(dir);
        tracing::debug!("readdir({dir})");

        filler(".");
        filler("..");

        let ignore_freshness = self.grace_active();
        let outcome = self.enumerate_into(&dir, filler, ignore_freshness)?;
        if outcome == EnumerateOutcome::Done {
            return Ok(());
        }

        tracing::debug!(
            "directory cache {}: {dir}",
            if outcome == EnumerateOutcome::TooOld {
                "too old"
            } else {
                "empty"
            }
        );
        if let Err(err) = self.update_directory(&dir, outcome == EnumerateOutcome::TooOld) {
            if !self.options.grace {
                return Err(err);
            }
            tracing::warn!("failed to update {dir}, serving stale listing: {err}");
            self.saint.trip();
        }

        self.enumerate_into(&dir, filler, true)?;
        Ok(())
    }

    fn enumerate_into(
        &self,
        dir: &str,
        filler: &mut dyn FnMut(&str),
        ignore_freshness: bool,
    ) -> DavResult<EnumerateOutcome> {
        self.stat_cache.enumerate(
            dir,
            |name| filler(&path::unescape(name)),
            ignore_freshness,
        )
    }

    /// Cache lookup with miss-as-expired semantics: a stale or absent
    /// entry is `KeyExpired` (the caller refreshes and retries), unless
    /// freshness was already being ignored, in which case there is nothing
    /// further to try and the answer is `NotFound`.
    fn get_stat_from_cache(&self, path: &str, ignore_freshness: bool) -> DavResult<StatEntry> {
        match self.stat_cache.get(path, ignore_freshness)? {
            Lookup::Hit(st) => Ok(st),
            Lookup::Negative => Err(DavError::NotFound(path.to_string())),
            Lookup::Expired | Lookup::Absent => {
                if ignore_freshness {
                    Err(DavError::NotFound(path.to_string()))
                } else {
                    Err(DavError::KeyExpired(path.to_string()))
                }
            }
        }
    }

    /// Attribute lookup on a normalized path.
    fn get_stat(&self, path: &str) -> DavResult<StatEntry> {
        if path == self.base_escaped {
            return Ok(StatEntry::generic(0, true, None));
        }

        match self.get_stat_from_cache(path, self.grace_active()) {
            Err(DavError::KeyExpired(_)) => {}
            other => return other,
        }
        tracing::debug!("stat cache miss: {path}");

        if !self.options.refresh_dir_for_file_stat {
            // Single zero-depth lookup on the path itself.
            let outcome = self.transport.propfind(
                path,
                Depth::Zero,
                None,
                &mut |p, st, status| self.apply_listing_entry(p, st, status),
            );
            match outcome {
                Ok(_) => {}
                Err(DavError::NotFound(_)) => {
                    self.stat_cache.set_negative(path)?;
                    return Err(DavError::NotFound(path.to_string()));
                }
                Err(err) => {
                    let _ = self.stat_cache.delete(path);
                    return Err(err);
                }
            }
            return self.get_stat_from_cache(path, true);
        }

        // Refresh the parent directory to refresh the file's stat.
        let parent = path::parent(path);
        let parent_updated = self.stat_cache.read_children_updated(parent)?;
        if parent_updated + self.stat_cache.negative_ttl() < unix_time() {
            // A zero timestamp means the parent has never been listed, so
            // a windowed refresh has nothing to stand on.
            if let Err(err) = self.update_directory(parent, parent_updated > 0) {
                if !self.options.grace || !matches!(err, DavError::Io(_)) {
                    return Err(err);
                }
                tracing::warn!("get_stat: recovering with grace from {err} on {path}");
                self.saint.trip();
            }
        }
        self.get_stat_from_cache(path, true)
    }

    pub fn getattr(&self, path: &str) -> DavResult<StatEntry> {
        bump(&self.stats.getattr);
        let path = self.path_cvt(path);
        tracing::debug!("getattr({path})");
        self.get_stat(&path)
    }

    /// Descriptor-backed getattr; with no path the size comes from the
    /// open body file.
    pub fn fgetattr(&self, path: Option<&str>, session: Option<&Session>) -> DavResult<StatEntry> {
        bump(&self.stats.fgetattr);
        match path {
            Some(p) => {
                let p = self.path_cvt(p);
                self.get_stat(&p)
            }
            None => Ok(StatEntry::generic(0, false, session.map(|s| s.file()))),
        }
    }

    pub fn mknod(&self, path: &str, mode: u32) -> DavResult<StatEntry> {
        bump(&self.stats.mknod);
        let path = self.path_cvt(path);
        tracing::debug!("mknod({path})");
        let st = StatEntry::generic(mode, false, None);
        self.stat_cache.set(&path, &st)?;
        Ok(st)
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> DavResult<StatEntry> {
        bump(&self.stats.mkdir);
        let path = self.path_cvt(path);
        tracing::debug!("mkdir({path})");
        self.transport.mkcol(&format!("{path}/"))?;
        let st = StatEntry::generic(mode, true, None);
        self.stat_cache.set(&path, &st)?;
        Ok(st)
    }

    pub fn unlink(&self, path: &str) -> DavResult<()> {
        bump(&self.stats.unlink);
        let path = self.path_cvt(path);
        tracing::debug!("unlink({path})");

        let st = self.get_stat(&path)?;
        if !st.is_reg() {
            return Err(DavError::IsDirectory(path));
        }

        self.transport.delete(&path)?;
        self.file_cache.delete(&path, true)?;
        self.stat_cache.delete(&path)?;
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> DavResult<()> {
        bump(&self.stats.rmdir);
        let path = self.path_cvt(path);
        tracing::debug!("rmdir({path})");

        let st = self.get_stat(&path)?;
        if !st.is_dir() {
            return Err(DavError::NotDirectory(path));
        }
        if self.stat_cache.dir_has_child(&path)? {
            return Err(DavError::NotEmpty(path));
        }

        self.transport.delete(&format!("{path}/"))?;
        self.stat_cache.delete(&path)?;
        self.stat_cache.write_children_updated(&path, 0)?;
        Ok(())
    }

    pub fn rename(&self, from: &str, to: &str) -> DavResult<()> {
        bump(&self.stats.rename);
        let from = self.path_cvt(from);
        let to = self.path_cvt(to);
        tracing::debug!("rename({from}, {to})");

        let st = self.get_stat(&from)?;
        let source = if st.is_dir() {
            format!("{from}/")
        } else {
            from.clone()
        };

        let server_moved = match self.transport.mov(&source, &to)? {
            MoveOutcome::Moved => true,
            MoveOutcome::ServerLostSource => {
                // The file may never have reached the server (renamed while
                // open); the local move still has to happen.
                tracing::info!("rename: server lost {from}, completing locally");
                false
            }
        };

        match self.rename_local(&from, &to) {
            Ok(()) => Ok(()),
            Err(err) if server_moved => {
                tracing::warn!("rename: local move of {from} failed after server move: {err}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn rename_local(&self, from: &str, to: &str) -> DavResult<()> {
        let entry = match self.stat_cache.get(from, true)? {
            Lookup::Hit(st) => st,
            _ => return Err(DavError::NotFound(from.to_string())),
        };
        self.stat_cache.set(to, &entry)?;
        self.stat_cache.delete(from)?;
        if let Err(err) = self.file_cache.pdata_move(from, to) {
            // Scrap the destination entry rather than leave mixed state.
            let _ = self.file_cache.delete(to, true);
            return Err(err);
        }
        Ok(())
    }

    fn grace_level(&self) -> GraceLevel {
        if !self.options.grace {
            GraceLevel::None
        } else if self.saint.active() {
            GraceLevel::Saint
        } else {
            GraceLevel::Retry
        }
    }

    fn do_open(&self, path: &str, flags: OpenFlags) -> DavResult<Session> {
        let (session, used_grace) = self.file_cache.open(path, flags, self.grace_level())?;
        if used_grace {
            self.saint.trip();
        }

        // A brand-new file has no stat entry yet; give it one.
        if matches!(
            self.stat_cache.get(path, false)?,
            Lookup::Absent | Lookup::Expired
        ) {
            let st = StatEntry::generic(0, false, None);
            self.stat_cache.set(path, &st)?;
        }
        Ok(session)
    }

    pub fn create(&self, path: &str, _mode: u32, flags: i32) -> DavResult<Session> {
        bump(&self.stats.create);
        let path = self.path_cvt(path);
        tracing::debug!("create({path})");

        let mut open_flags = OpenFlags::from_bits(flags).promote_write_only();
        open_flags.create = true;
        open_flags.truncate = true;

        let mut session = self.do_open(&path, open_flags)?;
        self.file_cache.sync(&path, &mut session, false)?;
        self.refresh_stat_from_session(&path, &session)?;
        Ok(session)
    }

    pub fn open(&self, path: &str, flags: i32) -> DavResult<Session> {
        bump(&self.stats.open);
        let path = self.path_cvt(path);
        let open_flags = OpenFlags::from_bits(flags).promote_write_only();
        tracing::debug!("open({path}, {open_flags:?})");
        self.do_open(&path, open_flags)
    }

    pub fn read(
        &self,
        path: Option<&str>,
        session: &Session,
        buf: &mut [u8],
        offset: u64,
    ) -> DavResult<usize> {
        bump(&self.stats.read);
        tracing::trace!("read({}, {offset})", path.unwrap_or("null path"));
        session.read(buf, offset)
    }

    pub fn write(
        &self,
        path: Option<&str>,
        session: &mut Session,
        buf: &[u8],
        offset: u64,
    ) -> DavResult<usize> {
        bump(&self.stats.write);
        tracing::trace!("write({}, {offset})", path.unwrap_or("null path"));

        let written = session.write(buf, offset)?;
        if let Some(p) = path {
            let p = self.path_cvt(p);
            self.file_cache.sync(&p, session, false)?;
            self.refresh_stat_from_session(&p, session)?;
        }
        Ok(written)
    }

    pub fn ftruncate(
        &self,
        path: Option<&str>,
        session: &mut Session,
        size: u64,
    ) -> DavResult<()> {
        bump(&self.stats.ftruncate);
        session.truncate(size)?;
        if let Some(p) = path {
            let p = self.path_cvt(p);
            self.file_cache.sync(&p, session, false)?;
            self.refresh_stat_from_session(&p, session)?;
        }
        Ok(())
    }

    pub fn flush(&self, path: Option<&str>, session: &mut Session) -> DavResult<()> {
        bump(&self.stats.flush);
        tracing::debug!("flush({})", path.unwrap_or("null path"));
        if let Some(p) = path {
            let p = self.path_cvt(p);
            self.file_cache.sync(&p, session, true)?;
            self.refresh_stat_from_session(&p, session)?;
        }
        Ok(())
    }

    pub fn fsync(&self, path: Option<&str>, session: &mut Session) -> DavResult<()> {
        bump(&self.stats.fsync);
        tracing::debug!("fsync({})", path.unwrap_or("null path"));
        match path {
            Some(p) => {
                let p = self.path_cvt(p);
                self.file_cache.sync(&p, session, true)?;
                self.refresh_stat_from_session(&p, session)?;
            }
            None => {
                // No path to PUT to; make the local body durable at least.
                session.file().sync_all()?;
            }
        }
        Ok(())
    }

    /// Final sync for a closing descriptor. The caller drops the session
    /// (closing the body descriptor) afterwards, error or not.
    pub fn release(&self, path: Option<&str>, session: &mut Session) -> DavResult<()> {
        bump(&self.stats.release);
        tracing::debug!("release({})", path.unwrap_or("null path"));
        if let Some(p) = path {
            let p = self.path_cvt(p);
            self.file_cache.sync(&p, session, true)?;
            self.refresh_stat_from_session(&p, session)?;
        }
        Ok(())
    }

    fn refresh_stat_from_session(&self, path: &str, session: &Session) -> DavResult<()> {
        let st = StatEntry::generic(0, false, Some(session.file()));
        self.stat_cache.set(path, &st)
    }

    /// Cache-only probe for directory-entry typing; never contacts the
    /// server.
    pub fn cached_is_dir(&self, path: &str) -> Option<bool> {
        let path = self.path_cvt(path);
        match self.stat_cache.get(&path, true) {
            Ok(Lookup::Hit(st)) => Some(st.is_dir()),
            _ => None,
        }
    }

    pub fn chmod(&self, path: &str, _mode: u32) -> DavResult<()> {
        bump(&self.stats.chmod);
        tracing::debug!("chmod({path}) ignored");
        Ok(())
    }

    pub fn chown(&self, path: &str, _uid: u32, _gid: u32) -> DavResult<()> {
        bump(&self.stats.chown);
        tracing::debug!("chown({path}) ignored");
        Ok(())
    }

    pub fn utimens(&self, path: &str) -> DavResult<()> {
        bump(&self.stats.utimens);
        tracing::debug!("utimens({path}) ignored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::KvStore;
    use crate::webdav::mock::MockTransport;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        transport: Arc<MockTransport>,
        stat_cache: Arc<StatCache>,
        file_cache: Arc<FileCache>,
        fs: DavFs,
    }

    fn harness(options: FsOptions) -> Harness {
        harness_full(options, Duration::from_secs(10), 60)
    }

    fn harness_with(options: FsOptions, saint_window: Duration) -> Harness {
        harness_full(options, saint_window, 60)
    }

    fn harness_full(options: FsOptions, saint_window: Duration, refresh_interval: u64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(KvStore::open(&dir.path().join("db")).unwrap());
        let transport = Arc::new(MockTransport::new());
        let stat_cache = Arc::new(StatCache::with_windows(kv.clone(), 3, 1_209_600));
        let file_cache = Arc::new(
            FileCache::with_windows(
                kv,
                &dir.path().join("cache"),
                transport.clone(),
                refresh_interval,
                691_200,
            )
            .unwrap(),
        );
        let fs = DavFs::new(
            options,
            "/".to_string(),
            transport.clone(),
            stat_cache.clone(),
            file_cache.clone(),
            SaintMode::new(saint_window),
        );
        Harness {
            _dir: dir,
            transport,
            stat_cache,
            file_cache,
            fs,
        }
    }

    fn dir_entry() -> StatEntry {
        StatEntry::generic(0o770, true, None)
    }

    fn file_entry() -> StatEntry {
        StatEntry::generic(0o660, false, None)
    }

    fn listing_of(dir: &str, children: &[&str]) -> Vec<(String, StatEntry, u16)> {
        let mut entries = vec![(dir.to_string(), dir_entry(), 200)];
        for child in children {
            entries.push((format!("{dir}/{child}"), file_entry(), 200));
        }
        entries
    }

    /// Makes a cached body look long-unrevalidated so a reopen must hit
    /// the server (or lean on grace).
    fn backdate_entry(h: &Harness, path: &str) {
        let mut entry = h.file_cache.entry(path).unwrap().unwrap();
        entry.last_server_update = entry.last_server_update.saturating_sub(100);
        h.file_cache.put_entry(path, &entry).unwrap();
    }

    fn read_names(fs: &DavFs, dir: &str) -> Vec<String> {
        let mut names = Vec::new();
        fs.readdir(dir, &mut |name| names.push(name.to_string()))
            .unwrap();
        names
    }

    #[test]
    fn readdir_lists_and_then_trusts_the_cache() {
        let h = harness(FsOptions::default());
        h.transport.set_listing("/d", listing_of("/d", &["x", "y"]));

        assert_eq!(read_names(&h.fs, "/d"), vec![".", "..", "x", "y"]);
        assert_eq!(h.transport.listing_count(), 1);

        // Fresh: the second listing is served from the cache.
        assert_eq!(read_names(&h.fs, "/d"), vec![".", "..", "x", "y"]);
        assert_eq!(h.transport.listing_count(), 1);
    }

    #[test]
    fn consecutive_listings_of_unchanged_directory_agree() {
        let h = harness(FsOptions::default());
        h.transport.set_listing("/d", listing_of("/d", &["a", "b"]));
        let first = read_names(&h.fs, "/d");
        h.stat_cache.write_children_updated("/d", 0).unwrap();
        let second = read_names(&h.fs, "/d");
        assert_eq!(first, second);
    }

    #[test]
    fn stale_directory_uses_a_windowed_listing_when_enabled() {
        let h = harness(FsOptions {
            progressive_propfind: true,
            ..Default::default()
        });
        h.transport.set_listing("/d", listing_of("/d", &["x"]));

        read_names(&h.fs, "/d");
        // Backdate so the next readdir sees stale (not absent) data.
        h.stat_cache
            .write_children_updated("/d", unix_time() - 100)
            .unwrap();
        read_names(&h.fs, "/d");

        let calls = h.transport.calls();
        assert_eq!(calls[0], "PROPFIND /d full");
        assert_eq!(calls[1], "PROPFIND /d windowed");
    }

    #[test]
    fn rejected_window_falls_back_to_a_full_listing() {
        let h = harness(FsOptions {
            progressive_propfind: true,
            ..Default::default()
        });
        h.transport.set_listing("/d", listing_of("/d", &["x"]));
        read_names(&h.fs, "/d");

        h.transport.set_stale_window(true);
        h.stat_cache
            .write_children_updated("/d", unix_time() - 100)
            .unwrap();
        read_names(&h.fs, "/d");

        let calls = h.transport.calls();
        assert_eq!(
            &calls[1..],
            &["PROPFIND /d windowed".to_string(), "PROPFIND /d full".to_string()]
        );
    }

    #[test]
    fn full_refresh_prunes_entries_the_server_dropped() {
        let h = harness(FsOptions::default());
        h.transport.set_listing("/d", listing_of("/d", &["x", "y"]));
        read_names(&h.fs, "/d");

        h.transport.set_listing("/d", listing_of("/d", &["y"]));
        h.stat_cache.write_children_updated("/d", 0).unwrap();
        assert_eq!(read_names(&h.fs, "/d"), vec![".", "..", "y"]);
    }

    #[test]
    fn listing_failure_with_grace_serves_stale_data_and_trips_saint_mode() {
        let h = harness_with(
            FsOptions {
                grace: true,
                ..Default::default()
            },
            Duration::from_millis(60),
        );
        h.transport.set_listing("/d", listing_of("/d", &["x", "y"]));
        read_names(&h.fs, "/d");

        h.transport.fail_listings(true);
        h.stat_cache.write_children_updated("/d", 0).unwrap();

        // Failure, but the stale children set still comes back.
        assert_eq!(read_names(&h.fs, "/d"), vec![".", "..", "x", "y"]);
        assert!(h.fs.saint().active());
        let after_failure = h.transport.listing_count();

        // While the window is open no listing is attempted.
        assert_eq!(read_names(&h.fs, "/d"), vec![".", "..", "x", "y"]);
        assert_eq!(h.transport.listing_count(), after_failure);

        // Once it lapses the server is tried again.
        std::thread::sleep(Duration::from_millis(80));
        read_names(&h.fs, "/d");
        assert!(h.transport.listing_count() > after_failure);
    }

    #[test]
    fn listing_failure_without_grace_is_an_error() {
        let h = harness(FsOptions::default());
        h.transport.fail_listings(true);
        let err = h
            .fs
            .readdir("/d", &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, DavError::Io(_)));
    }

    #[test]
    fn getattr_of_base_directory_is_synthesized() {
        let h = harness(FsOptions::default());
        let st = h.fs.getattr("/").unwrap();
        assert!(st.is_dir());
        assert!(h.transport.calls().is_empty());
    }

    #[test]
    fn getattr_refreshes_the_parent_directory() {
        let h = harness(FsOptions {
            refresh_dir_for_file_stat: true,
            ..Default::default()
        });
        h.transport.set_listing("/d", listing_of("/d", &["x"]));

        let st = h.fs.getattr("/d/x").unwrap();
        assert!(st.is_reg());
        assert_eq!(h.transport.calls(), vec!["PROPFIND /d full".to_string()]);

        // Fresh parent: the next lookup is pure cache.
        h.fs.getattr("/d/x").unwrap();
        assert_eq!(h.transport.listing_count(), 1);
    }

    #[test]
    fn getattr_missing_after_refresh_is_not_found() {
        let h = harness(FsOptions {
            refresh_dir_for_file_stat: true,
            ..Default::default()
        });
        h.transport.set_listing("/d", listing_of("/d", &["x"]));
        let err = h.fs.getattr("/d/ghost").unwrap_err();
        assert!(matches!(err, DavError::NotFound(_)));
    }

    #[test]
    fn getattr_uses_zero_depth_lookup_when_parent_refresh_is_off() {
        let h = harness(FsOptions::default());
        h.transport
            .set_listing("/f.txt", vec![("/f.txt".to_string(), file_entry(), 200)]);

        let st = h.fs.getattr("/f.txt").unwrap();
        assert!(st.is_reg());
        assert_eq!(h.transport.calls(), vec!["PROPFIND /f.txt depth0".to_string()]);
    }

    #[test]
    fn missing_path_is_cached_as_a_negative_entry() {
        let h = harness(FsOptions::default());
        h.stat_cache
            .write_children_updated("/", unix_time())
            .unwrap();

        assert!(matches!(
            h.fs.getattr("/ghost").unwrap_err(),
            DavError::NotFound(_)
        ));
        let lookups = h.transport.calls().len();

        // The negative entry answers while the parent stays fresh.
        assert!(matches!(
            h.fs.getattr("/ghost").unwrap_err(),
            DavError::NotFound(_)
        ));
        assert_eq!(h.transport.calls().len(), lookups);
    }

    #[test]
    fn write_then_read_roundtrip_with_put_on_flush() {
        let h = harness(FsOptions::default());
        h.transport.set_put_etag("tag-1");

        let mut session = h.fs.create("/a.txt", 0o644, libc::O_RDWR).unwrap();
        h.fs.write(Some("/a.txt"), &mut session, b"hello", 0).unwrap();
        h.fs.flush(Some("/a.txt"), &mut session).unwrap();
        h.fs.release(Some("/a.txt"), &mut session).unwrap();
        h.file_cache.close(session);

        assert_eq!(h.transport.put_bodies("/a.txt"), vec![b"hello".to_vec()]);
        assert_eq!(h.file_cache.entry("/a.txt").unwrap().unwrap().etag, "tag-1");

        // Within the refresh window the reopen issues no GET.
        let gets_before = h
            .transport
            .calls()
            .iter()
            .filter(|c| c.starts_with("GET"))
            .count();
        let session = h.fs.open("/a.txt", libc::O_RDONLY).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(h.fs.read(Some("/a.txt"), &session, &mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        let gets_after = h
            .transport
            .calls()
            .iter()
            .filter(|c| c.starts_with("GET"))
            .count();
        assert_eq!(gets_before, gets_after);

        // The stat entry tracks the written size.
        h.stat_cache
            .write_children_updated("/", unix_time())
            .unwrap();
        let st = h.fs.getattr("/a.txt").unwrap();
        assert_eq!(st.size, 5);
    }

    #[test]
    fn second_flush_without_writes_is_a_no_op() {
        let h = harness(FsOptions::default());
        h.transport.set_put_etag("tag-1");
        let mut session = h.fs.create("/a.txt", 0o644, libc::O_RDWR).unwrap();
        h.fs.write(Some("/a.txt"), &mut session, b"data", 0).unwrap();
        h.fs.flush(Some("/a.txt"), &mut session).unwrap();
        h.fs.flush(Some("/a.txt"), &mut session).unwrap();
        assert_eq!(h.transport.put_bodies("/a.txt").len(), 1);
    }

    #[test]
    fn unlink_deletes_on_the_server_and_in_both_caches() {
        let h = harness(FsOptions::default());
        h.transport.set_put_etag("t");
        let mut session = h.fs.create("/a.txt", 0o644, libc::O_RDWR).unwrap();
        h.fs.release(Some("/a.txt"), &mut session).unwrap();
        h.file_cache.close(session);

        h.stat_cache
            .write_children_updated("/", unix_time())
            .unwrap();
        h.fs.unlink("/a.txt").unwrap();

        assert!(h
            .transport
            .calls()
            .contains(&"DELETE /a.txt".to_string()));
        assert!(h.file_cache.entry("/a.txt").unwrap().is_none());
        assert!(matches!(
            h.fs.getattr("/a.txt").unwrap_err(),
            DavError::NotFound(_)
        ));
    }

    #[test]
    fn unlink_of_a_directory_is_rejected() {
        let h = harness(FsOptions::default());
        h.stat_cache.set("/d", &dir_entry()).unwrap();
        h.stat_cache
            .write_children_updated("/", unix_time())
            .unwrap();
        assert!(matches!(
            h.fs.unlink("/d").unwrap_err(),
            DavError::IsDirectory(_)
        ));
    }

    #[test]
    fn rmdir_refuses_a_populated_directory() {
        let h = harness(FsOptions::default());
        h.stat_cache.set("/d", &dir_entry()).unwrap();
        h.stat_cache.set("/d/child", &file_entry()).unwrap();
        h.stat_cache
            .write_children_updated("/", unix_time())
            .unwrap();

        assert!(matches!(
            h.fs.rmdir("/d").unwrap_err(),
            DavError::NotEmpty(_)
        ));
        // No server DELETE was issued.
        assert!(!h.transport.calls().iter().any(|c| c.starts_with("DELETE")));
    }

    #[test]
    fn rmdir_removes_an_empty_directory() {
        let h = harness(FsOptions::default());
        h.stat_cache.set("/d", &dir_entry()).unwrap();
        h.stat_cache
            .write_children_updated("/", unix_time())
            .unwrap();

        h.fs.rmdir("/d").unwrap();
        assert!(h.transport.calls().contains(&"DELETE /d/".to_string()));
        assert_eq!(h.stat_cache.read_children_updated("/d").unwrap(), 0);
    }

    #[test]
    fn mkdir_issues_mkcol_and_caches_the_stat() {
        let h = harness(FsOptions::default());
        h.fs.mkdir("/newdir", 0o770).unwrap();
        assert!(h.transport.calls().contains(&"MKCOL /newdir/".to_string()));
        assert!(matches!(
            h.stat_cache.get("/newdir", true).unwrap(),
            Lookup::Hit(st) if st.is_dir()
        ));
    }

    #[test]
    fn mkdir_then_rmdir_leaves_nothing_behind() {
        let h = harness(FsOptions::default());
        h.fs.mkdir("/d", 0o770).unwrap();
        h.stat_cache
            .write_children_updated("/", unix_time())
            .unwrap();
        h.fs.rmdir("/d").unwrap();
        h.stat_cache
            .write_children_updated("/", unix_time())
            .unwrap();
        assert!(matches!(
            h.fs.getattr("/d").unwrap_err(),
            DavError::NotFound(_)
        ));
    }

    #[test]
    fn rename_moves_both_cache_entries() {
        let h = harness(FsOptions::default());
        h.transport.set_put_etag("t");
        let mut session = h.fs.create("/a", 0o644, libc::O_RDWR).unwrap();
        h.fs.release(Some("/a"), &mut session).unwrap();
        h.file_cache.close(session);
        h.stat_cache
            .write_children_updated("/", unix_time())
            .unwrap();

        h.fs.rename("/a", "/b").unwrap();

        assert!(matches!(h.stat_cache.get("/b", true).unwrap(), Lookup::Hit(_)));
        assert!(matches!(h.stat_cache.get("/a", true).unwrap(), Lookup::Absent));
        assert!(h.file_cache.entry("/a").unwrap().is_none());
        assert!(h.file_cache.entry("/b").unwrap().is_some());
    }

    #[test]
    fn rename_survives_a_server_that_lost_the_source() {
        let h = harness(FsOptions::default());
        h.transport.set_move_outcome(MoveOutcome::ServerLostSource);
        h.transport.set_put_etag("t");
        let mut session = h.fs.create("/a", 0o644, libc::O_RDWR).unwrap();
        h.fs.release(Some("/a"), &mut session).unwrap();
        h.file_cache.close(session);
        h.stat_cache
            .write_children_updated("/", unix_time())
            .unwrap();

        h.fs.rename("/a", "/b").unwrap();
        assert!(matches!(h.stat_cache.get("/b", true).unwrap(), Lookup::Hit(_)));
        assert!(h.file_cache.entry("/b").unwrap().is_some());
    }

    #[test]
    fn rename_appends_a_slash_for_directories() {
        let h = harness(FsOptions::default());
        h.stat_cache.set("/d", &dir_entry()).unwrap();
        h.stat_cache
            .write_children_updated("/", unix_time())
            .unwrap();

        h.fs.rename("/d", "/e").unwrap();
        assert!(h.transport.calls().contains(&"MOVE /d/ -> /e".to_string()));
    }

    #[test]
    fn null_path_operations_complete_against_the_session() {
        let h = harness(FsOptions::default());
        let mut session = h.fs.create("/gone", 0o644, libc::O_RDWR).unwrap();
        h.fs.write(Some("/gone"), &mut session, b"payload", 0).unwrap();

        // As after an unlink: the kernel keeps the descriptor, drops the path.
        assert_eq!(
            h.fs.write(None, &mut session, b"more", 7).unwrap(),
            4
        );
        let mut buf = [0u8; 11];
        assert_eq!(h.fs.read(None, &session, &mut buf, 0).unwrap(), 11);
        assert_eq!(&buf, b"payloadmore");

        let st = h.fs.fgetattr(None, Some(&session)).unwrap();
        assert_eq!(st.size, 11);

        h.fs.fsync(None, &mut session).unwrap();
        h.fs.flush(None, &mut session).unwrap();
        h.fs.release(None, &mut session).unwrap();
    }

    #[test]
    fn attribute_mutations_are_accepted_and_ignored() {
        let h = harness(FsOptions::default());
        h.fs.chmod("/x", 0o600).unwrap();
        h.fs.chown("/x", 1, 1).unwrap();
        h.fs.utimens("/x").unwrap();
        assert!(h.transport.calls().is_empty());
    }

    #[test]
    fn saint_mode_opens_reuse_the_cached_body_without_a_get() {
        // Zero refresh interval: every reopen would normally revalidate.
        let h = harness_full(
            FsOptions {
                grace: true,
                ..Default::default()
            },
            Duration::from_secs(10),
            0,
        );
        h.transport.set_body("/f", b"cached", "v1");
        let session = h.fs.open("/f", libc::O_RDONLY).unwrap();
        h.file_cache.close(session);
        backdate_entry(&h, "/f");
        let calls_before = h.transport.calls().len();

        h.fs.saint().trip();
        let session = h.fs.open("/f", libc::O_RDONLY).unwrap();
        let mut buf = [0u8; 6];
        session.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"cached");
        assert_eq!(h.transport.calls().len(), calls_before);
    }

    #[test]
    fn failed_revalidation_under_grace_trips_the_controller() {
        let h = harness_full(
            FsOptions {
                grace: true,
                ..Default::default()
            },
            Duration::from_secs(10),
            0,
        );
        h.transport.set_body("/f", b"cached", "v1");
        let session = h.fs.open("/f", libc::O_RDONLY).unwrap();
        h.file_cache.close(session);
        backdate_entry(&h, "/f");

        h.transport.fail_gets(true);
        assert!(!h.fs.saint().active());
        let session = h.fs.open("/f", libc::O_RDONLY).unwrap();
        let mut buf = [0u8; 6];
        session.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"cached");
        assert!(h.fs.saint().active());
    }
}
