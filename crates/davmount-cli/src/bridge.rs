//! Kernel bridge: adapts fuser's inode-addressed callbacks onto the
//! path-based filesystem operations.
//!
//! State is three tables: inode <-> path (paths here are kernel-visible,
//! relative to the mountpoint), and open handles carrying the cache
//! session. Unlink removes the inode's path mapping while handles stay
//! alive, which is exactly how descriptor operations end up running with
//! no path. Requests are handed to a small worker pool so a slow server
//! round-trip never stalls the kernel session loop; `singlethread` keeps
//! everything inline for debugging.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use davmount_core::errors::DavError;
use davmount_core::path as dav_path;
use davmount_core::store::file_cache::Session;
use davmount_core::store::stat_cache::StatEntry;
use davmount_core::DavFs;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow, FUSE_ROOT_ID,
};
use parking_lot::Mutex;

const ATTR_TTL: Duration = Duration::from_secs(1);
const WORKER_THREADS: usize = 8;

struct InodeTable {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(FUSE_ROOT_ID, "/".to_string());
        by_path.insert("/".to_string(), FUSE_ROOT_ID);
        Self {
            by_ino,
            by_path,
            next: FUSE_ROOT_ID + 1,
        }
    }

    fn get(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).cloned()
    }

    fn assign(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.to_string());
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    fn remove_path(&mut self, path: &str) {
        if let Some(ino) = self.by_path.remove(path) {
            self.by_ino.remove(&ino);
        }
    }

    /// Remaps a path and everything under it, keeping inode numbers.
    fn rename(&mut self, from: &str, to: &str) {
        let prefix = format!("{from}/");
        let moved: Vec<(String, u64)> = self
            .by_path
            .iter()
            .filter(|(p, _)| p.as_str() == from || p.starts_with(&prefix))
            .map(|(p, i)| (p.clone(), *i))
            .collect();
        for (old, ino) in moved {
            let new = format!("{to}{}", &old[from.len()..]);
            self.by_path.remove(&old);
            self.by_path.insert(new.clone(), ino);
            self.by_ino.insert(ino, new);
        }
    }
}

struct Handle {
    ino: u64,
    session: Mutex<Session>,
}

struct BridgeState {
    inodes: Mutex<InodeTable>,
    handles: Mutex<HashMap<u64, Arc<Handle>>>,
    next_fh: AtomicU64,
}

impl BridgeState {
    fn handle_for(&self, fh: Option<u64>, ino: u64) -> Option<Arc<Handle>> {
        let handles = self.handles.lock();
        match fh {
            Some(fh) => handles.get(&fh).cloned(),
            None => handles.values().find(|h| h.ino == ino).cloned(),
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Fixed worker pool; zero workers means run the job on the caller.
struct Pool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Ok(Self {
                tx: None,
                workers: Vec::new(),
            });
        }
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let rx = rx.clone();
            let worker = std::thread::Builder::new()
                .name(format!("davmount-fuse-{idx}"))
                .spawn(move || loop {
                    let job = {
                        let guard = rx.lock();
                        guard.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })?;
            workers.push(worker);
        }
        Ok(Self {
            tx: Some(tx),
            workers,
        })
    }

    fn run(&self, job: impl FnOnce() + Send + 'static) {
        match &self.tx {
            Some(tx) => {
                if let Err(returned) = tx.send(Box::new(job)) {
                    (returned.0)();
                }
            }
            None => job(),
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

pub struct Bridge {
    fs: Arc<DavFs>,
    state: Arc<BridgeState>,
    pool: Pool,
}

impl Bridge {
    pub fn new(fs: Arc<DavFs>, singlethread: bool) -> Result<Self> {
        let pool = Pool::new(if singlethread { 0 } else { WORKER_THREADS })?;
        Ok(Self {
            fs,
            state: Arc::new(BridgeState {
                inodes: Mutex::new(InodeTable::new()),
                handles: Mutex::new(HashMap::new()),
                next_fh: AtomicU64::new(1),
            }),
            pool,
        })
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.state.inodes.lock().get(ino)
    }
}

fn join_path(parent: &str, name: &OsStr) -> String {
    let name = name.to_string_lossy();
    join_str(parent, &name)
}

fn join_str(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn system_time(secs: i64) -> SystemTime {
    if secs > 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
    }
}

fn attr_from(st: &StatEntry, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: st.size.max(0) as u64,
        blocks: st.blocks.max(0) as u64,
        atime: system_time(st.atime),
        mtime: system_time(st.mtime),
        ctime: system_time(st.ctime),
        crtime: system_time(st.ctime),
        kind: if st.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        },
        perm: (st.mode & 0o7777) as u16,
        nlink: st.nlink,
        uid: st.uid,
        gid: st.gid,
        rdev: 0,
        blksize: st.blksize,
        flags: 0,
    }
}

/// Logs the failure and yields the positive errno for the kernel reply.
/// Plain not-found is routine and stays at debug.
fn log_errno(err: &DavError, op: &str, path: &str) -> i32 {
    match err {
        DavError::NotFound(_) => tracing::debug!("{op} on {path}: {err}"),
        _ => tracing::warn!("{op} on {path}: {err}"),
    }
    -err.errno()
}

impl Filesystem for Bridge {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_path(&parent_path, name);
        let fs = self.fs.clone();
        let state = self.state.clone();
        self.pool.run(move || match fs.getattr(&path) {
            Ok(st) => {
                let ino = state.inodes.lock().assign(&path);
                reply.entry(&ATTR_TTL, &attr_from(&st, ino), 0);
            }
            Err(err) => reply.error(log_errno(&err, "lookup", &path)),
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let fs = self.fs.clone();
        match self.path_of(ino) {
            Some(path) => self.pool.run(move || match fs.getattr(&path) {
                Ok(st) => reply.attr(&ATTR_TTL, &attr_from(&st, ino)),
                Err(err) => reply.error(log_errno(&err, "getattr", &path)),
            }),
            None => {
                // Unlinked but still open: serve from any live handle.
                let Some(handle) = self.state.handle_for(None, ino) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                self.pool.run(move || {
                    let session = handle.session.lock();
                    match fs.fgetattr(None, Some(&session)) {
                        Ok(st) => reply.attr(&ATTR_TTL, &attr_from(&st, ino)),
                        Err(err) => reply.error(log_errno(&err, "getattr", "null path")),
                    }
                });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let fs = self.fs.clone();
        let path = self.path_of(ino);
        let handle = self.state.handle_for(fh, ino);
        self.pool.run(move || {
            if let Some(new_size) = size {
                let Some(handle) = handle.as_ref() else {
                    // Truncate without an open descriptor has no session to
                    // work through.
                    reply.error(libc::ENOSYS);
                    return;
                };
                let mut session = handle.session.lock();
                if let Err(err) = fs.ftruncate(path.as_deref(), &mut session, new_size) {
                    reply.error(log_errno(
                        &err,
                        "ftruncate",
                        path.as_deref().unwrap_or("null path"),
                    ));
                    return;
                }
            } else if let Some(p) = path.as_deref() {
                // Mode, ownership and timestamps are accepted and ignored.
                if let Some(m) = mode {
                    let _ = fs.chmod(p, m);
                }
                if uid.is_some() || gid.is_some() {
                    let _ = fs.chown(p, uid.unwrap_or(0), gid.unwrap_or(0));
                }
                if atime.is_some() || mtime.is_some() {
                    let _ = fs.utimens(p);
                }
            }

            let result = match (&handle, path.as_deref()) {
                (Some(handle), _) => {
                    let session = handle.session.lock();
                    fs.fgetattr(path.as_deref(), Some(&session))
                }
                (None, Some(p)) => fs.getattr(p),
                (None, None) => Err(DavError::NotFound("no path and no handle".into())),
            };
            match result {
                Ok(st) => reply.attr(&ATTR_TTL, &attr_from(&st, ino)),
                Err(err) => reply.error(log_errno(
                    &err,
                    "setattr",
                    path.as_deref().unwrap_or("null path"),
                )),
            }
        });
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_path(&parent_path, name);
        let fs = self.fs.clone();
        let state = self.state.clone();
        self.pool.run(move || match fs.mknod(&path, mode) {
            Ok(st) => {
                let ino = state.inodes.lock().assign(&path);
                reply.entry(&ATTR_TTL, &attr_from(&st, ino), 0);
            }
            Err(err) => reply.error(log_errno(&err, "mknod", &path)),
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_path(&parent_path, name);
        let fs = self.fs.clone();
        let state = self.state.clone();
        self.pool.run(move || match fs.mkdir(&path, mode) {
            Ok(st) => {
                let ino = state.inodes.lock().assign(&path);
                reply.entry(&ATTR_TTL, &attr_from(&st, ino), 0);
            }
            Err(err) => reply.error(log_errno(&err, "mkdir", &path)),
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_path(&parent_path, name);
        let fs = self.fs.clone();
        let state = self.state.clone();
        self.pool.run(move || match fs.unlink(&path) {
            Ok(()) => {
                // Open descriptors keep their sessions; the path mapping
                // goes so they continue as null-path operations.
                state.inodes.lock().remove_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(log_errno(&err, "unlink", &path)),
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_path(&parent_path, name);
        let fs = self.fs.clone();
        let state = self.state.clone();
        self.pool.run(move || match fs.rmdir(&path) {
            Ok(()) => {
                state.inodes.lock().remove_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(log_errno(&err, "rmdir", &path)),
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (from, to) = {
            let inodes = self.state.inodes.lock();
            let Some(from_dir) = inodes.by_ino.get(&parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let Some(to_dir) = inodes.by_ino.get(&newparent) else {
                reply.error(libc::ENOENT);
                return;
            };
            (join_path(from_dir, name), join_path(to_dir, newname))
        };
        let fs = self.fs.clone();
        let state = self.state.clone();
        self.pool.run(move || match fs.rename(&from, &to) {
            Ok(()) => {
                state.inodes.lock().rename(&from, &to);
                reply.ok();
            }
            Err(err) => reply.error(log_errno(&err, "rename", &from)),
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = self.fs.clone();
        let state = self.state.clone();
        self.pool.run(move || match fs.open(&path, flags) {
            Ok(session) => {
                let fh = state.next_fh.fetch_add(1, Ordering::SeqCst);
                state.handles.lock().insert(
                    fh,
                    Arc::new(Handle {
                        ino,
                        session: Mutex::new(session),
                    }),
                );
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(log_errno(&err, "open", &path)),
        });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_path(&parent_path, name);
        let fs = self.fs.clone();
        let state = self.state.clone();
        self.pool.run(move || match fs.create(&path, mode, flags) {
            Ok(session) => {
                let st = StatEntry::generic(mode, false, Some(session.file()));
                let ino = state.inodes.lock().assign(&path);
                let fh = state.next_fh.fetch_add(1, Ordering::SeqCst);
                state.handles.lock().insert(
                    fh,
                    Arc::new(Handle {
                        ino,
                        session: Mutex::new(session),
                    }),
                );
                reply.created(&ATTR_TTL, &attr_from(&st, ino), 0, fh, 0);
            }
            Err(err) => reply.error(log_errno(&err, "create", &path)),
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.state.handle_for(Some(fh), ino) else {
            reply.error(libc::EBADF);
            return;
        };
        let path = self.path_of(ino);
        let fs = self.fs.clone();
        self.pool.run(move || {
            let session = handle.session.lock();
            let mut buf = vec![0u8; size as usize];
            match fs.read(path.as_deref(), &session, &mut buf, offset.max(0) as u64) {
                Ok(n) => reply.data(&buf[..n]),
                Err(err) => reply.error(log_errno(
                    &err,
                    "read",
                    path.as_deref().unwrap_or("null path"),
                )),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.state.handle_for(Some(fh), ino) else {
            reply.error(libc::EBADF);
            return;
        };
        let path = self.path_of(ino);
        let fs = self.fs.clone();
        let data = data.to_vec();
        self.pool.run(move || {
            let mut session = handle.session.lock();
            match fs.write(path.as_deref(), &mut session, &data, offset.max(0) as u64) {
                Ok(n) => reply.written(n as u32),
                Err(err) => reply.error(log_errno(
                    &err,
                    "write",
                    path.as_deref().unwrap_or("null path"),
                )),
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(handle) = self.state.handle_for(Some(fh), ino) else {
            reply.error(libc::EBADF);
            return;
        };
        let path = self.path_of(ino);
        let fs = self.fs.clone();
        self.pool.run(move || {
            let mut session = handle.session.lock();
            match fs.flush(path.as_deref(), &mut session) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(log_errno(
                    &err,
                    "flush",
                    path.as_deref().unwrap_or("null path"),
                )),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let handle = self.state.handles.lock().remove(&fh);
        let Some(handle) = handle else {
            reply.error(libc::EBADF);
            return;
        };
        let path = self.path_of(ino);
        let fs = self.fs.clone();
        self.pool.run(move || {
            let result = {
                let mut session = handle.session.lock();
                fs.release(path.as_deref(), &mut session)
            };
            // The descriptor closes when the last reference drops, error
            // or not.
            drop(handle);
            match result {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(log_errno(
                    &err,
                    "release",
                    path.as_deref().unwrap_or("null path"),
                )),
            }
        });
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        let Some(handle) = self.state.handle_for(Some(fh), ino) else {
            reply.error(libc::EBADF);
            return;
        };
        let path = self.path_of(ino);
        let fs = self.fs.clone();
        self.pool.run(move || {
            let mut session = handle.session.lock();
            match fs.fsync(path.as_deref(), &mut session) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(log_errno(
                    &err,
                    "fsync",
                    path.as_deref().unwrap_or("null path"),
                )),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = self.fs.clone();
        let state = self.state.clone();
        self.pool.run(move || {
            let mut names = Vec::new();
            if let Err(err) = fs.readdir(&path, &mut |name| names.push(name.to_string())) {
                reply.error(log_errno(&err, "readdir", &path));
                return;
            }

            let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(names.len());
            {
                let mut inodes = state.inodes.lock();
                for name in names {
                    match name.as_str() {
                        "." => entries.push((ino, FileType::Directory, name)),
                        ".." => {
                            let parent = dav_path::parent(&path).to_string();
                            let parent_ino = inodes.assign(&parent);
                            entries.push((parent_ino, FileType::Directory, name));
                        }
                        _ => {
                            let child = join_str(&path, &name);
                            let child_ino = inodes.assign(&child);
                            let kind = match fs.cached_is_dir(&child) {
                                Some(true) => FileType::Directory,
                                _ => FileType::RegularFile,
                            };
                            entries.push((child_ino, kind, name));
                        }
                    }
                }
            }

            for (idx, (entry_ino, kind, name)) in
                entries.iter().enumerate().skip(offset.max(0) as usize)
            {
                if reply.add(*entry_ino, (idx as i64) + 1, *kind, name) {
                    break;
                }
            }
            reply.ok();
        });
    }
}
