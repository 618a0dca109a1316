//! Scripted transport for exercising the caches without a server.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{DavTransport, Depth, GetOutcome, ListingVisitor, MoveOutcome, PropfindOutcome};
use crate::errors::{DavError, DavResult};
use crate::store::stat_cache::StatEntry;

pub(crate) struct MockTransport {
    listings: Mutex<HashMap<String, Vec<(String, StatEntry, u16)>>>,
    bodies: Mutex<HashMap<String, (Vec<u8>, String)>>,
    puts: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    put_etag: Mutex<String>,
    fail_listings: AtomicBool,
    fail_gets: AtomicBool,
    stale_window: AtomicBool,
    move_outcome: Mutex<MoveOutcome>,
    calls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            listings: Mutex::new(HashMap::new()),
            bodies: Mutex::new(HashMap::new()),
            puts: Mutex::new(HashMap::new()),
            put_etag: Mutex::new(String::new()),
            fail_listings: AtomicBool::new(false),
            fail_gets: AtomicBool::new(false),
            stale_window: AtomicBool::new(false),
            move_outcome: Mutex::new(MoveOutcome::Moved),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_listing(&self, dir: &str, entries: Vec<(String, StatEntry, u16)>) {
        self.listings.lock().insert(dir.to_string(), entries);
    }

    pub fn set_body(&self, path: &str, body: &[u8], etag: &str) {
        self.bodies
            .lock()
            .insert(path.to_string(), (body.to_vec(), etag.to_string()));
    }

    pub fn set_put_etag(&self, etag: &str) {
        *self.put_etag.lock() = etag.to_string();
    }

    pub fn fail_listings(&self, fail: bool) {
        self.fail_listings.store(fail, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    pub fn set_stale_window(&self, stale: bool) {
        self.stale_window.store(stale, Ordering::SeqCst);
    }

    pub fn set_move_outcome(&self, outcome: MoveOutcome) {
        *self.move_outcome.lock() = outcome;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn listing_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with("PROPFIND"))
            .count()
    }

    pub fn put_bodies(&self, path: &str) -> Vec<Vec<u8>> {
        self.puts.lock().get(path).cloned().unwrap_or_default()
    }

    fn log(&self, call: String) {
        self.calls.lock().push(call);
    }
}

impl DavTransport for MockTransport {
    fn propfind(
        &self,
        path: &str,
        depth: Depth,
        changes_since: Option<u64>,
        visit: ListingVisitor,
    ) -> DavResult<PropfindOutcome> {
        let kind = match (depth, changes_since.is_some()) {
            (Depth::Zero, _) => "depth0",
            (Depth::One, true) => "windowed",
            (Depth::One, false) => "full",
        };
        self.log(format!("PROPFIND {path} {kind}"));

        if self.fail_listings.load(Ordering::SeqCst) {
            return Err(DavError::io(format!("listing {path} failed")));
        }
        if changes_since.is_some() && self.stale_window.load(Ordering::SeqCst) {
            return Ok(PropfindOutcome::StaleWindow);
        }
        let listings = self.listings.lock();
        let Some(entries) = listings.get(path) else {
            return Err(DavError::NotFound(path.to_string()));
        };
        for (entry_path, st, status) in entries {
            visit(entry_path, st.clone(), *status);
        }
        Ok(PropfindOutcome::Complete)
    }

    fn get_if_none_match(&self, path: &str, etag: Option<&str>) -> DavResult<GetOutcome> {
        self.log(format!("GET {path} tag={}", etag.unwrap_or("-")));
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(DavError::io(format!("GET {path} failed")));
        }
        let bodies = self.bodies.lock();
        let Some((data, tag)) = bodies.get(path) else {
            return Err(DavError::NotFound(path.to_string()));
        };
        if !tag.is_empty() && etag == Some(tag.as_str()) {
            return Ok(GetOutcome::NotModified);
        }
        Ok(GetOutcome::Modified {
            body: Box::new(Cursor::new(data.clone())),
            etag: tag.clone(),
        })
    }

    fn put(&self, path: &str, mut body: File, len: u64) -> DavResult<String> {
        self.log(format!("PUT {path} len={len}"));
        let mut data = Vec::new();
        body.read_to_end(&mut data)?;
        let etag = self.put_etag.lock().clone();
        self.bodies
            .lock()
            .insert(path.to_string(), (data.clone(), etag.clone()));
        self.puts.lock().entry(path.to_string()).or_default().push(data);
        Ok(etag)
    }

    fn mkcol(&self, path: &str) -> DavResult<()> {
        self.log(format!("MKCOL {path}"));
        Ok(())
    }

    fn mov(&self, from: &str, to: &str) -> DavResult<MoveOutcome> {
        self.log(format!("MOVE {from} -> {to}"));
        Ok(*self.move_outcome.lock())
    }

    fn delete(&self, path: &str) -> DavResult<()> {
        self.log(format!("DELETE {path}"));
        Ok(())
    }
}
