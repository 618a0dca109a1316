//! Server-facing protocol procedures.
//!
//! The caches drive the wire protocol through [`DavTransport`], a seam
//! narrow enough to script in tests: listings invoke a visitor per entry,
//! conditional GET hands back either "unchanged" or a body stream, PUT
//! returns the new entity tag. [`client::DavClient`] is the real
//! implementation.

pub mod client;
#[cfg(test)]
pub(crate) mod mock;

use std::fs::File;
use std::io::Read;

use crate::errors::DavResult;
use crate::store::stat_cache::StatEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
}

/// Result of a listing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropfindOutcome {
    Complete,
    /// The server rejected the changes-since window; the caller must fall
    /// back to a full listing.
    StaleWindow,
}

/// Result of a conditional GET. A 404 surfaces as `DavError::NotFound`,
/// any other unexpected status as `DavError::Io`.
pub enum GetOutcome {
    /// 304: the stored entity tag still matches.
    NotModified,
    /// 200: fresh body; the tag is empty when the server sent none.
    Modified {
        body: Box<dyn Read + Send>,
        etag: String,
    },
}

/// Result of a MOVE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    /// 404 or 500: the server lost the source, but the caller can still
    /// complete the rename locally.
    ServerLostSource,
}

/// Per-entry visitor for depth-0/1 listings: escaped path, stat record,
/// per-entry status. Status 410 marks a removed child.
pub type ListingVisitor<'a> = &'a mut dyn FnMut(&str, StatEntry, u16);

pub trait DavTransport: Send + Sync {
    /// PROPFIND at the given depth, optionally windowed with
    /// `?changes_since=<t>`. Invokes `visit` once per entry.
    fn propfind(
        &self,
        path: &str,
        depth: Depth,
        changes_since: Option<u64>,
        visit: ListingVisitor,
    ) -> DavResult<PropfindOutcome>;

    /// GET with `If-None-Match` when a tag is known.
    fn get_if_none_match(&self, path: &str, etag: Option<&str>) -> DavResult<GetOutcome>;

    /// PUT the full body; returns the entity tag from the response, empty
    /// when the server sent none.
    fn put(&self, path: &str, body: File, len: u64) -> DavResult<String>;

    fn mkcol(&self, path: &str) -> DavResult<()>;

    fn mov(&self, from: &str, to: &str) -> DavResult<MoveOutcome>;

    fn delete(&self, path: &str) -> DavResult<()>;
}
