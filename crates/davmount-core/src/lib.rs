pub mod constants;
pub mod errors;
pub mod fs;
pub mod path;
pub mod saint;
pub mod stats;
pub mod store;
pub mod util;
pub mod webdav;
pub mod worker;

// Re-export the types callers touch most
pub use errors::{DavError, DavResult};
pub use fs::{DavFs, FsOptions};
pub use store::file_cache::{FileCache, OpenFlags, Session};
pub use store::kv::KvStore;
pub use store::stat_cache::{StatCache, StatEntry};
pub use webdav::client::{DavClient, DavConfig};
pub use webdav::DavTransport;
