//! Error type surfaced by the caches and filesystem operations.
//!
//! Every error carries a kind and a contextual message; at the kernel
//! bridge boundary `errno()` collapses it to a negated POSIX number.

pub type DavResult<T> = std::result::Result<T, DavError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DavError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("bad descriptor: {0}")]
    BadDescriptor(String),

    /// Cache hit on a stale entry. Consumed inside the callback layer and
    /// never crosses the bridge boundary.
    #[error("entry expired: {0}")]
    KeyExpired(String),
}

impl DavError {
    pub fn io(msg: impl Into<String>) -> Self {
        DavError::Io(msg.into())
    }

    /// Negated POSIX errno for the kernel bridge.
    pub fn errno(&self) -> i32 {
        -(match self {
            DavError::NotFound(_) => libc::ENOENT,
            DavError::IsDirectory(_) => libc::EISDIR,
            DavError::NotDirectory(_) => libc::ENOTDIR,
            DavError::NotEmpty(_) => libc::ENOTEMPTY,
            DavError::Io(_) => libc::EIO,
            DavError::BadDescriptor(_) => libc::EBADF,
            DavError::KeyExpired(_) => libc::EKEYEXPIRED,
        })
    }
}

impl From<std::io::Error> for DavError {
    fn from(err: std::io::Error) -> Self {
        DavError::Io(err.to_string())
    }
}

impl From<sled::Error> for DavError {
    fn from(err: sled::Error) -> Self {
        DavError::Io(format!("kv store: {err}"))
    }
}

impl From<bincode::Error> for DavError {
    fn from(err: bincode::Error) -> Self {
        DavError::Io(format!("record encoding: {err}"))
    }
}
