//! Thin adapter over the embedded key-value store.
//!
//! Keys are byte strings ordered lexicographically; prefix iteration is a
//! snapshot view, so sweeps stay safe while other threads keep writing.

use std::path::Path;

use crate::errors::{DavError, DavResult};

#[derive(Debug, Clone)]
pub struct KvStore {
    db: sled::Db,
}

impl KvStore {
    pub fn open(dir: &Path) -> DavResult<Self> {
        Ok(Self {
            db: sled::open(dir)?,
        })
    }

    pub fn get(&self, key: &[u8]) -> DavResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> DavResult<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> DavResult<()> {
        self.db.remove(key)?;
        Ok(())
    }

    /// Key-ordered iteration over every entry under `prefix`.
    pub fn scan_prefix<'a>(
        &'a self,
        prefix: &[u8],
    ) -> impl Iterator<Item = DavResult<(Vec<u8>, Vec<u8>)>> + 'a {
        self.db.scan_prefix(prefix).map(|item| {
            item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(DavError::from)
        })
    }

    pub fn flush(&self) -> DavResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path()).unwrap();

        kv.put(b"k1", b"v1").unwrap();
        assert_eq!(kv.get(b"k1").unwrap(), Some(b"v1".to_vec()));

        kv.delete(b"k1").unwrap();
        assert_eq!(kv.get(b"k1").unwrap(), None);
    }

    #[test]
    fn prefix_scan_is_ordered_and_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path()).unwrap();

        kv.put(b"a:/z", b"1").unwrap();
        kv.put(b"b:/m", b"2").unwrap();
        kv.put(b"b:/a", b"3").unwrap();
        kv.put(b"c:/q", b"4").unwrap();

        let keys: Vec<Vec<u8>> = kv
            .scan_prefix(b"b:")
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"b:/a".to_vec(), b"b:/m".to_vec()]);
    }

    #[test]
    fn scan_survives_concurrent_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path()).unwrap();
        for i in 0..10 {
            kv.put(format!("p:{i}").as_bytes(), b"x").unwrap();
        }
        let mut seen = 0;
        for item in kv.scan_prefix(b"p:") {
            let (k, _) = item.unwrap();
            kv.delete(&k).unwrap();
            seen += 1;
        }
        assert_eq!(seen, 10);
    }
}
