//! Per-operation counters, dumped on SIGUSR2.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct OpStats {
    pub chmod: AtomicU64,
    pub chown: AtomicU64,
    pub create: AtomicU64,
    pub fsync: AtomicU64,
    pub flush: AtomicU64,
    pub ftruncate: AtomicU64,
    pub fgetattr: AtomicU64,
    pub getattr: AtomicU64,
    pub mkdir: AtomicU64,
    pub mknod: AtomicU64,
    pub open: AtomicU64,
    pub read: AtomicU64,
    pub readdir: AtomicU64,
    pub release: AtomicU64,
    pub rename: AtomicU64,
    pub rmdir: AtomicU64,
    pub unlink: AtomicU64,
    pub utimens: AtomicU64,
    pub write: AtomicU64,
}

pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl OpStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_summary(&self) {
        let fetch = |c: &AtomicU64| c.load(Ordering::Relaxed);
        tracing::info!("operations:");
        tracing::info!("  chmod:       {}", fetch(&self.chmod));
        tracing::info!("  chown:       {}", fetch(&self.chown));
        tracing::info!("  create:      {}", fetch(&self.create));
        tracing::info!("  fsync:       {}", fetch(&self.fsync));
        tracing::info!("  flush:       {}", fetch(&self.flush));
        tracing::info!("  ftruncate:   {}", fetch(&self.ftruncate));
        tracing::info!("  fgetattr:    {}", fetch(&self.fgetattr));
        tracing::info!("  getattr:     {}", fetch(&self.getattr));
        tracing::info!("  mkdir:       {}", fetch(&self.mkdir));
        tracing::info!("  mknod:       {}", fetch(&self.mknod));
        tracing::info!("  open:        {}", fetch(&self.open));
        tracing::info!("  read:        {}", fetch(&self.read));
        tracing::info!("  readdir:     {}", fetch(&self.readdir));
        tracing::info!("  release:     {}", fetch(&self.release));
        tracing::info!("  rename:      {}", fetch(&self.rename));
        tracing::info!("  rmdir:       {}", fetch(&self.rmdir));
        tracing::info!("  unlink:      {}", fetch(&self.unlink));
        tracing::info!("  utimens:     {}", fetch(&self.utimens));
        tracing::info!("  write:       {}", fetch(&self.write));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = OpStats::new();
        bump(&stats.read);
        bump(&stats.read);
        bump(&stats.write);
        assert_eq!(stats.read.load(Ordering::Relaxed), 2);
        assert_eq!(stats.write.load(Ordering::Relaxed), 1);
        assert_eq!(stats.open.load(Ordering::Relaxed), 0);
    }
}
