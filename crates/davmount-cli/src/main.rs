mod bridge;
mod logging;
mod options;
mod process;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use davmount_core::constants::CACHE_CLEANUP_INTERVAL_SECS;
use davmount_core::saint::SaintMode;
use davmount_core::webdav::DavTransport;
use davmount_core::{
    worker, DavClient, DavConfig, DavFs, FileCache, FsOptions, KvStore, StatCache,
};
use fuser::MountOption;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;

use crate::bridge::Bridge;
use crate::options::MountOptions;

#[derive(Parser)]
#[command(
    name = "davmount",
    version,
    about = "Mount a remote WebDAV collection with local caching"
)]
struct Cli {
    /// Remote collection URI, e.g. https://host/share/
    uri: String,

    /// Local mountpoint
    mountpoint: PathBuf,

    /// Mount options, comma separated (may repeat)
    #[arg(short = 'o', value_name = "opt,...")]
    options: Vec<String>,
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("davmount: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut opts = MountOptions::default();
    for group in &cli.options {
        for item in group.split(',').filter(|s| !s.is_empty()) {
            opts.apply(item)?;
        }
    }
    if let Some(config_file) = opts.config_file.clone() {
        opts.merge_config_file(&config_file)?;
    }

    logging::init(opts.verbosity, opts.section_verbosity.as_deref());
    process::install_sigsegv_handler();
    process::ignore_sigpipe();

    if let Some(cache_uri) = &opts.cache_uri {
        tracing::info!("peer cache hint: {cache_uri}");
    }

    // Fork before anything spawns threads or opens the store.
    if !opts.nodaemon {
        process::daemonize()?;
    }
    process::drop_privileges(opts.run_as_uid.as_deref(), opts.run_as_gid.as_deref())?;

    let client = Arc::new(DavClient::new(&DavConfig {
        uri: cli.uri.clone(),
        username: opts.username.clone(),
        password: opts.password.clone(),
        ca_certificate: opts.ca_certificate.clone(),
        client_certificate: opts.client_certificate.clone(),
    })?);
    let transport: Arc<dyn DavTransport> = client.clone();

    let cache_path = opts
        .cache_path
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("davmount"));
    std::fs::create_dir_all(&cache_path)
        .with_context(|| format!("creating cache path {}", cache_path.display()))?;

    let kv = Arc::new(KvStore::open(&cache_path.join("db"))?);
    let stat_cache = Arc::new(StatCache::new(kv.clone()));
    let file_cache = Arc::new(FileCache::new(kv.clone(), &cache_path, transport.clone())?);

    let fs = Arc::new(DavFs::new(
        FsOptions {
            progressive_propfind: opts.progressive_propfind,
            refresh_dir_for_file_stat: opts.refresh_dir_for_file_stat,
            grace: opts.grace,
        },
        client.base_directory().to_string(),
        transport,
        stat_cache.clone(),
        file_cache.clone(),
        SaintMode::default(),
    ));

    let maintenance = worker::spawn(
        file_cache,
        stat_cache,
        Duration::from_secs(CACHE_CLEANUP_INTERVAL_SECS),
    )?;

    let bridge = Bridge::new(fs.clone(), opts.singlethread)?;
    let mount_options = [MountOption::FSName("davmount".to_string())];
    let session = fuser::spawn_mount2(bridge, &cli.mountpoint, &mount_options)
        .with_context(|| format!("mounting {}", cli.mountpoint.display()))?;

    tracing::info!(
        "startup complete: {} mounted on {}",
        cli.uri,
        cli.mountpoint.display()
    );

    let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2])
        .context("installing signal handlers")?;
    for signal in signals.forever() {
        match signal {
            SIGUSR2 => fs.stats.log_summary(),
            SIGUSR1 => {}
            _ => {
                tracing::info!("caught signal {signal}, shutting down");
                break;
            }
        }
    }

    drop(session);
    maintenance.shutdown();
    kv.flush()?;
    tracing::info!("unmounted cleanly");
    Ok(())
}
