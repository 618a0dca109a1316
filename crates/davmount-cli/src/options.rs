//! Mount options: the `-o` list and the sectioned config file.
//!
//! Both surfaces carry the same keys. The config file is applied after
//! the command line, overriding it where a key is present, which matches
//! how deployments push canonical settings through the file while the
//! mount wrapper passes best-effort defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct MountOptions {
    // [ProtocolAndPerformance]
    pub progressive_propfind: bool,
    pub refresh_dir_for_file_stat: bool,
    pub grace: bool,
    pub singlethread: bool,
    pub cache_uri: Option<String>,
    // [Authenticate]
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_certificate: Option<PathBuf>,
    pub client_certificate: Option<PathBuf>,
    // [LogAndProcess]
    pub nodaemon: bool,
    pub cache_path: Option<PathBuf>,
    pub run_as_uid: Option<String>,
    pub run_as_gid: Option<String>,
    pub verbosity: u8,
    pub section_verbosity: Option<String>,
    // Other
    pub config_file: Option<PathBuf>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            progressive_propfind: false,
            refresh_dir_for_file_stat: false,
            grace: false,
            singlethread: false,
            cache_uri: None,
            username: None,
            password: None,
            ca_certificate: None,
            client_certificate: None,
            nodaemon: false,
            cache_path: None,
            run_as_uid: None,
            run_as_gid: None,
            verbosity: 5,
            section_verbosity: None,
            config_file: None,
        }
    }
}

impl MountOptions {
    /// Applies one element of a `-o a,b=c` list. Options we don't know
    /// (generic mount flags from fstab, retired knobs) are ignored with a
    /// note rather than failing the mount.
    pub fn apply(&mut self, option: &str) -> Result<()> {
        let (key, value) = match option.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (option, None),
        };

        match key {
            "progressive_propfind" => self.progressive_propfind = true,
            "refresh_dir_for_file_stat" => self.refresh_dir_for_file_stat = true,
            "grace" => self.grace = true,
            "singlethread" => self.singlethread = true,
            "nodaemon" => self.nodaemon = true,
            "cache_uri" => self.cache_uri = required(key, value)?,
            "username" => self.username = required(key, value)?,
            "password" => self.password = required(key, value)?,
            "ca_certificate" => self.ca_certificate = required(key, value)?,
            "client_certificate" => self.client_certificate = required(key, value)?,
            "cache_path" => self.cache_path = required(key, value)?,
            "run_as_uid" => self.run_as_uid = required(key, value)?,
            "run_as_gid" => self.run_as_gid = required(key, value)?,
            "verbosity" => {
                let raw: String = required(key, value)?.unwrap_or_default();
                self.verbosity = raw
                    .parse()
                    .with_context(|| format!("verbosity must be 0-7, got {raw:?}"))?;
            }
            "section_verbosity" => self.section_verbosity = required(key, value)?,
            "config_file" => self.config_file = required(key, value)?,
            other => {
                eprintln!("davmount: ignoring unknown mount option {other:?}");
            }
        }
        Ok(())
    }

    /// Loads the sectioned config file and overlays every key it carries.
    pub fn merge_config_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        let protocol = file.protocol_and_performance;
        merge_flag(&mut self.progressive_propfind, protocol.progressive_propfind);
        merge_flag(
            &mut self.refresh_dir_for_file_stat,
            protocol.refresh_dir_for_file_stat,
        );
        merge_flag(&mut self.grace, protocol.grace);
        merge_flag(&mut self.singlethread, protocol.singlethread);
        merge_opt(&mut self.cache_uri, protocol.cache_uri);

        let auth = file.authenticate;
        merge_opt(&mut self.username, auth.username);
        merge_opt(&mut self.password, auth.password);
        merge_opt(&mut self.ca_certificate, auth.ca_certificate);
        merge_opt(&mut self.client_certificate, auth.client_certificate);

        let log = file.log_and_process;
        merge_flag(&mut self.nodaemon, log.nodaemon);
        merge_opt(&mut self.cache_path, log.cache_path);
        merge_opt(&mut self.run_as_uid, log.run_as_uid);
        merge_opt(&mut self.run_as_gid, log.run_as_gid);
        if let Some(verbosity) = log.verbosity {
            self.verbosity = verbosity;
        }
        merge_opt(&mut self.section_verbosity, log.section_verbosity);

        Ok(())
    }
}

fn required<T: From<String>>(key: &str, value: Option<&str>) -> Result<Option<T>> {
    match value {
        Some(v) => Ok(Some(T::from(v.to_string()))),
        None => anyhow::bail!("mount option {key} requires a value"),
    }
}

fn merge_flag(dest: &mut bool, src: Option<bool>) {
    if let Some(v) = src {
        *dest = v;
    }
}

fn merge_opt<T>(dest: &mut Option<T>, src: Option<T>) {
    if src.is_some() {
        *dest = src;
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    #[serde(rename = "ProtocolAndPerformance")]
    protocol_and_performance: ProtocolSection,
    #[serde(rename = "Authenticate")]
    authenticate: AuthSection,
    #[serde(rename = "LogAndProcess")]
    log_and_process: LogSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProtocolSection {
    progressive_propfind: Option<bool>,
    refresh_dir_for_file_stat: Option<bool>,
    grace: Option<bool>,
    singlethread: Option<bool>,
    cache_uri: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuthSection {
    username: Option<String>,
    password: Option<String>,
    ca_certificate: Option<PathBuf>,
    client_certificate: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogSection {
    nodaemon: Option<bool>,
    cache_path: Option<PathBuf>,
    run_as_uid: Option<String>,
    run_as_gid: Option<String>,
    verbosity: Option<u8>,
    section_verbosity: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(opts: &[&str]) -> MountOptions {
        let mut options = MountOptions::default();
        for opt in opts {
            options.apply(opt).unwrap();
        }
        options
    }

    #[test]
    fn defaults_are_conservative() {
        let options = MountOptions::default();
        assert!(!options.grace);
        assert!(!options.progressive_propfind);
        assert_eq!(options.verbosity, 5);
    }

    #[test]
    fn flag_and_value_options_parse() {
        let options = parse(&[
            "grace",
            "progressive_propfind",
            "username=alice",
            "password=secret",
            "cache_path=/var/cache/davmount",
            "verbosity=7",
        ]);
        assert!(options.grace);
        assert!(options.progressive_propfind);
        assert_eq!(options.username.as_deref(), Some("alice"));
        assert_eq!(
            options.cache_path,
            Some(PathBuf::from("/var/cache/davmount"))
        );
        assert_eq!(options.verbosity, 7);
    }

    #[test]
    fn value_option_without_value_is_an_error() {
        let mut options = MountOptions::default();
        assert!(options.apply("username").is_err());
    }

    #[test]
    fn bad_verbosity_is_an_error() {
        let mut options = MountOptions::default();
        assert!(options.apply("verbosity=loud").is_err());
    }

    #[test]
    fn unknown_options_are_tolerated() {
        let mut options = MountOptions::default();
        options.apply("rw").unwrap();
        options.apply("noatime").unwrap();
        options.apply("dir_mode=0007").unwrap();
    }

    #[test]
    fn config_file_overlays_the_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("davmount.conf");
        std::fs::write(
            &path,
            r#"
[ProtocolAndPerformance]
progressive_propfind = true
grace = true

[Authenticate]
ca_certificate = "/etc/pki/tls/certs/ca-bundle.crt"

[LogAndProcess]
nodaemon = false
cache_path = "/srv/cache"
verbosity = 6
"#,
        )
        .unwrap();

        let mut options = parse(&["verbosity=3", "cache_path=/tmp/elsewhere"]);
        options.merge_config_file(&path).unwrap();

        assert!(options.progressive_propfind);
        assert!(options.grace);
        assert_eq!(options.verbosity, 6);
        assert_eq!(options.cache_path, Some(PathBuf::from("/srv/cache")));
        assert_eq!(
            options.ca_certificate,
            Some(PathBuf::from("/etc/pki/tls/certs/ca-bundle.crt"))
        );
        // Keys the file does not carry keep their command-line values.
        assert!(!options.singlethread);
    }

    #[test]
    fn missing_sections_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("davmount.conf");
        std::fs::write(&path, "[Authenticate]\nusername = \"bob\"\n").unwrap();

        let mut options = MountOptions::default();
        options.merge_config_file(&path).unwrap();
        assert_eq!(options.username.as_deref(), Some("bob"));
        assert_eq!(options.verbosity, 5);
    }
}
