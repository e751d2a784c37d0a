//! Daemon configuration: optional TOML file, environment overrides,
//! built-in defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use qv_wire::ServerUrl;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 55995;
pub const DEFAULT_QDEPTH: usize = 64;

/// On-disk daemon configuration; every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub url: Option<String>,
    pub qdepth: Option<usize>,
    pub tmpdir: Option<PathBuf>,
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub url: ServerUrl,
    pub qdepth: usize,
    pub tmpdir: PathBuf,
}

impl ServerConfig {
    /// Resolution order: explicit URL flag, config file, `QV_PORT`, the
    /// built-in port. The topology directory honors `QV_TMPDIR`, then the
    /// config file, then `TMPDIR`, then `/tmp`.
    pub fn resolve(
        url_flag: Option<&str>,
        config: &Config,
    ) -> Result<Self, qv_rc::ReturnCode> {
        let url = match url_flag.map(str::to_string).or_else(|| config.url.clone()) {
            Some(url) => url,
            None => {
                let port = env::var("QV_PORT")
                    .ok()
                    .and_then(|s| s.parse::<u16>().ok())
                    .unwrap_or(DEFAULT_PORT);
                format!("tcp://127.0.0.1:{port}")
            }
        };
        let url: ServerUrl = url.parse()?;

        let tmpdir = env::var_os("QV_TMPDIR")
            .map(PathBuf::from)
            .or_else(|| config.tmpdir.clone())
            .or_else(|| env::var_os("TMPDIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/tmp"));

        Ok(ServerConfig {
            url,
            qdepth: config.qdepth.unwrap_or(DEFAULT_QDEPTH),
            tmpdir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qvd.toml");
        fs::write(&path, "url = \"tcp://127.0.0.1:7777\"\nqdepth = 8\n").unwrap();
        let config = Config::from_path(&path).unwrap();
        assert_eq!(config.url.as_deref(), Some("tcp://127.0.0.1:7777"));
        assert_eq!(config.qdepth, Some(8));
        assert!(config.tmpdir.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qvd.toml");
        fs::write(&path, "bogus = 1\n").unwrap();
        assert!(Config::from_path(&path).is_err());
    }

    #[test]
    fn flag_beats_config_file() {
        let config = Config {
            url: Some("tcp://127.0.0.1:7777".to_string()),
            qdepth: Some(4),
            tmpdir: Some(PathBuf::from("/var/tmp")),
        };
        let resolved =
            ServerConfig::resolve(Some("unix:///run/qv.sock"), &config).unwrap();
        assert_eq!(
            resolved.url,
            ServerUrl::Unix(PathBuf::from("/run/qv.sock"))
        );
        assert_eq!(resolved.qdepth, 4);
    }

    #[test]
    fn bad_url_is_rejected() {
        assert!(ServerConfig::resolve(Some("carrier-pigeon://x"), &Config::default())
            .is_err());
    }
}
