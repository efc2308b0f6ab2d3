use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/grabtube-env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_BIN: &str = "yt-dlp";
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 1800;

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub scratch_root: Option<PathBuf>,
    pub engine_bin: Option<String>,
    pub probe_timeout_secs: Option<u64>,
    pub fetch_timeout_secs: Option<u64>,
}

/// Fully resolved runtime settings: env-file values with defaults filled in.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,
    pub scratch_root: PathBuf,
    pub engine_bin: String,
    pub probe_timeout: Duration,
    pub fetch_timeout: Duration,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            match key {
                "GRABTUBE_HOST" => {
                    if !value.is_empty() {
                        cfg.host = Some(value.to_string());
                    }
                }
                "GRABTUBE_PORT" => {
                    let port: u16 = value.parse().with_context(|| {
                        format!("Parsing GRABTUBE_PORT from {}", path.display())
                    })?;
                    cfg.port = Some(port);
                }
                "SCRATCH_ROOT" => cfg.scratch_root = Some(PathBuf::from(value)),
                "YTDLP_BIN" => {
                    if !value.is_empty() {
                        cfg.engine_bin = Some(value.to_string());
                    }
                }
                "PROBE_TIMEOUT_SECS" => {
                    let secs: u64 = value.parse().with_context(|| {
                        format!("Parsing PROBE_TIMEOUT_SECS from {}", path.display())
                    })?;
                    cfg.probe_timeout_secs = Some(secs);
                }
                "FETCH_TIMEOUT_SECS" => {
                    let secs: u64 = value.parse().with_context(|| {
                        format!("Parsing FETCH_TIMEOUT_SECS from {}", path.display())
                    })?;
                    cfg.fetch_timeout_secs = Some(secs);
                }
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    load_runtime_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

/// A missing config file is fine: every setting has a default. The scratch
/// root defaults to a crate-named directory under the system temp dir.
pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let cfg = read_env_config(path.as_ref())?.unwrap_or_default();
    let host = cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = cfg.port.unwrap_or(DEFAULT_PORT);
    let scratch_root = cfg
        .scratch_root
        .unwrap_or_else(|| std::env::temp_dir().join("grabtube"));
    let engine_bin = cfg
        .engine_bin
        .unwrap_or_else(|| DEFAULT_ENGINE_BIN.to_string());
    let probe_timeout =
        Duration::from_secs(cfg.probe_timeout_secs.unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS));
    let fetch_timeout =
        Duration::from_secs(cfg.fetch_timeout_secs.unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS));
    Ok(RuntimeConfig {
        host,
        port,
        scratch_root,
        engine_bin,
        probe_timeout,
        fetch_timeout,
    })
}
