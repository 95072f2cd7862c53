#![forbid(unsafe_code)]

//! Startup configuration. Built once, then handed to the pipeline and the
//! HTTP layer behind an `Arc`.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8091;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DB_PATH: &str = "tubely.db";
pub const DEFAULT_S3_REGION: &str = "us-east-1";
pub const DEFAULT_FFPROBE_BIN: &str = "ffprobe";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub assets_root: PathBuf,
    pub db_path: PathBuf,
    pub staging_dir: PathBuf,
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub distribution_base: String,
    pub port: u16,
    pub host: String,
    pub public_base_url: String,
    pub jwt_secret: String,
    pub ffprobe_bin: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub tool_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub assets_root: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config(&file_vars, env_var_string, overrides)
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let required = |key: &str| lookup(key).ok_or_else(|| anyhow!("{key} not set"));

    let assets_root = match overrides.assets_root {
        Some(path) => path,
        None => PathBuf::from(required("ASSETS_ROOT")?),
    };
    let db_path = overrides
        .db_path
        .or_else(|| lookup("DB_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
    let staging_dir = lookup("STAGING_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir);
    let port = overrides
        .port
        .or_else(|| lookup("PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let public_base_url = lookup("PUBLIC_BASE_URL")
        .unwrap_or_else(|| format!("http://localhost:{port}"))
        .trim_end_matches('/')
        .to_string();
    let distribution_base = required("S3_CF_DISTRO")?
        .trim_end_matches('/')
        .to_string();
    let tool_timeout = lookup("TOOL_TIMEOUT_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS);

    Ok(RuntimeConfig {
        assets_root,
        db_path,
        staging_dir,
        s3_bucket: required("S3_BUCKET")?,
        s3_region: lookup("S3_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
        s3_endpoint: lookup("S3_ENDPOINT"),
        distribution_base,
        port,
        host,
        public_base_url,
        jwt_secret: required("JWT_SECRET")?,
        ffprobe_bin: PathBuf::from(
            lookup("FFPROBE_BIN").unwrap_or_else(|| DEFAULT_FFPROBE_BIN.to_string()),
        ),
        ffmpeg_bin: PathBuf::from(
            lookup("FFMPEG_BIN").unwrap_or_else(|| DEFAULT_FFMPEG_BIN.to_string()),
        ),
        tool_timeout: Duration::from_secs(tool_timeout),
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
