use std::{
    env::VarError,
    fmt::Display,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
};

use anyhow::{anyhow, Context, Result};
use tracing::Level;

use crate::transcode::{Delivery, ParamPolicy};

/// Service configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Directory input files are resolved against
    pub input_dir: PathBuf,
    /// Input file name used when the request doesn't name one
    pub input_file: String,
    pub ffmpeg_path: PathBuf,
    /// Arguments placed before every conversion's own arguments
    pub ffmpeg_global_args: Vec<String>,
    /// Where buffered conversions write their output before it is read back
    pub scratch_dir: PathBuf,
    pub param_policy: ParamPolicy,
    pub delivery: Delivery,
    pub log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            input_dir: PathBuf::from("public/videos"),
            input_file: "sample.mp4".to_string(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffmpeg_global_args: Vec::new(),
            scratch_dir: std::env::temp_dir(),
            param_policy: ParamPolicy::Reject,
            delivery: Delivery::Buffered,
            log_level: Level::DEBUG,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key))
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let defaults = Self::default();
        let global_args: String = var_or(&lookup, "FFMPEG_GLOBAL_ARGS", String::new())?;

        Ok(Self {
            bind_addr: var_or(&lookup, "BIND_ADDR", defaults.bind_addr)?,
            input_dir: var_or(&lookup, "INPUT_DIR", defaults.input_dir)?,
            input_file: var_or(&lookup, "INPUT_FILE", defaults.input_file)?,
            ffmpeg_path: var_or(&lookup, "FFMPEG_PATH", defaults.ffmpeg_path)?,
            ffmpeg_global_args: global_args.split_whitespace().map(String::from).collect(),
            scratch_dir: var_or(&lookup, "SCRATCH_DIR", defaults.scratch_dir)?,
            param_policy: var_or(&lookup, "PARAM_POLICY", defaults.param_policy)?,
            delivery: var_or(&lookup, "DELIVERY", defaults.delivery)?,
            log_level: var_or(&lookup, "LOG_LEVEL", defaults.log_level)?,
        })
    }
}

fn var_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Result<String, VarError>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Ok(value) => value
            .parse()
            .map_err(|err| anyhow!("invalid value for {}={:?}: {}", key, value, err)),
        Err(VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
