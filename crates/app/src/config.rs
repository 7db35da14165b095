use std::env;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use sandbox::SandboxLaunchConfig;
use sandbox::launcher::DEFAULT_IMAGE;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 7860;
const DEFAULT_DOCKER_BIN: &str = "docker";
const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub docker_bin: String,
    pub sandbox_image: String,
    pub max_body_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            docker_bin: DEFAULT_DOCKER_BIN.to_owned(),
            sandbox_image: DEFAULT_IMAGE.to_owned(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: lookup("FORGE_HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "FORGE_PORT", defaults.port)?,
            docker_bin: lookup("FORGE_DOCKER_BIN").unwrap_or(defaults.docker_bin),
            sandbox_image: lookup("FORGE_SANDBOX_IMAGE").unwrap_or(defaults.sandbox_image),
            max_body_bytes: parse_or(&lookup, "FORGE_MAX_BODY_BYTES", defaults.max_body_bytes)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn to_launch_config(&self) -> SandboxLaunchConfig {
        SandboxLaunchConfig {
            docker_bin: self.docker_bin.clone(),
            image: self.sandbox_image.clone(),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Err(anyhow!("{key} is set but empty")),
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {raw:?}")),
    }
}
