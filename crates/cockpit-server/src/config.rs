//! Server configuration.
//!
//! Sources, lowest priority first: the embedded `config/default.toml`,
//! `config/local.toml`, the file named by `COCKPIT_CONFIG`, then
//! `COCKPIT_<SECTION>__<KEY>` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use cockpit_pty::{RegistryConfig, ShellCommand, SpawnOptions};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub terminal: TerminalConfig,
    pub processes: ProcessesConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory served for paths no route matches (the browser panel).
    pub static_dir: Option<PathBuf>,
    /// Reconnect delay advertised to SSE clients.
    pub sse_retry_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            static_dir: None,
            sse_retry_ms: 5000,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    pub fn sse_retry(&self) -> Duration {
        Duration::from_millis(self.sse_retry_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell to run in new sessions; `$SHELL` or `/bin/sh` when unset.
    pub shell: Option<String>,
    pub shell_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub name_prefix: String,
    pub max_sessions_per_user: usize,
    pub default_rows: u16,
    pub default_cols: u16,
    pub stream_buffer: usize,
    pub input_buffer: usize,
    pub read_chunk_size: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: None,
            shell_args: Vec::new(),
            working_dir: None,
            name_prefix: "cockpit".to_string(),
            max_sessions_per_user: 3,
            default_rows: 24,
            default_cols: 80,
            stream_buffer: 64,
            input_buffer: 256,
            read_chunk_size: 4096,
        }
    }
}

impl TerminalConfig {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            name_prefix: self.name_prefix.clone(),
            max_sessions: self.max_sessions_per_user,
            spawn: SpawnOptions {
                command: ShellCommand {
                    program: self.shell.clone(),
                    args: self.shell_args.clone(),
                    working_dir: self.working_dir.clone(),
                },
                rows: self.default_rows,
                cols: self.default_cols,
                input_buffer: self.input_buffer,
                read_chunk_size: self.read_chunk_size,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessesConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub command: String,
    pub args: Vec<String>,
    pub columns: u16,
    pub lines: u16,
    /// Command behind the JSON listing. Must print `pid user rss pcpu comm`
    /// rows without a header.
    pub list_command: String,
    pub list_args: Vec<String>,
    pub list_limit: usize,
}

impl Default for ProcessesConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            timeout_ms: 2000,
            command: "top".to_string(),
            args: ["-b", "-n", "1", "-w", "200", "-o", "%MEM"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            columns: 200,
            lines: 50,
            list_command: "ps".to_string(),
            list_args: vec!["-eo".to_string(), "pid=,user=,rss=,pcpu=,comm=".to_string()],
            list_limit: 50,
        }
    }
}

impl ProcessesConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// With auth disabled every caller acts as the `local` user.
    pub enabled: bool,
    pub users: Vec<UserToken>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserToken {
    pub username: String,
    pub token: String,
}

/// Load configuration from files and environment
pub fn load_config() -> Result<AppConfig> {
    let mut builder = Config::builder()
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        .add_source(File::with_name("config/local").required(false));

    if let Ok(path) = std::env::var("COCKPIT_CONFIG") {
        builder = builder.add_source(File::with_name(&path));
    }

    let config = builder
        .add_source(
            Environment::with_prefix("COCKPIT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}
