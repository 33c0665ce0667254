use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "devloop.toml";

/// Top-level configuration loaded from devloop.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DevloopConfig {
    pub watch: WatchConfig,
    pub restart: RestartConfig,
    pub process: ProcessConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub root: PathBuf,
    pub extensions: Vec<String>,
    pub ignore_dirs: Vec<String>,
    pub ignore_files: Vec<String>,
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub shell: String,
    pub output_buffer: usize,
    pub kill_timeout_ms: u64,
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub inbox_capacity: usize,
    pub max_lines: usize,
}

// --- Default implementations ---

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            // .json is left out: package managers and bundlers rewrite it constantly
            extensions: [
                ".js", ".ts", ".jsx", ".tsx", ".css", ".scss", ".sass", ".mdx", ".md", ".html",
                ".vue", ".svelte",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ignore_dirs: ["node_modules", ".git", "dist", "build", ".cache"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignore_files: vec!["*.lock".to_string(), "*-lock.json".to_string()],
            event_buffer: 256,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self { debounce_ms: 250 }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            output_buffer: 100,
            kill_timeout_ms: 5000,
            grace_period_ms: 0,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            max_lines: 10_000,
        }
    }
}

impl RestartConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl ProcessConfig {
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Errors loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl DevloopConfig {
    /// Load config from `path`.
    ///
    /// A missing file is an error only when `required` is set; otherwise
    /// defaults are returned.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}
