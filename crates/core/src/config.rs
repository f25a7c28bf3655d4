use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ─── Config ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,
    pub app_name: String,
    pub app_env: AppEnv,

    // Root used to relativize file paths in diagnostics and read source lines.
    // Falls back to the workspace the binary was built from, then the working
    // directory.
    pub project_root: Option<PathBuf>,

    // Request body size limit (MB)
    pub body_limit_mb: usize,

    // Take the client address from X-Forwarded-For / X-Real-IP
    pub trust_forwarded_headers: bool,

    // Debug & logging
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            app_name: "omni".to_string(),
            app_env: AppEnv::default(),
            project_root: None,
            body_limit_mb: 10,
            trust_forwarded_headers: false,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Load config from a YAML file and validate it.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml_ng::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &str) -> Result<Self, ConfigError> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config file at '{path}', using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        if self.body_limit_mb == 0 {
            return Err(ConfigError::Invalid("body-limit-mb must be non-zero".into()));
        }
        if let Some(root) = &self.project_root
            && !root.is_dir()
        {
            return Err(ConfigError::Invalid(format!(
                "project-root {} is not a directory",
                root.display()
            )));
        }
        Ok(())
    }

    /// Configured project root, else the build workspace, else the current
    /// working directory.
    ///
    /// Compile-time source paths are relative to the workspace root, not to
    /// whatever directory the process starts in.
    pub fn resolved_project_root(&self) -> Option<PathBuf> {
        self.project_root
            .clone()
            .or_else(build_workspace_root)
            .or_else(|| std::env::current_dir().ok())
    }

    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_mb * 1024 * 1024
    }
}

/// Workspace root of this build (`crates/core` is two levels below it), if it
/// still exists on this machine.
fn build_workspace_root() -> Option<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .filter(|root| root.is_dir())
        .map(Path::to_path_buf)
}

// ─── Sub-configs ───────────────────────────────────────────────────────────

/// Running mode. Development responses carry diagnostic detail; production
/// responses never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    Development,
    #[default]
    Production,
}

impl AppEnv {
    pub fn is_development(self) -> bool {
        self == Self::Development
    }
}

impl FromStr for AppEnv {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigError::Invalid(format!("unknown app env: {other}"))),
        }
    }
}

impl std::fmt::Display for AppEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Production => "production",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LoggingConfig {
    pub level: String,
    pub to_file: bool,
    pub log_dir: Option<String>,
    /// Log every request on entry and completion.
    pub middleware: bool,
    /// Include request headers in the entry line.
    pub middleware_show_headers: bool,
    /// Log translated exceptions (structured and unhandled).
    pub exceptions: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            to_file: false,
            log_dir: None,
            middleware: true,
            middleware_show_headers: false,
            exceptions: false,
        }
    }
}
