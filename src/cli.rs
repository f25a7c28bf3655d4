//! CLI argument parsing with subcommand architecture.

use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "omni",
    version,
    about = "Request-scoped context and exception translation for HTTP services"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Arguments for the default `run` command
    #[command(flatten)]
    pub run: RunArgs,
}

impl Cli {
    /// The subcommand to execute; a bare invocation runs the server with the
    /// top-level arguments (env fallbacks included).
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Run(self.run))
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the server (default when no subcommand is given)
    Run(RunArgs),
    /// Print the effective configuration after overrides and exit
    Config(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to config file
    #[arg(short, long, default_value = "config.yaml", env = "OMNI_CONFIG")]
    pub config: String,

    /// Listen host
    #[arg(long, env = "OMNI_HOST")]
    pub host: Option<String>,

    /// Listen port
    #[arg(long, env = "OMNI_PORT")]
    pub port: Option<u16>,

    /// Log level (overrides config)
    #[arg(long, env = "OMNI_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Running mode: development or production
    #[arg(long, env = "APP_ENV")]
    pub app_env: Option<String>,

    /// Log translated exceptions
    #[arg(long, env = "LOGGER_EXCEPTIONS", value_parser = BoolishValueParser::new())]
    pub log_exceptions: Option<bool>,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            config: "config.yaml".to_string(),
            host: None,
            port: None,
            log_level: None,
            app_env: None,
            log_exceptions: None,
        }
    }
}
