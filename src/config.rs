use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::http_client::HttpSettings;

/// VidTube - command-line session client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the content API
    #[arg(
        short = 'u',
        long,
        env = "API_BASE_URL",
        default_value = "http://localhost:8000/api/v1"
    )]
    pub api_url: String,

    /// Path to the credential database
    #[arg(short = 'd', long, env = "CREDENTIAL_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Log format (pretty, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Sign in with email and password
    Login {
        #[arg(short, long)]
        email: String,
        /// Password (prompted when omitted)
        #[arg(long, env = "VIDTUBE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Create an account and sign in
    Register {
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        username: String,
        #[arg(short, long)]
        email: String,
        /// Avatar image file (required)
        #[arg(long)]
        avatar: Option<PathBuf>,
        /// Cover image file
        #[arg(long)]
        cover_image: Option<PathBuf>,
    },
    /// Sign out
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Update full name and/or email
    UpdateAccount {
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Change the account password
    ChangePassword,
    /// Replace the avatar image
    Avatar { path: PathBuf },
    /// Replace the cover image
    CoverImage { path: PathBuf },
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_base_url: String,

    // Credential storage
    pub credential_db_file: PathBuf,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > .env > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let config = Self::from_args(&args)?;
        Ok((config, args.command))
    }

    /// Build configuration from parsed arguments
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let credential_db_file = match &args.db_file {
            Some(path) => expand_tilde(path),
            None => default_credential_db()?,
        };

        Ok(Config {
            api_base_url: args.api_url.trim_end_matches('/').to_string(),
            credential_db_file,
            http_connect_timeout: args.connect_timeout,
            http_request_timeout: args.http_timeout,
            log_level: args.log_level.clone(),
            log_format: parse_log_format(&args.log_format),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.api_base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", self.api_base_url))?;

        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!(
                "API_BASE_URL must use http or https, got: {}",
                url.scheme()
            );
        }

        if self.http_connect_timeout == 0 || self.http_request_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        Ok(())
    }

    /// Connection settings for the API client
    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            base_url: self.api_base_url.clone(),
            connect_timeout: self.http_connect_timeout,
            request_timeout: self.http_request_timeout,
        }
    }
}

/// Default credential database under the user data directory
fn default_credential_db() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .context("Could not determine a data directory; set CREDENTIAL_DB_FILE")?;
    Ok(data_dir.join("vidtube").join("credentials.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}
