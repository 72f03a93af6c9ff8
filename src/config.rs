use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::{Input, Password};
use std::path::PathBuf;

/// User portal client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend API base URL
    #[arg(short = 'u', long, env = "API_BASE_URL", default_value = "http://127.0.0.1:8000/api")]
    pub api_url: String,

    /// Path to the SQLite session file holding the credentials
    #[arg(short = 's', long, env = "SESSION_DB_FILE")]
    pub session_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Log in and store the session credentials
    Login {
        #[arg(short = 'n', long)]
        username: Option<String>,

        #[arg(short = 'p', long, env = "USERPORTAL_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Forget the stored credentials
    Logout,
    /// Show whether a session is stored
    Status,
    /// Manage uploaded files
    Files {
        #[command(subcommand)]
        action: FilesCommand,
    },
    /// Show upload statistics
    Dashboard,
    /// Show or edit the user profile
    Profile {
        #[command(subcommand)]
        action: ProfileCommand,
    },
    /// Manage saved addresses
    Address {
        #[command(subcommand)]
        action: AddressCommand,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum FilesCommand {
    List,
    Upload {
        path: PathBuf,
        #[arg(short, long)]
        description: Option<String>,
    },
    Show {
        id: i64,
    },
    Delete {
        id: i64,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ProfileCommand {
    Show,
    Username { username: String },
    Phone { phone_number: String },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum AddressCommand {
    List,
    Add(AddressFields),
    Update {
        id: i64,
        #[command(flatten)]
        fields: AddressUpdateFields,
    },
    Delete {
        id: i64,
    },
}

#[derive(Args, Debug, PartialEq)]
pub struct AddressFields {
    #[arg(long)]
    pub street: String,
    #[arg(long)]
    pub city: String,
    #[arg(long)]
    pub state: String,
    #[arg(long)]
    pub country: String,
    #[arg(long)]
    pub postal_code: String,
}

#[derive(Args, Debug, PartialEq)]
pub struct AddressUpdateFields {
    #[arg(long)]
    pub street: Option<String>,
    #[arg(long)]
    pub city: Option<String>,
    #[arg(long)]
    pub state: Option<String>,
    #[arg(long)]
    pub country: Option<String>,
    #[arg(long)]
    pub postal_code: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_base_url: String,

    // Session persistence
    pub session_db_file: PathBuf,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Build configuration from parsed arguments. Priority: CLI > ENV > defaults
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let config = Config {
            api_base_url: args.api_url.trim_end_matches('/').to_string(),

            session_db_file: args
                .session_file
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(default_session_path),

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_connect_timeout: args.connect_timeout,

            http_request_timeout: args.http_timeout,

            log_level: args.log_level.clone(),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.api_base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", self.api_base_url))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            anyhow::bail!("API_BASE_URL must use http or https: {}", self.api_base_url);
        }

        if self.session_db_file.is_dir() {
            anyhow::bail!(
                "SESSION_DB_FILE points to a directory: {}",
                self.session_db_file.display()
            );
        }

        Ok(())
    }
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

/// Default session file under the platform data directory
fn default_session_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("userportal"))
        .unwrap_or_else(|| PathBuf::from(".userportal"))
        .join("session.sqlite3")
}

// === Interactive Login ===

/// Fill in missing login credentials from the terminal
pub fn prompt_login(
    username: Option<String>,
    password: Option<String>,
) -> Result<(String, String)> {
    let username = match username {
        Some(username) => username,
        None => Input::new()
            .with_prompt("Username")
            .interact_text()
            .context("Failed to read username")?,
    };

    let password = match password {
        Some(password) => password,
        None => Password::new()
            .with_prompt("Password")
            .interact()
            .context("Failed to read password")?,
    };

    if username.is_empty() || password.is_empty() {
        anyhow::bail!("Username and password cannot be empty");
    }

    Ok((username, password))
}
