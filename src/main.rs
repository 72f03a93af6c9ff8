use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};

use userportal_client::api::PortalApi;
use userportal_client::auth::{redact, SessionContext, SessionEvent, SqliteStore};
use userportal_client::config::{
    self, AddressCommand, CliArgs, Command, Config, FilesCommand, ProfileCommand,
};
use userportal_client::http_client::AuthenticatedClient;
use userportal_client::models::{AddressPatch, NewAddress};

/// Exit code when the session could not be recovered
const EXIT_SESSION_EXPIRED: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::from_args(&args)?;
    config.validate()?;

    // Initialize logging with a configured level; stdout is reserved for output
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("API base URL: {}", config.api_base_url);

    let store = Arc::new(SqliteStore::open(&config.session_db_file)?);
    let session = Arc::new(SessionContext::new(store));
    let mut events = session.subscribe();

    let client = Arc::new(AuthenticatedClient::new(
        session.clone(),
        config.api_base_url.clone(),
        config.http_max_connections,
        config.http_connect_timeout,
        config.http_request_timeout,
    )?);
    let api = PortalApi::new(client);

    match run(&api, &config, args.command).await {
        Ok(()) => Ok(()),
        Err(e) => {
            // Sending the user back to login is decided here, not in the pipeline
            if session_terminated(&mut events) {
                tracing::debug!("Command failed after session termination: {:#}", e);
                eprintln!("Session expired. Run `userportal login` to sign in again.");
                std::process::exit(EXIT_SESSION_EXPIRED);
            }
            Err(e)
        }
    }
}

async fn run(api: &PortalApi, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Login { username, password } => {
            let (username, password) = config::prompt_login(username, password)?;
            api.client().login(&username, &password).await?;
            println!("Logged in as {}", username);
        }

        Command::Logout => {
            api.client().logout()?;
            println!("Logged out");
        }

        Command::Status => {
            let session = api.client().session();
            print_json(&serde_json::json!({
                "authenticated": session.is_authenticated(),
                "authorization": session.default_authorization().map(|value| redact(&value)),
                "api": config.api_base_url,
                "session_file": config.session_db_file,
            }))?;
        }

        Command::Files { action } => match action {
            FilesCommand::List => print_json(&api.list_files().await?)?,
            FilesCommand::Upload { path, description } => {
                let file_name = file_name_of(&path)?;
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let uploaded = api
                    .upload_file(&file_name, data, description.as_deref())
                    .await?;
                print_json(&uploaded)?;
            }
            FilesCommand::Show { id } => print_json(&api.get_file(id).await?)?,
            FilesCommand::Delete { id } => {
                api.delete_file(id).await?;
                println!("Deleted file {}", id);
            }
        },

        Command::Dashboard => print_json(&api.dashboard().await?)?,

        Command::Profile { action } => match action {
            ProfileCommand::Show => print_json(&api.profile().await?)?,
            ProfileCommand::Username { username } => {
                print_json(&api.update_username(&username).await?)?
            }
            ProfileCommand::Phone { phone_number } => {
                print_json(&api.update_phone(&phone_number).await?)?
            }
        },

        Command::Address { action } => match action {
            AddressCommand::List => print_json(&api.list_addresses().await?)?,
            AddressCommand::Add(fields) => {
                let address = NewAddress {
                    street: fields.street,
                    city: fields.city,
                    state: fields.state,
                    country: fields.country,
                    postal_code: fields.postal_code,
                };
                print_json(&api.add_address(&address).await?)?;
            }
            AddressCommand::Update { id, fields } => {
                let patch = AddressPatch {
                    street: fields.street,
                    city: fields.city,
                    state: fields.state,
                    country: fields.country,
                    postal_code: fields.postal_code,
                };
                if patch.is_empty() {
                    anyhow::bail!("Nothing to update: pass at least one address field");
                }
                print_json(&api.update_address(id, &patch).await?)?;
            }
            AddressCommand::Delete { id } => {
                api.delete_address(id).await?;
                println!("Deleted address {}", id);
            }
        },
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("Not a file path: {}", path.display()))
}

/// Drain pending events and report whether the session was torn down
fn session_terminated(events: &mut broadcast::Receiver<SessionEvent>) -> bool {
    loop {
        match events.try_recv() {
            Ok(SessionEvent::Terminated { reason }) => {
                tracing::warn!(reason = %reason, "Session terminated");
                return true;
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return false,
        }
    }
}
