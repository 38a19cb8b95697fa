//! SmartGrow CLI - command-line access to the SmartGrow greenhouse backend.
//!
//! Signs in, keeps the session alive through the core transport, and issues
//! authenticated requests against the REST API.

use std::io::{self, Write};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use smartgrow_core::models::{LoginCredentials, RegisterCredentials};
use smartgrow_core::transport::RequestDescriptor;
use smartgrow_core::{ApiClient, ApiError, Config, SessionEvent};

/// Environment variable consulted before prompting for a password
const PASSWORD_ENV: &str = "SMARTGROW_PASSWORD";

const USAGE: &str = "\
Usage: smartgrow <command>

Commands:
  login [email]      Sign in and store the session
  register [email]   Create an account and sign in
  logout             Forget the stored session
  status             Show whether a session is stored
  health             Query the backend health check
  get <path>         Authenticated GET, prints the response body
  delete-account     Delete the signed-in account";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };

    let mut config = Config::load().context("Failed to load configuration")?;
    debug!(api = %config.api_base_url, backend = ?config.credential_backend, "Config loaded");

    let client = ApiClient::new(&config).context("Failed to create API client")?;
    watch_session(&client);

    let result = match command {
        "login" => login(&client, &mut config, args.get(1)).await,
        "register" => register(&client, &mut config, args.get(1)).await,
        "logout" => logout(&client),
        "status" => status(&client),
        "health" => health(&client).await,
        "get" => match args.get(1) {
            Some(path) => get(&client, path).await,
            None => Err(anyhow::anyhow!("get needs a path, e.g. `smartgrow get Greenhouse`")),
        },
        "delete-account" => delete_account(&client).await,
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            return Ok(());
        }
    };

    if let Err(ref e) = result {
        if matches!(e.downcast_ref::<ApiError>(), Some(err) if err.is_session_ended()) {
            eprintln!("Your session has ended. Run `smartgrow login` to sign in again.");
        }
    }
    result
}

/// Log session transitions published by the transport.
fn watch_session(client: &ApiClient) {
    let mut events = client.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Expired { redirect_to, reason }) => {
                    warn!(%reason, %redirect_to, "Session expired");
                }
                Ok(event) => info!(?event, "Session event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Session watcher lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn prompt_email(config: &Config, arg: Option<&String>) -> Result<String> {
    if let Some(email) = arg {
        return Ok(email.clone());
    }

    match config.last_email {
        Some(ref last) => print!("Email [{}]: ", last),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut email = String::new();
    io::stdin().read_line(&mut email)?;
    let email = email.trim();
    match (email.is_empty(), &config.last_email) {
        (true, Some(last)) => Ok(last.clone()),
        (true, None) => Err(anyhow::anyhow!("Email required")),
        (false, _) => Ok(email.to_string()),
    }
}

fn prompt_password(prompt: &str) -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    let password = rpassword::prompt_password(prompt)?;
    Ok(password)
}

fn remember_email(config: &mut Config, email: &str) {
    config.last_email = Some(email.to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}

async fn login(client: &ApiClient, config: &mut Config, email: Option<&String>) -> Result<()> {
    let email = prompt_email(config, email)?;
    let password = prompt_password("Password: ")?;

    println!("Signing in...");
    let auth = client
        .login(&LoginCredentials { email, password })
        .await
        .map_err(|e| match e {
            ApiError::Unauthorized(_) => anyhow::anyhow!("Invalid email or password"),
            other => anyhow::Error::new(other).context("Login failed"),
        })?;

    remember_email(config, &auth.email);
    println!("Signed in as {}", auth.email);
    Ok(())
}

async fn register(client: &ApiClient, config: &mut Config, email: Option<&String>) -> Result<()> {
    let email = prompt_email(config, email)?;
    let password = prompt_password("Password: ")?;
    let password_confirmation = if std::env::var(PASSWORD_ENV).is_ok() {
        password.clone()
    } else {
        rpassword::prompt_password("Confirm password: ")?
    };

    let auth = client
        .register(&RegisterCredentials {
            email,
            password,
            password_confirmation,
        })
        .await
        .context("Registration failed")?;

    remember_email(config, &auth.email);
    println!("Registered and signed in as {}", auth.email);
    Ok(())
}

fn logout(client: &ApiClient) -> Result<()> {
    client.logout().context("Failed to clear session")?;
    println!("Signed out");
    Ok(())
}

fn status(client: &ApiClient) -> Result<()> {
    if client.is_authenticated()? {
        let email = client.user_email()?.unwrap_or_else(|| "unknown user".to_string());
        println!("Signed in as {}", email);
    } else {
        println!("Not signed in");
    }
    Ok(())
}

async fn health(client: &ApiClient) -> Result<()> {
    let health = client.health().await.context("Health check failed")?;
    println!("{}", health.status);
    if !health.is_healthy() {
        return Err(anyhow::anyhow!("Backend reports {}", health.status));
    }
    Ok(())
}

async fn get(client: &ApiClient, path: &str) -> Result<()> {
    let response = client.send(RequestDescriptor::get(path)).await?;

    match serde_json::from_slice::<serde_json::Value>(&response.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.text()),
    }
    Ok(())
}

async fn delete_account(client: &ApiClient) -> Result<()> {
    print!("Delete your account and all greenhouse data? Type 'yes' to confirm: ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    if answer.trim() != "yes" {
        println!("Cancelled");
        return Ok(());
    }

    client.delete_user().await.context("Failed to delete account")?;
    println!("Account deleted");
    Ok(())
}
