//! Session login demo
//!
//! Logs in with one of the three schemes, prints when the token expires,
//! and optionally issues an authenticated GET against the API.
//!
//! Endpoints come from the environment (`BEARER_SESSION_AUTH_URL`,
//! `BEARER_SESSION_API_URL`, ...). Secrets are read from the environment
//! too, never from the command line.
//!
//! Run with:
//!   BEARER_SESSION_AUTH_URL=https://auth.example.com/api/v1 \
//!   BEARER_SESSION_PASSWORD=... \
//!   cargo run -p session-login -- password --username alice --get items
//!
//!   RUST_LOG=bearer_session=debug cargo run -p session-login -- device --client-id cli

use anyhow::{Context, Result};
use bearer_session::{
    AuthenticatedTransport, Authenticator, CertificateMaterial, Credentials, HttpTransport, RefreshPolicy,
    SessionConfig,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Log in and optionally call the API
#[derive(Parser, Debug)]
#[command(name = "session-login")]
#[command(about = "Obtain a session token with bearer-session")]
struct Args {
    #[command(subcommand)]
    scheme: Scheme,

    /// API path to GET with the session token, relative to the API URL
    #[arg(long, global = true)]
    get: Option<String>,

    /// Call logout once done
    #[arg(long, global = true)]
    logout: bool,
}

#[derive(Subcommand, Debug)]
enum Scheme {
    /// Basic login; secret from BEARER_SESSION_PASSWORD
    Password {
        #[arg(long)]
        username: String,
    },
    /// Signed challenge with a PEM certificate and key
    Certificate {
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        key: PathBuf,
    },
    /// Entry of an encrypted keystore; password from BEARER_SESSION_KEYSTORE_PASSWORD
    Keystore {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        alias: String,
    },
    /// OAuth device authorization with a persisted refresh token
    Device {
        #[arg(long)]
        client_id: String,
        /// The server rotates refresh tokens on every use
        #[arg(long)]
        rotatable: bool,
        /// Register again even if a refresh token is stored
        #[arg(long)]
        force_register: bool,
        /// Delete the stored refresh token and exit
        #[arg(long)]
        forget: bool,
    },
}

fn secret(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} is not set"))
}

fn credentials(scheme: &Scheme) -> Result<Credentials> {
    Ok(match scheme {
        Scheme::Password { username } => Credentials::password(username, secret("BEARER_SESSION_PASSWORD")?),
        Scheme::Certificate { cert, key } => {
            Credentials::certificate(CertificateMaterial::from_pem_files(cert, key)?)
        }
        Scheme::Keystore { path, alias } => {
            Credentials::from_keystore(path, &secret("BEARER_SESSION_KEYSTORE_PASSWORD")?, alias)?
        }
        Scheme::Device {
            client_id,
            rotatable,
            force_register,
            ..
        } => {
            let policy = if *rotatable {
                RefreshPolicy::Rotatable
            } else {
                RefreshPolicy::NonRotatable
            };
            Credentials::device(client_id, policy, *force_register)
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = SessionConfig::from_env().context("Failed to load configuration")?;
    let http = Arc::new(HttpTransport::new(config)?);
    let authenticator = Arc::new(Authenticator::from_credentials(credentials(&args.scheme)?, http)?);

    if let Scheme::Device { forget: true, .. } = args.scheme {
        authenticator.clear_refresh_token_entry()?;
        println!("Stored refresh token removed");
        return Ok(());
    }

    authenticator.get_token().await.context("Login failed")?;
    if let Some(expires_at) = authenticator.expires_at().await {
        println!("Logged in with {} scheme, token expires at {expires_at}", authenticator.scheme_name());
    }

    if let Some(path) = &args.get {
        let api = AuthenticatedTransport::new(authenticator.clone());
        let body: serde_json::Value = api.get_json(path).await?;
        println!("{}", serde_json::to_string_pretty(&body)?);
    }

    if args.logout {
        authenticator.logout().await?;
        println!("Logged out");
    }
    Ok(())
}
