//! Command-line interface.
//!
//! Without a subcommand the binary starts the HTTP server. Subcommands
//! work directly against the local database:
//! - `config check` - Validate configuration file
//! - `orgs list|create` - Manage organizations
//! - `repos list|add` - Record repositories for an organization
//! - `token status|refresh` - Inspect or renew an installation token

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Config, GitHubConfig};
use crate::crypto::SecretBox;
use crate::db::{self, DbPool, Organization, SqliteCredentialStore, LEGACY_GITHUB_PROVIDER};
use crate::github::{CredentialStore, HttpTransport, IntegrationCredential, TokenManager};

#[derive(Parser, Debug)]
#[command(name = "ghapp-bridge")]
#[command(author, version, about = "GitHub App integration service", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ghapp-bridge.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Subcommand to run (if none, starts the server)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configuration management commands
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Organization management
    #[command(subcommand)]
    Orgs(OrgsCommands),

    /// Repository records
    #[command(subcommand)]
    Repos(ReposCommands),

    /// Installation access tokens
    #[command(subcommand)]
    Token(TokenCommands),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate configuration file
    Check,
}

#[derive(Subcommand, Debug)]
pub enum OrgsCommands {
    List,
    Create {
        slug: String,
        /// Display name (defaults to the slug)
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ReposCommands {
    List {
        org: String,
        #[arg(long, default_value = LEGACY_GITHUB_PROVIDER)]
        provider: String,
    },
    Add {
        org: String,
        /// Fully-qualified name, e.g. acme/api
        name: String,
        #[arg(long, default_value = LEGACY_GITHUB_PROVIDER)]
        provider: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum TokenCommands {
    /// Show whether the stored token is still usable
    Status { integration_id: String },
    /// Exchange a new installation token now
    Refresh { integration_id: String },
}

/// Run a CLI command. Returns `false` when no subcommand was given and
/// the server should start instead.
pub async fn run_command(cli: &Cli) -> Result<bool> {
    let Some(command) = &cli.command else {
        return Ok(false);
    };

    if let Commands::Config(ConfigCommands::Check) = command {
        cmd_config_check(cli)?;
        return Ok(true);
    }

    let config = Config::load(&cli.config)?;
    let db = db::init(&config.server.data_dir).await?;

    match command {
        Commands::Config(_) => {}
        Commands::Orgs(OrgsCommands::List) => cmd_orgs_list(&db).await?,
        Commands::Orgs(OrgsCommands::Create { slug, name }) => {
            cmd_orgs_create(&db, slug, name.as_deref()).await?
        }
        Commands::Repos(ReposCommands::List { org, provider }) => {
            cmd_repos_list(&db, org, provider).await?
        }
        Commands::Repos(ReposCommands::Add {
            org,
            name,
            provider,
        }) => cmd_repos_add(&db, org, name, provider).await?,
        Commands::Token(TokenCommands::Status { integration_id }) => {
            cmd_token_status(&config, &db, integration_id).await?
        }
        Commands::Token(TokenCommands::Refresh { integration_id }) => {
            cmd_token_refresh(&config, &db, integration_id).await?
        }
    }
    Ok(true)
}

fn cmd_config_check(cli: &Cli) -> Result<()> {
    let config_path = &cli.config;

    println!("Checking configuration file: {}", config_path.display());
    println!();

    if !config_path.exists() {
        println!(
            "[!!] Configuration file not found: {}",
            config_path.display()
        );
        println!();
        println!("A default configuration will be used when starting the server.");
        return Ok(());
    }

    match Config::load(config_path) {
        Ok(config) => {
            println!("[OK] Configuration file is valid!");
            println!();
            println!("Server:");
            println!("  Host:         {}", config.server.host);
            println!("  Port:         {}", config.server.port);
            println!("  Data Dir:     {}", config.server.data_dir.display());
            println!();
            println!("GitHub:");
            println!("  API URL:      {}", config.github.api_url);
            println!(
                "  App Name:     {}",
                config.github.app_name.as_deref().unwrap_or("(not set)")
            );
            println!("  Cache TTL:    {}s", config.github.cache_ttl_secs);
            println!();
            println!("Outcomes:");
            println!("  URL:          {}", config.outcomes.url);
            println!("  Dataset:      {}", config.outcomes.dataset);
            println!();
            println!(
                "  Encryption:   {}",
                if config.auth.encryption_key.is_some() {
                    "Enabled"
                } else {
                    "Disabled (credentials stored in plaintext)"
                }
            );
            Ok(())
        }
        Err(e) => {
            println!("[!!] Configuration file is invalid: {:#}", e);
            Err(e)
        }
    }
}

async fn find_org(db: &DbPool, slug: &str) -> Result<Organization> {
    Organization::find_by_slug(db, slug)
        .await?
        .with_context(|| format!("Organization '{}' not found", slug))
}

async fn cmd_orgs_list(db: &DbPool) -> Result<()> {
    let orgs = Organization::list(db).await?;
    if orgs.is_empty() {
        println!("No organizations.");
        return Ok(());
    }
    println!("{:<6} {:<24} NAME", "ID", "SLUG");
    for org in orgs {
        println!("{:<6} {:<24} {}", org.id, org.slug, org.name);
    }
    Ok(())
}

async fn cmd_orgs_create(db: &DbPool, slug: &str, name: Option<&str>) -> Result<()> {
    let org = Organization::create(db, slug, name.unwrap_or(slug)).await?;
    println!("[OK] Created organization {} (id {})", org.slug, org.id);
    Ok(())
}

async fn cmd_repos_list(db: &DbPool, org: &str, provider: &str) -> Result<()> {
    let org = find_org(db, org).await?;
    for repo in db::Repository::list_for_provider(db, org.id, provider).await? {
        println!(
            "{:<40} {}",
            repo.name,
            repo.integration_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_repos_add(db: &DbPool, org: &str, name: &str, provider: &str) -> Result<()> {
    let org = find_org(db, org).await?;
    let repo = db::Repository::create(db, org.id, name, provider, None).await?;
    println!("[OK] Recorded {} for {} ({})", repo.name, org.slug, provider);
    Ok(())
}

fn credential_store(config: &Config, db: &DbPool) -> SqliteCredentialStore {
    SqliteCredentialStore::new(
        db.clone(),
        SecretBox::new(config.auth.encryption_key.as_deref()),
    )
}

async fn cmd_token_status(config: &Config, db: &DbPool, integration_id: &str) -> Result<()> {
    let credential = credential_store(config, db).load(integration_id).await?;
    let state = if credential.is_valid(Utc::now()) {
        "[OK] valid"
    } else {
        "[!!] expired or missing"
    };
    println!(
        "{} (installation {}, expires {})",
        state,
        credential.external_id,
        credential.expires_at.as_deref().unwrap_or("never issued")
    );
    Ok(())
}

async fn cmd_token_refresh(config: &Config, db: &DbPool, integration_id: &str) -> Result<()> {
    let store = Arc::new(credential_store(config, db));
    let refreshed = refresh_token(&config.github, store, integration_id).await?;
    println!(
        "[OK] Installation {} token refreshed, expires {}",
        refreshed.external_id,
        refreshed.expires_at.as_deref().unwrap_or("-")
    );
    Ok(())
}

/// Exchange and persist a new token; fails if it could not be saved.
async fn refresh_token(
    github: &GitHubConfig,
    store: Arc<dyn CredentialStore>,
    integration_id: &str,
) -> Result<IntegrationCredential> {
    let credential = store.load(integration_id).await?;
    let transport = HttpTransport::new(github, credential.verify_ssl)?;
    let tokens = TokenManager::new(credential, transport, store, github.jwt_ttl_secs)?;
    Ok(tokens.refresh_and_persist().await?)
}
