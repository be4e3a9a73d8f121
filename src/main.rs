//! `unistore` operator CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;

use unistore::config::Config;
use unistore::crypto::SecretCodec;
use unistore::schema::builtin;
use unistore::service::UniversalDataService;

#[derive(Parser, Debug)]
#[command(name = "unistore")]
#[command(about = "Cross-engine persistence core tools")]
#[command(version)]
struct Cli {
    /// Log filter, e.g. `info` or `unistore=debug`
    #[arg(long, global = true, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the built-in tables on the configured engine
    Schema,

    /// Encrypt a value with the configured key
    Encrypt {
        plaintext: String,
    },

    /// Decrypt an `ivHex:cipherHex` value with the configured key
    Decrypt {
        secret: String,
    },

    /// Show the resolved configuration and check the engine connection
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    match cli.command {
        Command::Schema => {
            let service = UniversalDataService::from_config(&config.database)?;
            for descriptor in builtin::all() {
                let schema = service
                    .ensure_schema(descriptor)
                    .await
                    .context("Failed to ensure schema")?;
                println!("ok  {}", schema.table_name);
            }
        }
        Command::Encrypt { plaintext } => {
            let codec = SecretCodec::new(&config.encryption.key);
            println!("{}", codec.encrypt(&plaintext));
        }
        Command::Decrypt { secret } => {
            let codec = SecretCodec::new(&config.encryption.key);
            println!("{}", codec.decrypt(&secret)?);
        }
        Command::Doctor => doctor(&config).await?,
    }
    Ok(())
}

async fn doctor(config: &Config) -> Result<()> {
    let db = &config.database;
    println!("backend:          {}", db.backend);
    println!(
        "url:              {}",
        if db.url.as_ref().is_some_and(|u| !u.expose_secret().is_empty()) {
            "(set)"
        } else {
            "(unset)"
        }
    );
    println!("pool size:        {}", db.pool_size);
    println!("embedded path:    {}", db.embedded_path.display());
    println!("mongodb database: {}", db.mongodb_database);
    println!("conflict policy:  {:?}", db.schema_conflict_policy);
    println!(
        "encryption key:   {}",
        if config.encryption.using_default_key {
            "built-in default"
        } else {
            "configured"
        }
    );

    let service = UniversalDataService::from_config(db)?;
    match service.ping().await {
        Ok(()) => println!("engine:           reachable"),
        Err(e) => {
            println!("engine:           unreachable ({e})");
            anyhow::bail!("engine connection check failed");
        }
    }
    Ok(())
}
