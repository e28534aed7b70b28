mod cli;

use reliquary::config::{self, Config};
use reliquary::player::{self, Player, JOIN_COUNT};
use reliquary_core::BackendKind;
use reliquary_db::{Record, Store, Value};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use uuid::Uuid;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "reliquary=debug,reliquary_db=debug,reliquary_core=debug".to_string()
        } else {
            "reliquary=info,reliquary_db=warn,reliquary_core=warn".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("reliquary {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let config = config::load_config_or_default(cli.config.as_deref())?;
            let result = execute(config, command);
            if let Err(e) = &result {
                tracing::error!("{e:#}");
            }
            result
        }
    }
}

/// Connect, then run one command on a fresh runtime.
///
/// Connecting builds the pool and creates tables on the calling thread,
/// before any async worker exists.
fn execute(config: Config, command: Commands) -> Result<()> {
    let store = open_store(config)?;
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(&store, command));
    store.disconnect();
    result
}

async fn run(store: &Store, command: Commands) -> Result<()> {
    match command {
        Commands::Join { uuid, username } => join(store, uuid, &username).await,
        Commands::List => list(store).await,
        Commands::Show { uuid, json } => show(store, uuid, json).await,
        Commands::Set { uuid, key, value } => set(store, uuid, &key, &value).await,
        Commands::Delete { uuid } => delete(store, uuid).await,
        Commands::Validate { .. } | Commands::Version => Ok(()),
    }
}

fn open_store(config: Config) -> Result<Store> {
    let backend = config.storage.backend;
    let store = Store::new(config.storage);
    store.register::<Player>()?;
    store
        .connect()
        .with_context(|| format!("Failed to connect to {backend} storage"))?;
    Ok(store)
}

async fn join(store: &Store, uuid: Uuid, username: &str) -> Result<()> {
    let record = player::join(store, uuid, username).await?;
    let joins = record.get::<i64>(JOIN_COUNT).unwrap_or(1);
    if joins == 1 {
        println!("Welcome, {username}!");
    } else {
        println!("Welcome back, {username} (join #{joins})");
    }
    Ok(())
}

async fn list(store: &Store) -> Result<()> {
    let players = store.load_all::<Player>()?.await?;
    println!("{} player(s)", players.len());
    for record in &players {
        println!(
            "  {}  {:<16}  joins: {}",
            record.identity(),
            record.username.as_deref().unwrap_or("-"),
            record.get::<i64>(JOIN_COUNT).unwrap_or(0)
        );
    }
    Ok(())
}

async fn show(store: &Store, uuid: Uuid, json: bool) -> Result<()> {
    let record = load_existing(store, uuid).await?;
    let mut attributes: Vec<(String, Value)> = vec![
        ("uuid".to_string(), record.identity()),
        ("username".to_string(), record.username.clone().into()),
    ];
    let mut dynamic: Vec<_> = record
        .attributes()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    dynamic.sort_by(|a, b| a.0.cmp(&b.0));
    attributes.extend(dynamic);

    if json {
        let map: serde_json::Map<String, serde_json::Value> = attributes
            .into_iter()
            .map(|(k, v)| Ok((k, serde_json::to_value(v)?)))
            .collect::<Result<_>>()?;
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        for (key, value) in attributes {
            println!("{key}: {value}");
        }
    }
    Ok(())
}

async fn set(store: &Store, uuid: Uuid, key: &str, raw: &str) -> Result<()> {
    let mut record = load_existing(store, uuid).await?;
    let value = parse_value(raw);
    record
        .set(key, value.clone())
        .await
        .with_context(|| format!("Failed to set '{key}'"))?;
    store.save(record).await?;
    println!("{key} = {value}");
    Ok(())
}

async fn delete(store: &Store, uuid: Uuid) -> Result<()> {
    if store.delete::<Player>(uuid)?.await? {
        println!("Deleted player {uuid}");
    } else {
        println!("No player with uuid {uuid}");
    }
    Ok(())
}

async fn load_existing(store: &Store, uuid: Uuid) -> Result<Record<Player>> {
    store
        .load::<Player>(uuid)?
        .await?
        .with_context(|| format!("No player with uuid {uuid}"))
}

/// Integers, decimals and booleans keep their kind; anything else is text.
fn parse_value(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        Value::Integer(i)
    } else if let Some(f) = raw.parse::<f64>().ok().filter(|f| f.is_finite()) {
        Value::Real(f)
    } else if let Ok(b) = raw.parse::<bool>() {
        Value::Boolean(b)
    } else {
        Value::Text(raw.to_string())
    }
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            config::load_config(p)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let storage = &config.storage;
    println!("✓ Configuration is valid");
    println!("  Backend: {}", storage.backend);
    match storage.backend {
        BackendKind::Sqlite => println!("  Database file: {}", storage.sqlite.path.display()),
        BackendKind::Mysql => println!(
            "  Server: {} (database '{}', user '{}')",
            storage.mysql.address, storage.mysql.database, storage.mysql.username
        ),
    }
    println!("  Pool size: {}", storage.pool.max_size);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_value_keeps_kinds() {
        assert_eq!(parse_value("42"), Value::Integer(42));
        assert_eq!(parse_value("-1.5"), Value::Real(-1.5));
        assert_eq!(parse_value("true"), Value::Boolean(true));
        assert_eq!(parse_value("north"), Value::Text("north".into()));
        assert_eq!(parse_value("NaN"), Value::Text("NaN".into()));
    }

    #[test]
    fn execute_connects_before_entering_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            storage: reliquary_core::StorageConfig::sqlite(dir.path().join("players.db")),
        };

        execute(
            config.clone(),
            Commands::Join {
                uuid: Uuid::new_v4(),
                username: "Bob".into(),
            },
        )
        .unwrap();
        execute(config, Commands::List).unwrap();
        assert!(dir.path().join("players.db").exists());
    }
}
