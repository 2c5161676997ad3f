//! Dirmeta CLI - Per-directory metadata tool
//!
//! Reads and edits the metadata sidecar of a directory through the same
//! engine a file manager would use.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use dirmeta_common::MetadataConfig;
use dirmeta_store::types::{is_valid_key, is_xml_name};
use dirmeta_store::{Metafile, MetadataService};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dirmeta-cli")]
#[command(about = "Inspect and edit per-directory file metadata")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "dirmeta.toml")]
    config: String,

    /// Directory holding the sidecar documents
    #[arg(long, env = "DIRMETA_METAFILES_DIR")]
    metafiles_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a scalar value
    Get {
        /// Directory URI or absolute path
        directory: String,
        file: String,
        key: String,
        #[arg(short, long, default_value = "")]
        default: String,
    },
    /// Set a scalar value (setting the default clears it)
    Set {
        directory: String,
        file: String,
        key: String,
        value: String,
        #[arg(short, long, default_value = "")]
        default: String,
    },
    /// Print a list value, one entry per line
    GetList {
        directory: String,
        file: String,
        key: String,
        #[arg(short, long, default_value = "name")]
        subkey: String,
    },
    /// Replace a list value (no values clears it)
    SetList {
        directory: String,
        file: String,
        key: String,
        values: Vec<String>,
        #[arg(short, long, default_value = "name")]
        subkey: String,
    },
    /// List files that have metadata
    Files { directory: String },
    /// Remove all metadata for a file
    Remove { directory: String, file: String },
    /// Move metadata to a new file name
    Rename {
        directory: String,
        old_name: String,
        new_name: String,
    },
    /// Copy metadata to a file in another directory
    Copy {
        directory: String,
        file: String,
        destination_directory: String,
        destination_file: String,
    },
    /// Print the sidecar document of a directory
    Dump { directory: String },
    /// Load directories and show engine counters
    Stats { directories: Vec<String> },
}

/// Config file layout
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    metadata: MetadataConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load config file if it exists
    let config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    };

    // Merge CLI args with config file (CLI takes precedence)
    let mut metadata = config.metadata;
    if let Some(dir) = args.metafiles_dir {
        metadata.metafiles_dir = dir;
    }
    let log_level = if args.log_level == "warn" {
        config.logging.level
    } else {
        args.log_level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    debug!("Config file: {}", args.config);
    let service = MetadataService::with_fs(metadata)?;

    match args.command {
        Commands::Get {
            directory,
            file,
            key,
            default,
        } => {
            let metafile = open(&service, &directory).await;
            println!("{}", metafile.get(&file, &key, &default));
        }
        Commands::Set {
            directory,
            file,
            key,
            value,
            default,
        } => {
            require_key(&key)?;
            let metafile = open(&service, &directory).await;
            if metafile.set(&file, &key, &default, &value) {
                info!("Updated {key} on {file}");
            } else {
                println!("Unchanged");
            }
            metafile.flush().await;
        }
        Commands::GetList {
            directory,
            file,
            key,
            subkey,
        } => {
            let metafile = open(&service, &directory).await;
            for value in metafile.get_list(&file, &key, &subkey) {
                println!("{value}");
            }
        }
        Commands::SetList {
            directory,
            file,
            key,
            values,
            subkey,
        } => {
            require_key(&key)?;
            require_subkey(&subkey)?;
            let metafile = open(&service, &directory).await;
            if !metafile.set_list(&file, &key, &subkey, &values) {
                println!("Unchanged");
            }
            metafile.flush().await;
        }
        Commands::Files { directory } => {
            let metafile = open(&service, &directory).await;
            for name in metafile.file_names() {
                println!("{name}");
            }
        }
        Commands::Remove { directory, file } => {
            let metafile = open(&service, &directory).await;
            metafile.remove(&file);
            metafile.flush().await;
        }
        Commands::Rename {
            directory,
            old_name,
            new_name,
        } => {
            let metafile = open(&service, &directory).await;
            metafile.rename(&old_name, &new_name);
            metafile.flush().await;
        }
        Commands::Copy {
            directory,
            file,
            destination_directory,
            destination_file,
        } => {
            let source = open(&service, &directory).await;
            let destination = open(&service, &destination_directory).await;
            source.copy(&destination, &file, &destination_file);
            destination.flush().await;
        }
        Commands::Dump { directory } => {
            let metafile = service.get_for_uri(&directory);
            let path = metafile.sidecar_path();
            match tokio::fs::read_to_string(&path).await {
                Ok(xml) => print!("{xml}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    println!("No metadata stored for {}", metafile.directory_uri());
                }
                Err(e) => bail!("failed to read {}: {e}", path.display()),
            }
        }
        Commands::Stats { directories } => {
            let metafiles: Vec<_> = directories
                .iter()
                .map(|directory| service.open(directory))
                .collect();
            println!("Metafiles");
            println!("=========");
            println!("Live:             {}", service.live_metafiles());
            println!("Reads in flight:  {}", service.reads_in_flight());
            println!("Reads queued:     {}", service.reads_queued());
            println!("Pending copies:   {}", service.pending_copies());
            println!("Pending removals: {}", service.pending_removals());
            for metafile in &metafiles {
                metafile.wait_until_read().await;
                println!(
                    "{}: {} files ({})",
                    metafile.directory_uri(),
                    metafile.file_names().len(),
                    metafile.sidecar_path().display()
                );
            }
        }
    }

    Ok(())
}

async fn open(service: &MetadataService, directory: &str) -> Arc<Metafile> {
    let metafile = service.open(directory);
    metafile.wait_until_read().await;
    metafile
}

fn require_key(key: &str) -> Result<()> {
    if !is_valid_key(key) {
        bail!("{key:?} cannot be used as a metadata key");
    }
    Ok(())
}

fn require_subkey(subkey: &str) -> Result<()> {
    if !is_xml_name(subkey) {
        bail!("{subkey:?} cannot be used as a list subkey");
    }
    Ok(())
}
