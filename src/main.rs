//! stackfs - Layered copy-on-write filesystem
//!
//! Usage:
//!   stackfs mount <mount_point> [--layer L]...  - Mount a writable layer over base layers
//!   stackfs unmount <mount_point>               - Unmount the filesystem
//!   stackfs id <mount_point>                    - Show the layer id of a mountpoint
//!   stackfs layers                              - List allocated layer ids
//!   stackfs diff <layer>                        - Show entries recorded in a layer
//!
//! Set `STACKFS_LOG` (e.g. `stackfs=debug`) to override the log filter.

use clap::{Parser, Subcommand};
use stackfs::{config::Config, Engine, MountOptions, Result, ServeOptions};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "stackfs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Layered copy-on-write filesystem")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/stackfs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a writable layer, stacked on base layers
    Mount {
        /// Mount point directory
        mount_point: PathBuf,

        /// Base layer, bottom first; repeat for more
        #[arg(short, long = "layer")]
        layers: Vec<String>,

        /// Writable layer id (allocated from the mount point if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point directory
        mount_point: PathBuf,
    },

    /// Print the layer id of a mount point, allocating it if needed
    Id {
        /// Mount point directory
        mount_point: PathBuf,
    },

    /// List mount points and their layer ids
    Layers,

    /// Print the entries recorded in a layer
    Diff {
        /// Layer id
        layer: String,

        /// Only show this path and what is below it
        #[arg(long, default_value = "/")]
        prefix: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let config_path = expand_tilde(&cli.config);
    let config = Config::load_or_default(&config_path);

    // Setup logging; the configured filter already carries STACKFS_LOG
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config
            .as_ref()
            .map(|c| c.logging.level.to_ascii_lowercase())
            .unwrap_or_else(|_| "info".to_string())
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let result = config.and_then(|config| run_command(cli.command, &config));
    if let Err(e) = result {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Mount {
            mount_point,
            layers,
            id,
            allow_other,
        } => cmd_mount(config, &mount_point, layers, id, allow_other),

        Commands::Unmount { mount_point } => Engine::unmount(&mount_point),

        Commands::Id { mount_point } => cmd_id(config, &mount_point),

        Commands::Layers => cmd_layers(config),

        Commands::Diff { layer, prefix } => cmd_diff(config, &layer, &prefix),
    }
}

fn cmd_mount(
    config: &Config,
    mount_point: &Path,
    layers: Vec<String>,
    id: Option<String>,
    allow_other: bool,
) -> Result<()> {
    let layers = if layers.is_empty() {
        config.mount.layers.clone()
    } else {
        layers
    };

    let engine = Engine::open(&config.home)?;
    let mount = engine.mount(mount_point, MountOptions { layers, id })?;

    info!(
        "Mounting layer {} at {:?} over {:?}",
        mount.id(),
        mount.mountpoint(),
        mount.layers().lower()
    );

    let options = ServeOptions {
        allow_other: allow_other || config.mount.allow_other,
        auto_unmount: config.mount.auto_unmount,
    };
    mount.serve_foreground(&options)
}

fn cmd_id(config: &Config, mount_point: &Path) -> Result<()> {
    let engine = Engine::open(&config.home)?;
    println!("{}", engine.layer_id(mount_point)?);
    Ok(())
}

fn cmd_layers(config: &Config) -> Result<()> {
    let engine = Engine::open(&config.home)?;
    let ids = engine.layer_ids()?;

    if ids.is_empty() {
        println!("No layers allocated.");
        return Ok(());
    }

    println!("{:<8} MOUNT POINT", "LAYER");
    for (mount_point, id) in ids {
        println!("{:<8} {}", id, mount_point);
    }
    Ok(())
}

fn cmd_diff(config: &Config, layer: &str, prefix: &str) -> Result<()> {
    let engine = Engine::open(&config.home)?;
    let entries = engine.database().metadata.scan_layer(layer, prefix)?;

    for (path, entry) in &entries {
        if entry.deleted {
            println!("- {}", path);
            continue;
        }
        match (entry.mode, entry.ino) {
            (Some(mode), Some(ino)) => println!("+ {} (mode {:o}, inode {})", path, mode, ino),
            _ => println!("+ {}", path),
        }
    }

    println!();
    println!("{} entries in layer {}", entries.len(), layer);
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
