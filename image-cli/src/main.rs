// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use image_engine::{
    EngineConfig, HostBackend, ImageInspection, LoopOps, connect_image, create_image,
    inspect_device, kernel_cmdline_args, load_layout,
};

/// Resolve, mount and build partitioned disk images
#[derive(Parser)]
#[command(name = "image-mount")]
#[command(about = "Resolve the partitions and mounts of a disk image", long_about = None)]
struct Cli {
    /// Engine settings (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the partition table, root filesystem, verity metadata and mount plan
    Inspect {
        /// Disk image file
        image: PathBuf,
    },
    /// Print only the ordered mount plan
    Plan {
        /// Disk image file
        image: PathBuf,
        /// Mount every entry read-only
        #[arg(long)]
        read_only: bool,
    },
    /// Mount the image under a chroot directory until Enter is pressed
    Mount {
        /// Disk image file
        image: PathBuf,
        /// Mount every entry read-only
        #[arg(long)]
        read_only: bool,
        /// Do not mount /dev, /proc, /sys, /run and /dev/pts
        #[arg(long)]
        no_default_mounts: bool,
    },
    /// Partition and format a new image from a layout file
    Create {
        /// Disk image file; created sparse at the layout's max_size if missing
        image: PathBuf,
        /// Disk layout (TOML)
        #[arg(long)]
        layout: PathBuf,
    },
    /// Print the kernel arguments that activate the image's verity root
    Cmdline {
        /// Disk image file
        image: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct MountedOutput<'a> {
    chroot_dir: &'a Path,
    device: Option<&'a str>,
    mounts: usize,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Attach `image`, inspect it and detach again
fn inspect_image(image: &Path, config: &EngineConfig) -> Result<ImageInspection> {
    let backend = HostBackend;
    let device = backend
        .attach(image)
        .with_context(|| format!("Failed to attach {}", image.display()))?;

    let inspection = inspect_device(&backend, device.device_path(), config)
        .with_context(|| format!("Failed to inspect {}", image.display()))?;

    device.detach()?;
    Ok(inspection)
}

fn wait_for_enter() -> Result<()> {
    eprintln!("Press Enter to unmount");
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Inspect { image } => {
            let inspection = inspect_image(&image, &config)?;
            print_json(&inspection)?;
        }
        Commands::Plan { image, read_only } => {
            config.plan.read_only |= read_only;
            let inspection = inspect_image(&image, &config)?;
            print_json(&inspection.plan)?;
        }
        Commands::Mount {
            image,
            read_only,
            no_default_mounts,
        } => {
            config.plan.read_only |= read_only;
            if no_default_mounts {
                config.plan.include_default_mounts = false;
            }

            let connection = connect_image(&HostBackend, &image, &config)
                .with_context(|| format!("Failed to mount {}", image.display()))?;
            print_json(&MountedOutput {
                chroot_dir: connection.chroot_dir(),
                device: connection.device_path(),
                mounts: connection.inspection().plan.len(),
            })?;

            // unmount even when stdin is closed
            if let Err(error) = wait_for_enter() {
                tracing::warn!("{error}");
            }
            connection.close().context("Failed to unmount image")?;
        }
        Commands::Create { image, layout } => {
            let layout = load_layout(&layout)
                .with_context(|| format!("Failed to load layout {}", layout.display()))?;

            if !image.exists() {
                let file = fs::File::create(&image)
                    .with_context(|| format!("Failed to create {}", image.display()))?;
                file.set_len(layout.max_size.bytes())?;
                tracing::info!(image = %image.display(), size = %layout.max_size, "created sparse image");
            }

            let created = create_image(&HostBackend, &image, &layout, &config)
                .with_context(|| format!("Failed to build {}", image.display()))?;
            print_json(&created)?;
        }
        Commands::Cmdline { image } => {
            let inspection = inspect_image(&image, &config)?;
            let Some(verity) = inspection.verity else {
                anyhow::bail!("{} has no verity root", image.display());
            };
            println!("{}", kernel_cmdline_args(&verity).join(" "));
        }
    }

    Ok(())
}
