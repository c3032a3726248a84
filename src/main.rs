mod config;
mod env_utils;
mod logging;
mod port_detect;
mod serial_transport;
mod shell;

use std::{fs, io, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use remotefat::{
    fat::{format_image, FormatOptions},
    FileDisk, Session,
};

use config::{CliOverrides, Settings};
use logging::Logger;
use serial_transport::SerialTransport;
use shell::Shell;

#[derive(Debug, Parser)]
#[command(name = "m65ftp")]
#[command(about = "Copy files to and from a MEGA65 SD card over serial")]
struct Cli {
    /// Serial port the MEGA65 is attached to.
    #[arg(short = 'l', long, global = true)]
    port: Option<String>,
    #[arg(short = 's', long, global = true)]
    baud: Option<u32>,
    /// Work on a local disk image instead of a live card.
    #[arg(short = 'd', long, global = true)]
    image: Option<PathBuf>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long = "log-json", global = true)]
    log_json: Option<PathBuf>,
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Shell(ShellArgs),
    Mkimage(MkimageArgs),
    Ports,
}

#[derive(Debug, Default, Args)]
struct ShellArgs {
    /// Run these commands in order, then exit.
    #[arg(short = 'c')]
    commands: Vec<String>,
}

#[derive(Debug, Args)]
struct MkimageArgs {
    output: PathBuf,
    #[arg(long, default_value_t = 4096)]
    clusters: u32,
    #[arg(long = "sectors-per-cluster", default_value_t = 8)]
    sectors_per_cluster: u8,
    #[arg(long, default_value = "MEGA65")]
    label: String,
}

fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(&CliOverrides {
        config_path: cli.config,
        port: cli.port,
        baud: cli.baud,
        log_json_path: cli.log_json,
        verbose: cli.verbose,
    })?;
    Logger::new(settings.log_level, settings.log_json_path.clone())?.install()?;

    match cli.command.unwrap_or(Commands::Shell(ShellArgs::default())) {
        Commands::Shell(args) => match cli.image {
            Some(path) => {
                let disk = FileDisk::open(&path)
                    .with_context(|| format!("failed to open image {}", path.display()))?;
                let mut session = Session::open(disk)
                    .with_context(|| format!("failed to mount {}", path.display()))?;
                info!("mounted image {}", path.display());
                run_shell(session.engine(), args)
            }
            None => {
                let port = env_utils::require_port(&settings)?;
                let transport = SerialTransport::open(&port, settings.baud)?;
                let mut session = Session::connect(transport, settings.remote_config())
                    .with_context(|| format!("no remote helper answering on {port}"))?;
                let result = run_shell(session.engine(), args);
                session
                    .close()
                    .context("failed to stop the remote helper")?;
                result
            }
        },
        Commands::Mkimage(args) => {
            let image = format_image(&FormatOptions {
                clusters: args.clusters,
                sectors_per_cluster: args.sectors_per_cluster,
                label: args.label,
                ..FormatOptions::default()
            })?;
            logging::ensure_parent_dir(&args.output)?;
            fs::write(&args.output, &image)
                .with_context(|| format!("failed writing {}", args.output.display()))?;
            info!(
                "wrote {} ({} bytes, {} clusters)",
                args.output.display(),
                image.len(),
                args.clusters
            );
            Ok(())
        }
        Commands::Ports => {
            let candidates = port_detect::list_candidates();
            if candidates.is_empty() {
                info!("no serial port candidates found");
            }
            for candidate in candidates {
                info!("{candidate}");
            }
            Ok(())
        }
    }
}

fn run_shell<D: remotefat::BlockDevice>(
    engine: &mut remotefat::FileTransferEngine<D>,
    args: ShellArgs,
) -> Result<()> {
    let stdout = io::stdout();
    let mut shell = Shell::new(engine, stdout.lock());
    if args.commands.is_empty() {
        shell.run_interactive(io::stdin().lock())
    } else {
        shell.run_commands(&args.commands)
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}
