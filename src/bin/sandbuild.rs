//! sandbuild - build packages in disposable overlay sandboxes.

mod workflows;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sandbuild::BuilderConfig;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use workflows::{build_package, update_profile, BuildRequest};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Configuration file (default: /etc/sandbuild/sandbuild.toml when present)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a package from its descriptor
    Build {
        /// package.yml or pspec.xml (default: look in the current directory)
        descriptor: Option<PathBuf>,

        /// Profile to build on
        #[arg(short, long)]
        profile: Option<String>,

        /// Where to put built packages (default: current directory)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },
    /// Upgrade a profile's backing image in place
    Update {
        /// Profile to update
        profile: Option<String>,

        /// Profile to update, if not given positionally
        #[arg(short = 'p', long = "profile")]
        profile_flag: Option<String>,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = BuilderConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Build {
            descriptor,
            profile,
            output,
        } => build_package(
            config,
            BuildRequest {
                profile,
                descriptor,
                output_dir: output,
            },
        ),
        Command::Update {
            profile,
            profile_flag,
        } => update_profile(config, profile.or(profile_flag)),
    }
}
