//! Command-line interface definition

use crate::commands;
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Log format options
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

impl LogFormat {
    fn as_str(self) -> &'static str {
        match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        }
    }
}

/// Build application images from source using buildpacks
#[derive(Debug, Parser)]
#[command(name = "kiln", version, about)]
pub struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Show debug output, including lifecycle debug logs
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build an application image from source
    Build(BuildArgs),
}

#[derive(Debug, clap::Args)]
pub struct BuildArgs {
    /// Image name, e.g. registry.example.com/acme/app:latest
    pub image: String,

    /// Builder image to build with
    #[arg(short = 'B', long)]
    pub builder: String,

    /// Run image override; defaults to the builder's stack run image
    #[arg(long)]
    pub run_image: Option<String>,

    /// Lifecycle image for the phases that run outside the builder
    #[arg(long)]
    pub lifecycle_image: Option<String>,

    /// Path to the application directory
    #[arg(short, long, default_value = ".")]
    pub path: PathBuf,

    /// Publish the result to the registry instead of the local daemon
    #[arg(long)]
    pub publish: bool,

    /// Clear the build cache before running
    #[arg(long)]
    pub clear_cache: bool,

    /// Use the consolidated creator binary instead of individual phases
    #[arg(long)]
    pub creator: bool,

    /// Cache the build layers in this registry image
    #[arg(long)]
    pub cache_image: Option<String>,

    /// Previous image to reuse layers from
    #[arg(long)]
    pub previous_image: Option<String>,

    /// Additional tags applied to the built image
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    /// Network mode for the phase containers
    #[arg(long, default_value = "")]
    pub network: String,

    /// Docker host the daemon-access phases should talk to
    #[arg(long, env = "DOCKER_HOST", default_value = "")]
    pub docker_host: String,

    /// Extra host binds mounted into every phase (source:target)
    #[arg(long = "volume")]
    pub volumes: Vec<String>,

    /// In-container app directory name (defaults to "workspace")
    #[arg(long)]
    pub workspace: Option<String>,

    /// Group id that owns the build and cache volumes
    #[arg(long)]
    pub gid: Option<u32>,

    /// Default process type of the built image
    #[arg(long, default_value = "")]
    pub default_process: String,

    /// Copy the SBOM produced by the build to this directory
    #[arg(long)]
    pub sbom_output_dir: Option<PathBuf>,

    /// Copy the build report to this directory
    #[arg(long)]
    pub report_output_dir: Option<PathBuf>,

    /// User id that owns copied-in sources inside the phase containers
    #[arg(long, default_value_t = 1000)]
    pub uid: u32,

    /// Group id that owns copied-in sources inside the phase containers
    #[arg(long, default_value_t = 1000)]
    pub build_gid: u32,
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        kiln_core::logging::init(Some(self.log_format.as_str()));

        match self.command {
            Commands::Build(args) => commands::build::execute(args, self.verbose).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_parse() {
        let cli = Cli::parse_from([
            "kiln",
            "build",
            "registry.example.com/acme/app",
            "--builder",
            "cnbs/builder:bionic",
            "--tag",
            "registry.example.com/acme/app:extra",
            "--publish",
        ]);
        let Commands::Build(args) = cli.command;
        assert_eq!(args.image, "registry.example.com/acme/app");
        assert_eq!(args.builder, "cnbs/builder:bionic");
        assert_eq!(args.tags.len(), 1);
        assert!(args.publish);
        assert!(!args.clear_cache);
    }
}
