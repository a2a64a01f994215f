//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Kiln - build container images with buildpacks
///
/// Runs detection and build in ephemeral containers, then assembles the
/// output into a layered image that can later be rebased onto a new run
/// image without rebuilding.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format (overrides general.log_format)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an image from app source
    Build(BuildArgs),

    /// Move an image onto a new run image without rebuilding
    Rebase(RebaseArgs),

    /// Bake buildpacks into a stack's build image
    CreateBuilder(CreateBuilderArgs),

    /// Show configuration
    Config(ConfigArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Image repository to write (e.g. myapp or registry.example.com/team/app)
    pub repo_name: String,

    /// App source directory (defaults to current directory)
    #[arg(short, long)]
    pub path: Option<PathBuf>,

    /// Build image (defaults to the stack's build image)
    #[arg(long)]
    pub builder: Option<String>,

    /// Run image (defaults to the stack's run image)
    #[arg(long)]
    pub run_image: Option<String>,

    /// Push to the registry instead of the local engine
    #[arg(long)]
    pub publish: bool,

    /// Stack to take default images from
    #[arg(long)]
    pub stack: Option<String>,

    /// Hide phase container output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the rebase command
#[derive(Parser, Debug)]
pub struct RebaseArgs {
    /// Image to rebase
    pub repo_name: String,

    /// New run image (defaults to the stack's run image)
    #[arg(long)]
    pub run_image: Option<String>,

    /// Stack to take the run image from (defaults to the image's own stack)
    #[arg(long)]
    pub stack: Option<String>,

    /// Rebase the image in the registry instead of the local engine
    #[arg(long)]
    pub publish: bool,

    /// Use the run image already in the local engine
    #[arg(long, conflicts_with = "publish")]
    pub no_pull: bool,
}

/// Arguments for the create-builder command
#[derive(Parser, Debug)]
pub struct CreateBuilderArgs {
    /// Builder image to write
    pub repo_name: String,

    /// Path to builder.toml
    #[arg(short = 'b', long = "builder-config")]
    pub builder_config: PathBuf,

    /// Base image (defaults to the stack's build image)
    #[arg(long)]
    pub build_image: Option<String>,

    /// Stack to take the build image from
    #[arg(long)]
    pub stack: Option<String>,

    /// Push to the registry instead of the local engine
    #[arg(long)]
    pub publish: bool,

    /// Use the build image already in the local engine
    #[arg(long, conflicts_with = "publish")]
    pub no_pull: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}
