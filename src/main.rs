use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use garden_core::vcs::{GetFilesParams, RemoteSourceParams, SourceType};
use garden_core::{Config, GitHandler, VcsHandler};

#[derive(Parser)]
#[command(name = "garden-core")]
#[command(about = "Inspect version-controlled files and remote sources", long_about = None)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, global = true, default_value = "garden.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List files with their content hashes
    Files {
        path: PathBuf,
        /// Only include paths matching this glob (repeatable)
        #[arg(long)]
        include: Vec<String>,
        /// Exclude paths matching this glob (repeatable)
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// Print the root of the repository containing a path
    RepoRoot { path: PathBuf },
    /// Print branch, commit and origin of a path
    PathInfo { path: PathBuf },
    /// Print the tree version of a directory
    TreeVersion { path: PathBuf },
    /// Clone a remote source if it is not cached yet
    EnsureSource {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Update a cached remote source
    UpdateSource {
        #[command(flatten)]
        source: SourceArgs,
        /// Fail instead of prompting for credentials
        #[arg(long)]
        fail_on_prompt: bool,
    },
    /// Show version information
    Version,
}

#[derive(clap::Args)]
struct SourceArgs {
    #[arg(long)]
    name: String,
    /// Repository URL with a `#<ref>` suffix
    #[arg(long)]
    url: String,
    #[arg(long, default_value = "module")]
    source_type: SourceType,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load_from_path(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    config.apply_env_overrides();
    let handler = GitHandler::new(&config.vcs);

    match cli.command {
        Some(Commands::Version) | None => {
            println!("garden-core {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Files {
            path,
            include,
            exclude,
        }) => {
            let mut params = GetFilesParams::new(path);
            if !include.is_empty() {
                params = params.with_include(include);
            }
            if !exclude.is_empty() {
                params = params.with_exclude(exclude);
            }
            print_json(&handler.get_files(&params).await?)?;
        }
        Some(Commands::RepoRoot { path }) => {
            print_json(&handler.get_repo_root(&path).await?)?;
        }
        Some(Commands::PathInfo { path }) => {
            print_json(&handler.get_path_info(&path).await?)?;
        }
        Some(Commands::TreeVersion { path }) => {
            let module = garden_core::vcs::ModuleConfig::new("cli", path);
            print_json(&garden_core::vcs::get_tree_version(&handler, &module).await?)?;
        }
        Some(Commands::EnsureSource { source }) => {
            let params = RemoteSourceParams::new(source.name, source.url, source.source_type);
            print_json(&handler.ensure_remote_source(&params).await?)?;
        }
        Some(Commands::UpdateSource {
            source,
            fail_on_prompt,
        }) => {
            let params = RemoteSourceParams::new(source.name, source.url, source.source_type)
                .fail_on_prompt(fail_on_prompt);
            handler.update_remote_source(&params).await?;
            print_json(&handler.get_remote_source_path(&params))?;
        }
    }

    Ok(())
}
