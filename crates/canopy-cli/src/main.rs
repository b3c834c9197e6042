//! canopy: drive a workspace from the command line.
//!
//! `canopy replay` runs a JSON-lines operation script against an in-memory
//! workspace (or a directory with `--root`) and prints the delta of every
//! command. `canopy validate-name` checks a resource name for a platform.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use canopy_kernel::{
    LocalFileStore, NameValidator, Platform, PlatformNameRules, ResourcePath, Workspace,
    WorkspaceConfig,
};
use clap::{Parser, Subcommand};
use tracing::info;

mod script;

#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(about = "Workspace resource tree tools")]
struct Args {
    /// Workspace configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay an operation script and print one JSON record per command
    Replay {
        /// Script file, one JSON command per line
        script: PathBuf,

        /// Back the workspace with this directory instead of memory
        #[arg(long)]
        root: Option<PathBuf>,

        /// Continue after a failed command
        #[arg(long)]
        keep_going: bool,

        /// Print every resource once the script has run
        #[arg(long)]
        tree: bool,
    },
    /// Check a resource name against a platform's naming rules
    ValidateName {
        name: String,

        /// windows, macos or unix (defaults to the configured platform)
        #[arg(long)]
        platform: Option<Platform>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    if let Err(e) = canopy_telemetry::init() {
        eprintln!("logging unavailable: {e}");
    }

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => WorkspaceConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WorkspaceConfig::default(),
    };

    match args.command {
        Command::Replay {
            script,
            root,
            keep_going,
            tree,
        } => replay(config, &script, root, keep_going, tree).await,
        Command::ValidateName { name, platform } => {
            let platform = platform.unwrap_or(config.platform);
            match PlatformNameRules.check(&name, platform) {
                Ok(()) => {
                    println!("{name:?} is valid on {platform}");
                    Ok(ExitCode::SUCCESS)
                }
                Err(reason) => {
                    println!("{name:?} is invalid on {platform}: {reason}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

async fn replay(
    mut config: WorkspaceConfig,
    script_path: &Path,
    root: Option<PathBuf>,
    keep_going: bool,
    print_tree: bool,
) -> Result<ExitCode> {
    let text = std::fs::read_to_string(script_path)
        .with_context(|| format!("reading {}", script_path.display()))?;
    let lines = script::parse(&text)?;

    let builder = match root {
        Some(root) => {
            let root = root
                .canonicalize()
                .with_context(|| format!("resolving {}", root.display()))?;
            config.location = root.clone();
            Workspace::builder(config).file_store(Arc::new(LocalFileStore::confined(root)))
        }
        None => Workspace::builder(config),
    };
    let ws = builder.build()?;
    info!(workspace = %ws.id(), commands = lines.len(), "replaying {}", script_path.display());

    let mut out = std::io::stdout().lock();
    let failures = script::run(&ws, &lines, keep_going, &mut out).await?;

    if print_tree {
        let snapshot = ws.snapshot();
        for path in snapshot.descendants(&ResourcePath::root()) {
            if path.is_root() {
                continue;
            }
            if let Some(info) = snapshot.lookup(&path) {
                serde_json::to_writer(&mut out, &info)?;
                writeln!(out)?;
            }
        }
    }

    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
