/// Command-line surface of the runtime
use crate::config::parser::{self, Overrides};
use crate::config::types::ContainerConfig;
use crate::runtime::supervisor;
use crate::state::StateStore;
use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mun_os", author, version, about = "A minimal Linux container runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and run a container in the foreground
    Run {
        #[command(flatten)]
        launch: LaunchArgs,
    },
    /// Start a container in the background
    Start {
        #[command(flatten)]
        launch: LaunchArgs,
    },
    /// Stop a running container (preserves its state record)
    Stop {
        /// Container name
        name: String,
    },
    /// Restart a container from its saved configuration
    Restart {
        /// Container name
        name: String,
    },
    /// Remove a stopped container's state
    #[command(alias = "rm")]
    Remove {
        /// Container name
        name: String,
    },
    /// List managed containers
    List,
    /// Run a command inside a running container
    Exec {
        /// Container name
        name: String,
        /// Command and arguments to run inside the container
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        argv: Vec<String>,
    },
    /// Stop every running container
    KillAll,
    /// Remove every stopped container's state
    Prune,
    /// Stop and remove all containers
    Cleanup,
}

#[derive(Args)]
struct LaunchArgs {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Container name (defaults to the config file stem)
    #[arg(long)]
    name: Option<String>,
    /// Root filesystem directory
    #[arg(long)]
    rootfs: Option<PathBuf>,
    /// Hostname inside the container
    #[arg(long)]
    hostname: Option<String>,
    /// Memory limit in MB
    #[arg(long, value_name = "MB")]
    memory: Option<u64>,
    /// Maximum number of processes
    #[arg(long, value_name = "N")]
    pids: Option<u32>,
    /// Workload command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .format_module_path(false)
        .init();

    // Usage errors exit 1 like config and launch errors do.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    match cli.command {
        Commands::Run { launch } => {
            let (config, _) = build_config(&launch)?;
            let code = supervisor::run(&config)?;
            // Pass the container's exit status through to our caller.
            std::process::exit(code);
        }

        Commands::Start { launch } => {
            if launch.config.is_none() {
                bail!("'start' requires a --config file");
            }
            let (config, config_path) = build_config(&launch)?;
            let config_path =
                config_path.ok_or_else(|| anyhow!("'start' requires a --config file"))?;

            let store = StateStore::open()?;
            let pid = supervisor::start(&config, &config_path, &store)?;
            println!("Container '{}' started with PID {}", config.name, pid);
        }

        Commands::Stop { name } => {
            let store = StateStore::open()?;
            supervisor::stop(&name, &store)?;
            println!("Container '{}' stopped", name);
        }

        Commands::Restart { name } => {
            let store = StateStore::open()?;
            let pid = supervisor::restart(&name, &store)?;
            println!("Container '{}' restarted with PID {}", name, pid);
        }

        Commands::Remove { name } => {
            let store = StateStore::open()?;
            supervisor::remove(&name, &store)?;
            println!("Container '{}' removed", name);
        }

        Commands::List => {
            let store = StateStore::open()?;
            print_container_table(&supervisor::list(&store)?);
        }

        Commands::Exec { name, argv } => {
            let store = StateStore::open()?;
            let code = supervisor::exec(&name, &argv, &store)?;
            std::process::exit(code);
        }

        Commands::KillAll => {
            let store = StateStore::open()?;
            let stopped = supervisor::kill_all(&store)?;
            println!("Stopped {} container(s)", stopped);
        }

        Commands::Prune => {
            let store = StateStore::open()?;
            let removed = supervisor::prune(&store)?;
            println!("Removed {} stopped container(s)", removed);
        }

        Commands::Cleanup => {
            let store = StateStore::open()?;
            let cleaned = supervisor::cleanup(&store)?;
            println!("Cleaned up {} container(s)", cleaned);
        }
    }

    Ok(())
}

/// Resolve file, environment and CLI flags into a launch configuration.
/// Also returns the absolute config path when a file was given.
fn build_config(launch: &LaunchArgs) -> anyhow::Result<(ContainerConfig, Option<PathBuf>)> {
    let file_and_path = match &launch.config {
        Some(path) => {
            if !path.exists() {
                bail!("config file does not exist: {}", path.display());
            }
            let absolute = fs::canonicalize(path)
                .with_context(|| format!("could not resolve {}", path.display()))?;
            let file = parser::load_file(&absolute)?;
            Some((file, absolute))
        }
        None => None,
    };

    let overrides = Overrides {
        name: launch.name.clone(),
        rootfs: launch.rootfs.clone(),
        hostname: launch.hostname.clone(),
        memory_mb: launch.memory,
        max_pids: launch.pids,
        command: launch.command.clone(),
    };

    let (file, path) = match file_and_path {
        Some((file, path)) => (Some(file), Some(path)),
        None => (None, None),
    };
    let config = parser::build(file, path.as_deref(), &overrides)?;
    Ok((config, path))
}

fn print_container_table(states: &[crate::types::ContainerState]) {
    println!(
        "{:<20} {:<10} {:<10} {}",
        "CONTAINER NAME", "PID", "STATUS", "CONFIG"
    );
    println!(
        "{:<20} {:<10} {:<10} {}",
        "-".repeat(20),
        "-".repeat(10),
        "-".repeat(10),
        "-".repeat(20)
    );

    if states.is_empty() {
        println!("No containers are managed. Use 'start' to create one.");
        return;
    }

    for state in states {
        println!(
            "{:<20} {:<10} {:<10} {}",
            state.name, state.pid, state.status, state.config_path
        );
    }
}
