//! Atelier - workspace gateway with HTTP API and interactive terminals.
//!
//! Usage:
//!   atelier [--port 3001] [--projects-dir ./projects]

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use crate::runner::Runner;
use crate::state::{AppState, GatewayConfig};

mod error;
mod http_server;
mod paths;
mod projects;
mod runner;
mod state;
mod terminal;
mod workspace;

#[derive(Parser, Debug)]
#[command(name = "atelier")]
#[command(about = "Workspace gateway with HTTP API and terminal sessions")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "3001")]
    port: u16,

    /// Directory holding one subdirectory per project
    #[arg(long, env = "PROJECTS_DIR", default_value = "./projects")]
    projects_dir: PathBuf,

    /// Wall-clock limit for one-shot runs, in seconds
    #[arg(long, env = "RUN_TIMEOUT_SECS", default_value = "30")]
    run_timeout_secs: u64,

    /// Shell spawned for interactive terminal sessions
    #[arg(long, env = "TERMINAL_SHELL", default_value = "bash")]
    shell: String,

    /// Extra interpreter mappings as LANG=COMMAND (repeatable)
    #[arg(long = "interpreter", value_name = "LANG=COMMAND")]
    interpreters: Vec<String>,
}

#[tokio::main]
async fn main() {
    use std::process::exit;

    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if let Err(e) = std::fs::create_dir_all(&args.projects_dir) {
        eprintln!(
            "Error: cannot create projects directory {}: {}",
            args.projects_dir.display(),
            e
        );
        exit(1);
    }
    let projects_dir = match args.projects_dir.canonicalize() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!(
                "Error: cannot resolve projects directory {}: {}",
                args.projects_dir.display(),
                e
            );
            exit(1);
        }
    };

    let mut runner = Runner::new(Duration::from_secs(args.run_timeout_secs));
    for mapping in &args.interpreters {
        match mapping.split_once('=') {
            Some((lang, command)) if !lang.is_empty() && !command.is_empty() => {
                runner.register_interpreter(lang, command);
            }
            _ => {
                eprintln!("Error: invalid --interpreter mapping '{mapping}', expected LANG=COMMAND");
                exit(1);
            }
        }
    }

    info!(
        projects_dir = %projects_dir.display(),
        port = args.port,
        shell = %args.shell,
        "starting gateway"
    );

    let config = GatewayConfig {
        projects_dir,
        shell: args.shell,
    };
    let state = AppState::new(config, runner);
    http_server::run_server(args.port, state).await;
}
