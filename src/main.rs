use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use dropq::config::{BackendKind, Config};

/// Single-node durable message broker with a filesystem drop-box protocol.
#[derive(Parser, Debug)]
#[command(name = "dropq", version, about)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Storage backend: sqlite, filesystem, or hybrid.
    #[arg(long)]
    backend: Option<String>,

    /// SQLite database file (sqlite and hybrid backends).
    #[arg(long)]
    db_path: Option<String>,

    #[arg(long)]
    data_root: Option<String>,

    #[arg(long)]
    log_root: Option<String>,

    #[arg(long)]
    node_id: Option<String>,

    /// Default lease duration in seconds.
    #[arg(long)]
    visibility_timeout: Option<u32>,

    #[arg(long)]
    write_console_log: Option<bool>,

    #[arg(long)]
    write_file_log: Option<bool>,
}

const DEFAULT_CONFIG_PATH: &str = "dropq.json";

fn load_config(args: &Args) -> Result<Config, String> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).map_err(|e| e.to_string())?,
        None if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Config::load(DEFAULT_CONFIG_PATH).map_err(|e| e.to_string())?
        }
        None => Config::default(),
    };

    if let Some(backend) = &args.backend {
        config.backend = Some(match backend.as_str() {
            "sqlite" => BackendKind::Sqlite,
            "filesystem" => BackendKind::Filesystem,
            "hybrid" => BackendKind::Hybrid,
            other => return Err(format!("unknown backend '{other}'")),
        });
    }
    if let Some(db_path) = &args.db_path {
        config.sqlite.db_path = db_path.clone();
    }
    if let Some(data_root) = &args.data_root {
        config.paths.data_root = data_root.clone();
    }
    if let Some(log_root) = &args.log_root {
        config.paths.log_root = log_root.clone();
    }
    if let Some(node_id) = &args.node_id {
        config.node_id = Some(node_id.clone());
    }
    if let Some(visibility) = args.visibility_timeout {
        config.lease.visibility_timeout_sec = visibility;
        config.policy_defaults.visibility_timeout_sec = visibility;
    }
    if let Some(console) = args.write_console_log {
        config.write_console_log = Some(console);
    }
    if let Some(file) = args.write_file_log {
        config.write_file_log = Some(file);
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = dropq::init_tracing(&config) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    let backend = match dropq::backend::open(&config).await {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!(error = %e, "failed to open backend");
            return ExitCode::from(2);
        }
    };

    match dropq::run(backend, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "broker terminated with error");
            ExitCode::from(1)
        }
    }
}
