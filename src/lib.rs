use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

use backend::Backend;
use config::Config;
use mailbox::MailboxHandler;
use manager::QueueManager;
use validator::MessageValidator;

pub mod backend;
pub mod config;
pub mod envelope;
pub mod error;
pub mod mailbox;
pub mod manager;
pub mod policy;
pub mod sweeper;
pub mod validator;

/// Install the global tracing subscriber according to the config's log
/// sinks. Safe to call once per process; later calls are ignored.
pub fn init_tracing(config: &Config) -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("DROPQ_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    if config.write_file_log() {
        std::fs::create_dir_all(&config.paths.log_root)?;
        let path = std::path::Path::new(&config.paths.log_root).join("dropq.log");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        let _ = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .finish()
            .try_init();
    } else if config.write_console_log() {
        let _ = FmtSubscriber::builder()
            .with_env_filter(filter)
            .finish()
            .try_init();
    }

    Ok(())
}

/// Run the broker until interrupted: wire the manager, register configured
/// queues and schemas, start the sweeper and the mailbox, then shut down in
/// order — stop accepting requests, stop the sweeper, drain workers, close
/// the backend.
pub async fn run(backend: Arc<dyn Backend>, config: Config) -> eyre::Result<()> {
    let manager = Arc::new(QueueManager::new(
        backend.clone(),
        config.policy_defaults.clone(),
        config.backpressure.clone(),
    ));

    let validator = Arc::new(MessageValidator::new());
    for queue in &config.queues {
        let policy = queue
            .policy
            .clone()
            .unwrap_or_else(|| config.policy_defaults.clone());
        manager
            .register_queue(&queue.name, policy)
            .await
            .map_err(|e| eyre::eyre!("register queue '{}': {e}", queue.name))?;
        if let Some(schema) = &queue.message_schema {
            validator.register_schema(&queue.name, schema.clone());
        }
    }

    let shutdown = CancellationToken::new();

    let sweeper = tokio::spawn(sweeper::run(
        manager.clone(),
        config.lease.sweep_interval_ms,
        shutdown.child_token(),
    ));

    let handler = MailboxHandler::new(manager.clone(), validator, config.mailbox.clone());
    let mailbox_tasks = handler.start(shutdown.child_token()).await?;

    tracing::info!(
        node_id = config.node_id(),
        backend = ?config.backend(),
        "broker up"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    shutdown.cancel();
    mailbox_tasks.drained().await;
    let _ = sweeper.await;
    backend.close().await?;

    tracing::info!("clean shutdown");
    Ok(())
}
