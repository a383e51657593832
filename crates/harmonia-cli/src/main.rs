mod command_agent;
mod config;

use clap::{Parser, Subcommand};
use command_agent::CommandAgent;
use config::{load_config, CliConfig};
use harmonia_orchestrator::{
    FileJournal, Harmonia, JournalSink, MemoryJournal, TaskDefinition, TaskId,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "harmonia", about = "Harmonia: agent coordination and evolution scheduling")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "harmonia.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register agents and tasks from the config and run until Ctrl-C
    Run,
    /// Validate the config and print the effective engine settings
    Check,
    /// Run health/dispatch cycles until tasks settle, then print a JSON report
    Status {
        /// Maximum time to wait for tasks to finish
        #[arg(long, default_value_t = 5)]
        wait_secs: u64,
    },
}

enum Journal {
    File(Arc<FileJournal>),
    Memory(Arc<MemoryJournal>),
}

impl Journal {
    fn sink(&self) -> Arc<dyn JournalSink> {
        match self {
            Journal::File(j) => j.clone() as Arc<dyn JournalSink>,
            Journal::Memory(j) => j.clone() as Arc<dyn JournalSink>,
        }
    }

    async fn close(&self) {
        if let Journal::File(j) = self {
            j.close().await;
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Build the engine, register every configured agent and submit every task.
async fn bootstrap(config: &CliConfig, journal: &Journal) -> anyhow::Result<Arc<Harmonia>> {
    let engine = Harmonia::builder(config.engine.clone())
        .with_journal(journal.sink())
        .build()?;

    for spec in &config.agents {
        let agent = CommandAgent::new(
            spec.id.clone(),
            spec.probe_command.clone(),
            spec.execute_command.clone(),
        );
        engine
            .register_agent(spec.id.clone(), spec.capabilities.clone(), Arc::new(agent))
            .await?;
    }

    let mut ids: HashMap<&str, TaskId> = HashMap::new();
    for spec in &config.tasks {
        let deps = spec
            .depends_on
            .iter()
            .filter_map(|name| ids.get(name.as_str()).copied())
            .collect::<Vec<_>>();
        let definition = TaskDefinition::new(spec.capability.clone())
            .with_payload(spec.payload.clone())
            .with_label(spec.name.clone());
        let id = engine.submit(definition, deps, spec.priority).await?;
        ids.insert(spec.name.as_str(), id);
    }

    info!(
        agents = config.agents.len(),
        tasks = config.tasks.len(),
        "Configuration loaded into engine"
    );
    Ok(engine)
}

fn open_journal(config: &CliConfig) -> Journal {
    match &config.journal_path {
        Some(path) => Journal::File(Arc::new(FileJournal::new(path))),
        None => Journal::Memory(Arc::new(MemoryJournal::default())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Check => {
            let rendered = toml::to_string_pretty(&config.engine)?;
            println!("{rendered}");
            println!(
                "# {} agent(s), {} task(s), journal: {}",
                config.agents.len(),
                config.tasks.len(),
                config
                    .journal_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "in-memory".to_string())
            );
        }
        Commands::Run => {
            let journal = open_journal(&config);
            let engine = bootstrap(&config, &journal).await?;
            let loops = engine.start();
            info!("Harmonia running, press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            loops.shutdown().await;

            let report = engine.status_report().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            journal.close().await;
        }
        Commands::Status { wait_secs } => {
            let journal = open_journal(&config);
            let engine = bootstrap(&config, &journal).await?;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_secs);
            loop {
                engine.check_health().await;
                let stats = engine.task_stats().await;
                let pending = stats.queued + stats.executing;
                if pending == 0 {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(pending, "Tasks still pending at deadline");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            engine.drain_triggers();
            engine.evaluate_harmony().await;
            engine.drain_triggers();

            let report = engine.status_report().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            journal.close().await;
        }
    }

    Ok(())
}
