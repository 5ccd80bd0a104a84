//! geti-jobs - Job admission, scheduling and recovery service.
//!
//! Usage:
//!   geti-jobs run <config>        Run the scheduler and the HTTP API
//!   geti-jobs validate <config>   Validate a configuration file
//!   geti-jobs policies <config>   Print the resolved admission policy per job type

use clap::{Parser, Subcommand};
use geti_jobs::config::{EngineConfig, StorageConfig};
use geti_jobs::{
    api, EventBus, FlyteAdminClient, InMemoryJobStore, JobStore, LoggingHandler, PolicyResolver,
    Scheduler, SchedulerConfig, StateMachine, StaticCapacity, WorkflowEngine, YamlLoader,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// geti-jobs - Job scheduler for the platform's workflow engine
#[derive(Parser)]
#[command(name = "geti-jobs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loops and the HTTP API
    Run {
        /// Path to the YAML configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Serve the API without running the scheduler loops
        #[arg(long)]
        api_only: bool,
    },

    /// Validate a configuration file without running
    Validate {
        /// Path to the YAML configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Print the admission policy resolved for every configured job type
    Policies {
        /// Path to the YAML configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, api_only } => {
            let config = YamlLoader::load(&config)?;
            run_service(config, api_only).await?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Policies { config } => {
            print_policies(config)?;
        }
    }

    Ok(())
}

/// Open the configured store and run the service on it.
async fn run_service(
    config: SchedulerConfig,
    api_only: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    match &config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory job store");
            run_with_store(Arc::new(InMemoryJobStore::new()), &config, api_only).await
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!(path = %path, "Using SQLite job store");
            let store = geti_jobs::SqliteJobStore::new(path).await?;
            run_with_store(Arc::new(store), &config, api_only).await
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("sqlite storage requires the 'sqlite' feature".into())
        }
    }
}

fn workflow_engine(config: &SchedulerConfig) -> Result<Arc<dyn WorkflowEngine>, Box<dyn std::error::Error>> {
    match &config.engine {
        Some(EngineConfig::Flyte {
            endpoint,
            project,
            domain,
        }) => {
            info!(endpoint = %endpoint, project = %project, domain = %domain, "Using Flyte admin");
            Ok(Arc::new(FlyteAdminClient::new(endpoint, project, domain)?))
        }
        None => Err("no workflow engine configured (set 'engine' in the configuration)".into()),
    }
}

async fn run_with_store<S: JobStore + 'static>(
    store: Arc<S>,
    config: &SchedulerConfig,
    api_only: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;
    let state_machine = Arc::new(StateMachine::new(store, event_bus));

    let scheduler = if api_only {
        info!("Scheduler loops disabled");
        None
    } else {
        let engine = workflow_engine(config)?;
        let capacity = Arc::new(StaticCapacity::from_config(&config.capacity));
        let scheduler =
            Scheduler::from_config(state_machine.clone(), engine, capacity, config);
        Some(scheduler.start())
    };

    let handle = scheduler.as_ref().map(|(handle, _)| handle.clone());
    let state = api::create_api_state(state_machine, config, handle);
    let server = api::start_server(&config.api, state).await?;

    info!("Press Ctrl+C to stop");

    match scheduler {
        Some((handle, scheduler_task)) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                    handle.shutdown().await?;
                }
                _ = scheduler_task => {
                    error!("Scheduler stopped unexpectedly");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");
        }
    }

    server.abort();
    info!("Goodbye!");
    Ok(())
}

/// Validate a configuration file without running.
fn validate_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating configuration: {}", path.display());

    match YamlLoader::load(&path) {
        Ok(config) => {
            info!("Configuration is valid: {} job type(s)", config.job_types.len());
            for job_type in &config.job_types {
                let revert = job_type
                    .revert
                    .as_ref()
                    .map(|r| format!(", revert {}@{}", r.workflow.name, r.workflow.version))
                    .unwrap_or_default();
                info!(
                    "  - {}: {}@{}{}",
                    job_type.job_type, job_type.workflow.name, job_type.workflow.version, revert
                );
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Print resolved policies, including environment overrides.
fn print_policies(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = YamlLoader::load(&path)?;
    let resolver = PolicyResolver::from_config(&config);
    let policies = resolver.resolve_all(config.job_types.iter().map(|t| t.job_type.as_str()));

    if policies.is_empty() {
        println!("No job types configured in {}", path.display());
        return Ok(());
    }

    println!("{:<24} {:<20} OVERRIDE", "JOB TYPE", "POLICY");
    for (job_type, policy) in &policies {
        println!(
            "{:<24} {:<20} {}",
            job_type,
            policy.to_string(),
            PolicyResolver::env_var_name(job_type)
        );
    }

    Ok(())
}
