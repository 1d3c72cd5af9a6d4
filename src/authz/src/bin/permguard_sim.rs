//! PermGuard simulation harness
//!
//! Wires the engine to in-memory collaborators, drives a synthetic
//! workload and prints cache, batch and breaker statistics.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use permguard_authz::{
    AuthzEngine, BatchAuthorizationRequest, ChangeEvent, EngineConfig, InMemoryBackingStore, InMemoryChangeFeed,
    InMemoryRemoteTier, PermissionCheck, RemoteTier, Scope, ScopeType,
};

/// PermGuard cache simulation CLI
#[derive(Parser)]
#[command(name = "permguard-sim")]
#[command(about = "Drive the permission cache with a synthetic workload")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file (defaults are used when absent)
    #[arg(short, long, env = "PERMGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the workload (default)
    Run {
        /// Number of simulated subjects
        #[arg(long, default_value_t = 50)]
        subjects: usize,

        /// Validation rounds per subject
        #[arg(long, default_value_t = 3)]
        rounds: usize,

        /// Take the remote tier down halfway through
        #[arg(long)]
        remote_outage: bool,

        /// Print cache statistics in Prometheus text format
        #[arg(long)]
        prometheus: bool,
    },

    /// Load and validate a configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},permguard_authz=debug", log_level).into()),
        )
        .with_target(true)
        .with_line_number(true)
        .init();

    let config = match &cli.config {
        Some(path) => {
            let config = EngineConfig::load(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => EngineConfig::default(),
    };

    match cli.command.unwrap_or(Command::Run {
        subjects: 50,
        rounds: 3,
        remote_outage: false,
        prometheus: false,
    }) {
        Command::CheckConfig => {
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run {
            subjects,
            rounds,
            remote_outage,
            prometheus,
        } => run(config, subjects, rounds, remote_outage, prometheus).await,
    }
}

async fn run(config: EngineConfig, subjects: usize, rounds: usize, remote_outage: bool, prometheus: bool) -> Result<()> {
    info!("Starting PermGuard simulation v{}", permguard_authz::VERSION);

    let store = Arc::new(InMemoryBackingStore::new());
    let remote = Arc::new(InMemoryRemoteTier::new());
    let feed = Arc::new(InMemoryChangeFeed::with_buffer(config.permissions.feed_buffer));

    let subject_ids: Vec<String> = (0..subjects).map(|i| format!("user-{}", i)).collect();
    let acme = Scope::organization("acme");
    for (i, subject) in subject_ids.iter().enumerate() {
        store.grant(subject, "document", "read", None);
        if i % 2 == 0 {
            store.grant(subject, "document", "write", Some(&acme));
        }
    }

    let shared_remote: Arc<dyn RemoteTier> = remote.clone();
    let engine = AuthzEngine::new(config, store.clone(), Some(shared_remote), feed.clone())?;

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    let _watch = engine
        .permissions()
        .subscribe_to_changes(&subject_ids[0], move |change| {
            counter.fetch_add(1, Ordering::Relaxed);
            info!("Change observed: {}:{} -> {}", change.resource, change.action, change.allowed);
        })
        .await?;

    let checks = [
        PermissionCheck::new("document", "read"),
        PermissionCheck::new("document", "write"),
    ];

    for round in 0..rounds {
        if remote_outage && round == rounds / 2 {
            warn!("Simulating remote tier outage");
            remote.set_available(false);
            engine.cache().clear().await;
        }

        let mut allowed = 0;
        for subject in &subject_ids {
            let validation = engine.permissions().validate_batch(subject, &checks, Some(&acme)).await;
            allowed += validation.results.iter().filter(|r| r.allowed).count();
        }
        info!("Round {}: {} checks allowed", round + 1, allowed);
    }

    // Duplicate role writes collapse into one backing-store call per subject
    for subject in &subject_ids {
        let request = BatchAuthorizationRequest::assign(subject.as_str(), "editor").in_scope(&acme);
        engine
            .batch()
            .enqueue_many(vec![request.clone(), request.clone(), request])
            .await;
    }
    let result = engine.batch().flush().await;
    info!(
        "Final flush: {} successful, {} failed, {} skipped",
        result.successful, result.failed, result.skipped
    );

    let warmed = engine
        .roles()
        .warm(&subject_ids[0], &[acme.clone(), Scope::system()])
        .await;
    for hierarchy in &warmed {
        info!("{} roles in {}: {:?}", subject_ids[0], hierarchy.scope, hierarchy.roles);
    }

    feed.publish(ChangeEvent::grant(subject_ids[0].as_str(), "document", "delete", true).with_scope(acme.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.shutdown().await;

    let stats = engine.cache().stats();
    println!("Cache: {:#?}", stats);
    println!("Batch: {}", serde_json::to_string_pretty(&engine.batch().metrics())?);
    println!(
        "Remote tier disabled: {} (tripped {} times)",
        engine.degradation().is_disabled(),
        engine.degradation().trip_count()
    );
    println!("Listeners notified: {}", notified.load(Ordering::Relaxed));
    println!(
        "Organization role TTL: {:?}",
        engine.roles().optimizer(ScopeType::Organization).ttl()
    );

    if prometheus {
        println!("{}", stats.to_prometheus());
    }

    Ok(())
}
