//! autorestart - restart Pods when the ConfigMaps they depend on change

use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use autorestart::config::EngineArgs;
use autorestart::controller::{ReconcileEngine, Runner};
use autorestart::events::{EventPublisher, KubeEventPublisher};
use autorestart::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use autorestart::ledger::{ConfigMapLedger, RevisionLedger};
use autorestart::model::ConfigIdentity;
use autorestart::store::{KubeResourceStore, ResourceStore};
use autorestart::telemetry::{init_telemetry, TelemetryConfig};
use autorestart::{DEFAULT_CONTROLLER_NAMESPACE, FIELD_MANAGER};

/// autorestart - restart Pods exactly once per ConfigMap change
#[derive(Parser, Debug)]
#[command(name = "autorestart", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    Controller,

    /// Inspect or repair the revision ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
}

#[derive(Subcommand, Debug)]
enum LedgerCommand {
    /// Print every ledger entry as YAML
    List,

    /// Forget the processed revision of one ConfigMap
    ///
    /// Its dependents are restarted again on the next notification or resync.
    Reset {
        /// Namespace of the ConfigMap
        namespace: String,
        /// Name of the ConfigMap
        name: String,
    },
}

/// Controller mode arguments
#[derive(Args, Debug)]
struct ControllerArgs {
    #[command(flatten)]
    engine: EngineArgs,

    /// Only watch ConfigMaps in this namespace (default: all namespaces)
    #[arg(long, env = "AUTORESTART_NAMESPACE")]
    namespace: Option<String>,

    /// Namespace holding the ledger and the leader lease
    #[arg(
        long,
        env = "POD_NAMESPACE",
        default_value = DEFAULT_CONTROLLER_NAMESPACE,
        global = true
    )]
    ledger_namespace: String,

    /// Identity used for leader election and event reporting
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,

    /// Run without leader election (single replica only)
    #[arg(long, env = "AUTORESTART_DISABLE_LEADER_ELECTION")]
    disable_leader_election: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Ledger { command }) => run_ledger(command, &cli.controller).await,
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let identity = args
        .identity
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| format!("autorestart-{}", std::process::id()));
    init_telemetry(TelemetryConfig {
        instance: Some(identity.clone()),
        ..TelemetryConfig::default()
    })?;

    let config = args.engine.into_config()?;

    info!(
        %identity,
        watch_namespace = args.namespace.as_deref().unwrap_or("*"),
        ledger_namespace = %args.ledger_namespace,
        "autorestart controller starting"
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let store: Arc<dyn ResourceStore> = Arc::new(KubeResourceStore::new(client.clone()));
    let ledger: Arc<dyn RevisionLedger> = Arc::new(ConfigMapLedger::new(
        client.clone(),
        args.ledger_namespace.clone(),
    ));
    let events: Arc<dyn EventPublisher> = Arc::new(KubeEventPublisher::new(
        client.clone(),
        FIELD_MANAGER,
        Some(identity.clone()),
    ));

    let mut guard = if args.disable_leader_election {
        warn!("leader election disabled, run a single replica");
        None
    } else {
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &args.ledger_namespace,
            &identity,
        ));
        tokio::select! {
            guard = elector.acquire() => Some(guard),
            _ = shutdown_signal() => {
                info!("shutdown requested before leadership was acquired");
                return Ok(());
            }
        }
    };

    let engine = Arc::new(ReconcileEngine::new(
        store,
        Arc::clone(&ledger),
        events,
        config.clone(),
    ));
    let runner = Runner::new(engine, ledger, config);

    let cancel = CancellationToken::new();
    let mut runner_task = tokio::spawn(runner.run(client, args.namespace, cancel.clone()));

    let leadership_lost = async {
        match guard.as_mut() {
            Some(g) => g.lost().await,
            None => std::future::pending().await,
        }
    };

    let runner_finished = tokio::select! {
        _ = leadership_lost => {
            warn!("leadership lost, stopping controller");
            false
        }
        _ = shutdown_signal() => {
            info!("shutdown requested");
            false
        }
        joined = &mut runner_task => {
            if let Err(e) = joined {
                error!(error = %e, "runner task failed");
            } else {
                warn!("controller stopped unexpectedly");
            }
            true
        }
    };

    cancel.cancel();
    if !runner_finished {
        if let Err(e) = runner_task.await {
            error!(error = %e, "runner task failed");
        }
    }

    if let Some(guard) = guard {
        if let Err(e) = guard.release_leadership().await {
            warn!(error = %e, "failed to release leadership");
        }
    }

    info!("autorestart controller stopped");
    Ok(())
}

async fn run_ledger(command: LedgerCommand, args: &ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let ledger = ConfigMapLedger::new(client, args.ledger_namespace.clone());

    match command {
        LedgerCommand::List => {
            let entries = ledger.list().await?;
            print!("{}", serde_yaml::to_string(&entries)?);
        }
        LedgerCommand::Reset { namespace, name } => {
            let identity = ConfigIdentity::new(namespace, name);
            ledger.delete(&identity).await?;
            println!("ledger entry for {identity} removed");
        }
    }
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
