//! Entry point for the VerticaDB operator binary.
//!
//! Probes come up first, then the process waits on a Lease until it is the
//! single active replica and only then starts reconciling.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vertica_operator::health::{HealthState, run_health_server};
use vertica_operator::{run_controller, watch_namespace};

const LEASE_NAME: &str = "vertica-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_EVERY: Duration = Duration::from_secs(5);

/// How long in-flight passes get after SIGTERM before the process exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Who this replica is, for the Lease holder field.
struct Identity {
    holder: String,
    namespace: String,
}

impl Identity {
    /// Read `POD_NAME`/`POD_NAMESPACE` from the downward API, falling back to
    /// the hostname and `default` when running outside a pod.
    fn from_env() -> Self {
        let holder = std::env::var("POD_NAME").unwrap_or_else(|_| {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "vertica-operator".to_string());
            warn!(holder = %host, "POD_NAME unset, using hostname as lease holder");
            host
        });
        let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
            warn!("POD_NAMESPACE unset, placing the lease in default");
            "default".to_string()
        });
        Self { holder, namespace }
    }

    fn lease(&self, client: Client) -> LeaseLock {
        LeaseLock::new(
            client,
            &self.namespace,
            LeaseLockParams {
                holder_id: self.holder.clone(),
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: LEASE_TTL,
            },
        )
    }
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::from_default_env()
        .add_directive("vertica_operator=info".parse()?)
        .add_directive("kube=warn".parse()?)
        .add_directive("kube_leader_election=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
    Ok(())
}

/// Block until this replica holds the lease. Errors are retried forever.
async fn acquire_leadership(lease: &LeaseLock) {
    loop {
        match lease.try_acquire_or_renew().await {
            Ok(outcome) if outcome.acquired_lease => {
                info!(lease = LEASE_NAME, "leadership acquired");
                return;
            }
            Ok(_) => info!(lease = LEASE_NAME, "lease held elsewhere, standing by"),
            Err(e) => warn!(error = %e, "lease acquisition failed"),
        }
        tokio::time::sleep(LEASE_RENEW_EVERY).await;
    }
}

/// Keep renewing the lease. Losing it ends the process so the pod restarts
/// and rejoins the election as a follower.
#[allow(clippy::exit)]
fn spawn_lease_renewal(lease: LeaseLock) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LEASE_RENEW_EVERY);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let lost = match lease.try_acquire_or_renew().await {
                Ok(outcome) => !outcome.acquired_lease,
                Err(e) => {
                    error!(error = %e, "lease renewal failed");
                    true
                }
            };
            if lost {
                error!(lease = LEASE_NAME, "leadership lost, exiting");
                std::process::exit(1);
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    info!(version = env!("CARGO_PKG_VERSION"), "vertica-operator starting");

    let client = Client::try_default().await?;
    let identity = Identity::from_env();
    let health = Arc::new(HealthState::new());

    // Probes answer before leadership so liveness holds on standbys.
    let health_server = {
        let health = health.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health).await {
                error!(error = %e, "health server stopped");
            }
        })
    };

    info!(
        holder = %identity.holder,
        namespace = %identity.namespace,
        lease = LEASE_NAME,
        "waiting for leadership"
    );
    acquire_leadership(&identity.lease(client.clone())).await;
    let renewal = spawn_lease_renewal(identity.lease(client.clone()));

    info!(
        watch_namespace = watch_namespace().as_deref().unwrap_or("all"),
        "starting VerticaDB controller"
    );
    let controller = tokio::spawn(run_controller(client, Some(health.clone())));

    tokio::select! {
        res = controller => {
            if let Err(e) = res {
                error!(error = %e, "controller task aborted");
            }
        }
        res = health_server => {
            if let Err(e) = res {
                error!(error = %e, "health server task aborted");
            }
        }
        Err(e) = renewal => {
            error!(error = %e, "lease renewal task aborted");
        }
        () = shutdown_signal() => {
            health.set_ready(false);
            info!(grace_secs = SHUTDOWN_GRACE.as_secs(), "shutdown requested, draining");
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
    }

    info!("vertica-operator stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM. If a handler cannot be installed that
/// signal is never observed and the other one still works.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}
