//! Adaptive duty-cycle CPU load shaper.
//!
//! Oracle reclaims Always-Free compute instances whose seven-day P95 CPU
//! utilisation stays under 20%. This daemon keeps that percentile above a
//! safety margin by burning a configurable fraction of CPU in millisecond
//! quanta, while yielding completely to real workloads the moment local
//! contention is detected.
//!
//! The [`shaper`] module holds the control plane; [`oci`] defines the
//! capability traits the tenancy collaborators plug into; [`web`] serves the
//! OpenMetrics exposition.

pub mod cli;
pub mod config;
pub mod error;
pub mod oci;
pub mod shaper;
pub mod web;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use error::{ExitStatus, ShaperError};

use crate::oci::{MetricsClient, StaticMetadataClient, StaticMetricsClient, UnavailableMetricsClient};
use crate::shaper::{
    exporter::ShaperMetrics,
    pool::DutyCyclePool,
    runtime::{Runtime, RuntimeOptions},
    sampler::{ProcStatSource, Sampler},
};

/// Crate version, the only process-wide read-only identity data.
pub fn shaper_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Load settings, wire the component graph and run it until cancellation.
///
/// Ctrl+C and an elapsed shutdown deadline both count as success; only
/// configuration rejection and runtime failures map to non-zero exits.
pub async fn run(args: cli::Args) -> ExitStatus {
    let mut settings = match config::Settings::load(&args) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            return ExitStatus::ConfigError;
        }
    };

    // A blank resource id is resolved from instance metadata. The bundled
    // client answers from fixtures; deployments with real credentials swap
    // in the wire client here.
    let metadata = StaticMetadataClient::default();
    match Runtime::resolve_resource_id(&settings.controller.resource_id, &metadata).await {
        Ok(id) => settings.controller.resource_id = id,
        Err(e) => {
            tracing::warn!(error = %e, "instance metadata unavailable, keeping configured id");
        }
    }

    let client: Arc<dyn MetricsClient> = match settings.offline_p95 {
        Some(p95) => Arc::new(StaticMetricsClient::new(p95)),
        None => Arc::new(UnavailableMetricsClient),
    };

    let pool = Arc::new(DutyCyclePool::new(settings.workers, settings.quantum));
    #[cfg(all(feature = "rootful", target_os = "linux"))]
    {
        pool.set_worker_start_hook(shaper::pool::idle_scheduling_hook());
        pool.set_worker_start_error_handler(Arc::new(|worker, err| {
            tracing::warn!(worker, error = %err, "idle scheduling request denied");
        }));
    }
    let sampler = settings.sampler_enabled.then(|| {
        Sampler::new(
            Arc::new(ProcStatSource::with_path(&settings.proc_stat_path)),
            settings.sample_interval,
        )
    });
    let metrics = ShaperMetrics::new();

    let runtime = match Runtime::new(
        settings.controller,
        client,
        pool,
        sampler,
        metrics,
        RuntimeOptions {
            metrics_bind: settings.metrics_bind,
            shutdown_after: settings.shutdown_after,
        },
    ) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            return ExitStatus::ConfigError;
        }
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    match runtime.run(cancel).await {
        Ok(()) => {
            info!("shaper stopped cleanly");
            ExitStatus::Success
        }
        Err(e) => {
            error!(error = %e, "shaper runtime failed");
            ExitStatus::RuntimeError
        }
    }
}
