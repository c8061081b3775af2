//! # Runtime Orchestrator
//!
//! Wires the sampler, pool, controller and metrics endpoint to one
//! cancellation token and owns their lifecycles:
//!
//! ```text
//! Sampler ──observations──► Controller ──target──► Pool
//!                               │
//!                               └──telemetry──► ShaperMetrics ◄── HTTP scrape
//! ```
//!
//! An optional shutdown deadline cancels the shared token after a fixed
//! runtime; an elapsed deadline is indistinguishable from an operator
//! cancel and both count as success.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::ShaperError;
use crate::oci::{MetadataClient, MetricsClient};
use crate::shaper::{
    controller::{Controller, ControllerConfig},
    exporter::{MetricsRecorder, ShaperMetrics},
    pool::{DutyCycler, DutyCyclePool},
    sampler::Sampler,
};
use crate::web;

/// Everything the orchestrator needs beyond the controller config.
pub struct RuntimeOptions {
    pub metrics_bind: String,
    pub shutdown_after: Option<Duration>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            metrics_bind: ":9108".to_string(),
            shutdown_after: None,
        }
    }
}

/// Owns the shaper's component instances and runs them to completion.
pub struct Runtime {
    controller: Arc<Controller>,
    pool: Arc<DutyCyclePool>,
    sampler: Option<Sampler>,
    metrics: Arc<ShaperMetrics>,
    options: RuntimeOptions,
}

impl Runtime {
    /// Construct the component graph. Fails only on config rejection.
    pub fn new(
        cfg: ControllerConfig,
        client: Arc<dyn MetricsClient>,
        pool: Arc<DutyCyclePool>,
        sampler: Option<Sampler>,
        metrics: Arc<ShaperMetrics>,
        options: RuntimeOptions,
    ) -> Result<Self, ShaperError> {
        metrics.set_worker_count(pool.workers());
        let controller = Controller::new(
            cfg,
            client,
            Arc::clone(&pool) as Arc<dyn DutyCycler>,
            Arc::clone(&metrics) as Arc<dyn MetricsRecorder>,
        )?;
        Ok(Self {
            controller,
            pool,
            sampler,
            metrics,
            options,
        })
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Resolve a blank resource id from instance metadata. Called by the
    /// binary before `Runtime::new` when no id was configured.
    pub async fn resolve_resource_id(
        configured: &str,
        metadata: &dyn MetadataClient,
    ) -> Result<String, ShaperError> {
        if !configured.trim().is_empty() {
            return Ok(configured.trim().to_string());
        }
        metadata.instance_id().await
    }

    /// Run every component until cancellation or the shutdown deadline.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ShaperError> {
        if let Some(deadline) = self.options.shutdown_after {
            let token = cancel.clone();
            info!(seconds = deadline.as_secs(), "shutdown deadline armed");
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                token.cancel();
            });
        }

        self.pool.start(cancel.clone());

        let server = match web::serve(
            &self.options.metrics_bind,
            Arc::clone(&self.metrics),
            cancel.clone(),
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                cancel.cancel();
                self.pool.join();
                return Err(e);
            }
        };

        let observations = self.sampler.as_ref().map(|s| s.run(cancel.clone()));
        let controller = Arc::clone(&self.controller);
        let result = match observations {
            Some(stream) => controller.run(cancel.clone(), Some(stream)).await,
            None => {
                controller
                    .run(
                        cancel.clone(),
                        None::<tokio_stream::wrappers::ReceiverStream<crate::shaper::sampler::Observation>>,
                    )
                    .await
            }
        };

        // Cancellation already propagated; drain the side tasks.
        self.pool.join();
        server.join().await;
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
