//! Capability traits for the OCI-facing collaborators.
//!
//! The wire clients (Monitoring query signing, metadata IMDS fetches) live
//! outside this crate; the core only depends on the two narrow traits below.
//! The offline implementations here back tests, the `--offline-p95` flag and
//! deployments where no tenancy credentials are mounted.

use async_trait::async_trait;

use crate::error::ShaperError;
use crate::shaper::sanitize_ratio;

// ---------------------------------------------------------------------------
// MetricsClient
// ---------------------------------------------------------------------------

/// Tenancy metrics capability.
///
/// `query_p95` returns the most recent P95 datapoint for the resource over
/// the trailing seven days at one-minute resolution. Implementations signal
/// an empty result set with [`ShaperError::NoMetricsData`]; every other
/// failure is transport or authorization.
#[async_trait]
pub trait MetricsClient: Send + Sync {
    async fn query_p95(&self, resource_id: &str) -> Result<f64, ShaperError>;
}

/// Offline client returning one fixed ratio. Never fails.
#[derive(Debug, Clone)]
pub struct StaticMetricsClient {
    p95: f64,
}

impl StaticMetricsClient {
    pub fn new(p95: f64) -> Self {
        Self {
            p95: sanitize_ratio(p95),
        }
    }
}

#[async_trait]
impl MetricsClient for StaticMetricsClient {
    async fn query_p95(&self, _resource_id: &str) -> Result<f64, ShaperError> {
        Ok(self.p95)
    }
}

/// Client used when no tenancy pipeline is configured.
///
/// Every query fails, which pins the controller to its fallback target; that
/// is the designed behaviour for an unverified metric pipeline.
#[derive(Debug, Clone, Default)]
pub struct UnavailableMetricsClient;

#[async_trait]
impl MetricsClient for UnavailableMetricsClient {
    async fn query_p95(&self, _resource_id: &str) -> Result<f64, ShaperError> {
        Err(ShaperError::MetricsQueryFailed(
            "no tenancy metrics client configured".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// MetadataClient
// ---------------------------------------------------------------------------

/// Shape sizing reported by instance metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeConfig {
    pub ocpus: f64,
    pub memory_gbs: f64,
}

/// Instance metadata capability, consumed by the orchestrator to resolve
/// identifiers before the controller is constructed. Each accessor is an
/// independent fetch; wire implementations retry internally.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn region(&self) -> Result<String, ShaperError>;
    async fn canonical_region(&self) -> Result<String, ShaperError>;
    async fn instance_id(&self) -> Result<String, ShaperError>;
    async fn compartment_id(&self) -> Result<String, ShaperError>;
    async fn shape_config(&self) -> Result<ShapeConfig, ShaperError>;
}

/// Metadata client answering from fixed values.
#[derive(Debug, Clone)]
pub struct StaticMetadataClient {
    pub region: String,
    pub canonical_region: String,
    pub instance_id: String,
    pub compartment_id: String,
    pub shape: ShapeConfig,
}

impl Default for StaticMetadataClient {
    fn default() -> Self {
        Self {
            region: "iad".into(),
            canonical_region: "us-ashburn-1".into(),
            instance_id: String::new(),
            compartment_id: String::new(),
            shape: ShapeConfig {
                ocpus: 1.0,
                memory_gbs: 1.0,
            },
        }
    }
}

#[async_trait]
impl MetadataClient for StaticMetadataClient {
    async fn region(&self) -> Result<String, ShaperError> {
        Ok(self.region.clone())
    }

    async fn canonical_region(&self) -> Result<String, ShaperError> {
        Ok(self.canonical_region.clone())
    }

    async fn instance_id(&self) -> Result<String, ShaperError> {
        Ok(self.instance_id.clone())
    }

    async fn compartment_id(&self) -> Result<String, ShaperError> {
        Ok(self.compartment_id.clone())
    }

    async fn shape_config(&self) -> Result<ShapeConfig, ShaperError> {
        Ok(self.shape.clone())
    }
}
