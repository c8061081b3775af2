use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cpu-shaper")]
#[command(version)]
#[command(about = "Adaptive duty-cycle CPU load shaper for OCI Always-Free instances")]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Metrics bind address, e.g. ":9108" or "127.0.0.1:9108"
    #[arg(long)]
    pub metrics_bind: Option<String>,

    /// Number of duty-cycle workers
    #[arg(long)]
    pub workers: Option<u32>,

    /// Starting duty-cycle target ratio
    #[arg(long)]
    pub target: Option<f64>,

    /// Monitored resource OCID forwarded to the tenancy metrics client
    #[arg(long)]
    pub resource_id: Option<String>,

    /// Free-form mode label published on /metrics
    #[arg(long)]
    pub mode: Option<String>,

    /// Stop cleanly after this many seconds
    #[arg(long)]
    pub shutdown_after: Option<u64>,

    /// Disable the /proc/stat host-load sampler
    #[arg(long)]
    pub no_sampler: bool,

    /// Skip the tenancy client and pretend every query returns this P95 ratio
    #[arg(long)]
    pub offline_p95: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::parse_from(["cpu-shaper"]);
        assert!(args.config.is_none());
        assert!(args.metrics_bind.is_none());
        assert!(args.workers.is_none());
        assert!(!args.no_sampler);
        assert!(args.offline_p95.is_none());
    }

    #[test]
    fn test_args_parse_full() {
        let args = Args::parse_from([
            "cpu-shaper",
            "--config",
            "/etc/cpu-shaper/shaper.yaml",
            "--metrics-bind",
            ":9200",
            "--workers",
            "2",
            "--target",
            "0.3",
            "--resource-id",
            "ocid1.instance.oc1..abc",
            "--mode",
            "burst",
            "--shutdown-after",
            "300",
            "--no-sampler",
            "--offline-p95",
            "0.26",
        ]);
        assert_eq!(
            args.config.as_deref(),
            Some(std::path::Path::new("/etc/cpu-shaper/shaper.yaml"))
        );
        assert_eq!(args.metrics_bind.as_deref(), Some(":9200"));
        assert_eq!(args.workers, Some(2));
        assert_eq!(args.target, Some(0.3));
        assert_eq!(args.resource_id.as_deref(), Some("ocid1.instance.oc1..abc"));
        assert_eq!(args.mode.as_deref(), Some("burst"));
        assert_eq!(args.shutdown_after, Some(300));
        assert!(args.no_sampler);
        assert_eq!(args.offline_p95, Some(0.26));
    }

    #[test]
    fn test_args_short_config_flag() {
        let args = Args::parse_from(["cpu-shaper", "-c", "shaper.yaml"]);
        assert_eq!(args.config.as_deref(), Some(std::path::Path::new("shaper.yaml")));
    }
}
