//! Configuration loading.
//!
//! Settings come from three layers, strongest last applied first checked:
//! command-line flags, then `SHAPER_*` environment variables, then a YAML
//! file. A missing file is not an error; every field has a default, so a
//! bare container runs with the stock thresholds and the offline-unavailable
//! tenancy client.
//!
//! YAML keys are camelCase on purpose: validation errors name keys in the
//! same notation (`controller.suppressThreshold`), so what the operator sees
//! in the log is what they grep for in the file.

use std::{env, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::cli::Args;
use crate::error::ShaperError;
use crate::shaper::controller::ControllerConfig;

/// Default configuration file location inside the container image.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cpu-shaper/shaper.yaml";

/// Default sampler cadence.
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// File schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub sampler: SamplerSection,
    #[serde(default)]
    pub metrics: MetricsSection,
    #[serde(default)]
    pub shutdown_after_secs: Option<u64>,
    /// Fixed P95 for the offline tenancy client. Absent means the real
    /// client (or, without credentials, the always-failing one).
    #[serde(default)]
    pub offline_p95: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ControllerSection {
    #[serde(default)]
    pub target_start: Option<f64>,
    #[serde(default)]
    pub target_min: Option<f64>,
    #[serde(default)]
    pub target_max: Option<f64>,
    #[serde(default)]
    pub step_up: Option<f64>,
    #[serde(default)]
    pub step_down: Option<f64>,
    #[serde(default)]
    pub fallback_target: Option<f64>,
    #[serde(default)]
    pub goal_low: Option<f64>,
    #[serde(default)]
    pub goal_high: Option<f64>,
    #[serde(default)]
    pub relaxed_threshold: Option<f64>,
    #[serde(default)]
    pub suppress_threshold: Option<f64>,
    #[serde(default)]
    pub suppress_resume: Option<f64>,
    #[serde(default)]
    pub slow_interval_secs: Option<u64>,
    #[serde(default)]
    pub relaxed_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PoolSection {
    #[serde(default)]
    pub workers: Option<u32>,
    #[serde(default)]
    pub quantum_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SamplerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub proc_stat_path: Option<PathBuf>,
}

impl Default for SamplerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: None,
            proc_stat_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MetricsSection {
    #[serde(default)]
    pub bind: Option<String>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

/// Fully merged, ready-to-wire settings. Controller invariants are still
/// checked later by `Controller::new`; this layer only shapes the data.
#[derive(Debug, Clone)]
pub struct Settings {
    pub controller: ControllerConfig,
    pub workers: u32,
    pub quantum: Duration,
    pub sampler_enabled: bool,
    pub sample_interval: Duration,
    pub proc_stat_path: PathBuf,
    pub metrics_bind: String,
    pub shutdown_after: Option<Duration>,
    pub offline_p95: Option<f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            workers: 1,
            quantum: Duration::from_millis(2),
            sampler_enabled: true,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            proc_stat_path: PathBuf::from("/proc/stat"),
            metrics_bind: ":9108".to_string(),
            shutdown_after: None,
            offline_p95: None,
        }
    }
}

impl Settings {
    /// Merge file, environment and CLI layers.
    pub fn load(args: &Args) -> Result<Self, ShaperError> {
        let path = args
            .config
            .clone()
            .or_else(|| env::var("SHAPER_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let file = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ShaperError::config("config", format!("unreadable: {e}")))?;
            parse_file(&text)?
        } else if args.config.is_some() {
            // An explicitly named file must exist.
            return Err(ShaperError::config(
                "config",
                format!("file not found: {}", path.display()),
            ));
        } else {
            FileConfig::default()
        };

        let mut settings = Settings::from_file(file);
        settings.apply_env()?;
        settings.apply_args(args);
        Ok(settings)
    }

    /// Build settings from a parsed file, using defaults for absent fields.
    pub fn from_file(file: FileConfig) -> Self {
        let mut s = Settings::default();
        let c = &file.controller;

        if let Some(mode) = file.mode {
            s.controller.mode_label = mode;
        }
        if let Some(id) = file.resource_id {
            s.controller.resource_id = id;
        }
        set_ratio(&mut s.controller.target_start, c.target_start);
        set_ratio(&mut s.controller.target_min, c.target_min);
        set_ratio(&mut s.controller.target_max, c.target_max);
        set_ratio(&mut s.controller.step_up, c.step_up);
        set_ratio(&mut s.controller.step_down, c.step_down);
        set_ratio(&mut s.controller.fallback_target, c.fallback_target);
        set_ratio(&mut s.controller.goal_low, c.goal_low);
        set_ratio(&mut s.controller.goal_high, c.goal_high);
        set_ratio(&mut s.controller.relaxed_threshold, c.relaxed_threshold);
        set_ratio(&mut s.controller.suppress_threshold, c.suppress_threshold);
        set_ratio(&mut s.controller.suppress_resume, c.suppress_resume);
        if let Some(secs) = c.slow_interval_secs {
            s.controller.slow_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = c.relaxed_interval_secs {
            s.controller.relaxed_interval = Duration::from_secs(secs);
        }

        if let Some(workers) = file.pool.workers {
            s.workers = workers;
        }
        if let Some(ms) = file.pool.quantum_ms {
            s.quantum = Duration::from_millis(ms);
        }

        s.sampler_enabled = file.sampler.enabled;
        if let Some(secs) = file.sampler.interval_secs {
            s.sample_interval = Duration::from_secs(secs);
        }
        if let Some(path) = file.sampler.proc_stat_path {
            s.proc_stat_path = path;
        }

        if let Some(bind) = file.metrics.bind {
            s.metrics_bind = bind;
        }
        s.shutdown_after = file.shutdown_after_secs.map(Duration::from_secs);
        s.offline_p95 = file.offline_p95;
        s
    }

    fn apply_env(&mut self) -> Result<(), ShaperError> {
        if let Ok(id) = env::var("SHAPER_RESOURCE_ID") {
            self.controller.resource_id = id;
        }
        if let Ok(mode) = env::var("SHAPER_MODE") {
            self.controller.mode_label = mode;
        }
        if let Ok(bind) = env::var("SHAPER_METRICS_BIND") {
            self.metrics_bind = bind;
        }
        if let Ok(raw) = env::var("SHAPER_WORKERS") {
            self.workers = raw.parse().map_err(|_| {
                ShaperError::config("SHAPER_WORKERS", format!("not a worker count: {raw:?}"))
            })?;
        }
        if let Ok(raw) = env::var("SHAPER_TARGET") {
            let value: f64 = raw.parse().map_err(|_| {
                ShaperError::config("SHAPER_TARGET", format!("not a ratio: {raw:?}"))
            })?;
            self.controller.target_start = value;
        }
        Ok(())
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(bind) = &args.metrics_bind {
            self.metrics_bind = bind.clone();
        }
        if let Some(workers) = args.workers {
            self.workers = workers;
        }
        if let Some(target) = args.target {
            self.controller.target_start = target;
        }
        if let Some(id) = &args.resource_id {
            self.controller.resource_id = id.clone();
        }
        if let Some(mode) = &args.mode {
            self.controller.mode_label = mode.clone();
        }
        if let Some(secs) = args.shutdown_after {
            self.shutdown_after = Some(Duration::from_secs(secs));
        }
        if args.no_sampler {
            self.sampler_enabled = false;
        }
        if let Some(p95) = args.offline_p95 {
            self.offline_p95 = Some(p95);
        }
    }
}

fn set_ratio(slot: &mut f64, value: Option<f64>) {
    if let Some(v) = value {
        *slot = v;
    }
}

/// Parse YAML into the file schema with a config-keyed error.
pub fn parse_file(text: &str) -> Result<FileConfig, ShaperError> {
    serde_yaml::from_str(text).map_err(|e| ShaperError::config("config", e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(argv: &[&str]) -> Args {
        let mut full = vec!["cpu-shaper"];
        full.extend_from_slice(argv);
        Args::parse_from(full)
    }

    // ===== YAML parsing =====

    #[test]
    fn test_parse_empty_yaml_is_default() {
        let file = parse_file("{}").unwrap();
        let s = Settings::from_file(file);
        assert_eq!(s.controller.target_start, 0.25);
        assert_eq!(s.metrics_bind, ":9108");
        assert!(s.sampler_enabled);
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
mode: burst
resourceId: ocid1.instance.oc1..abc
controller:
  targetStart: 0.30
  targetMin: 0.25
  targetMax: 0.45
  stepUp: 0.03
  stepDown: 0.02
  fallbackTarget: 0.28
  goalLow: 0.26
  goalHigh: 0.33
  relaxedThreshold: 0.31
  suppressThreshold: 0.90
  suppressResume: 0.75
  slowIntervalSecs: 1800
  relaxedIntervalSecs: 7200
pool:
  workers: 2
  quantumMs: 3
sampler:
  enabled: true
  intervalSecs: 10
metrics:
  bind: ":9200"
shutdownAfterSecs: 600
"#;
        let s = Settings::from_file(parse_file(yaml).unwrap());
        assert_eq!(s.controller.mode_label, "burst");
        assert_eq!(s.controller.resource_id, "ocid1.instance.oc1..abc");
        assert_eq!(s.controller.target_start, 0.30);
        assert_eq!(s.controller.suppress_resume, 0.75);
        assert_eq!(s.controller.slow_interval, Duration::from_secs(1800));
        assert_eq!(s.workers, 2);
        assert_eq!(s.quantum, Duration::from_millis(3));
        assert_eq!(s.sample_interval, Duration::from_secs(10));
        assert_eq!(s.metrics_bind, ":9200");
        assert_eq!(s.shutdown_after, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_parse_rejects_unknown_keys() {
        let err = parse_file("controller:\n  goalMiddle: 0.5\n").unwrap_err();
        assert!(matches!(err, ShaperError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_parse_rejects_snake_case_keys() {
        // Keys are camelCase; the snake_case spelling must not silently work.
        assert!(parse_file("controller:\n  target_start: 0.3\n").is_err());
    }

    #[test]
    fn test_sampler_can_be_disabled() {
        let s = Settings::from_file(parse_file("sampler:\n  enabled: false\n").unwrap());
        assert!(!s.sampler_enabled);
    }

    #[test]
    fn test_offline_p95_passthrough() {
        let s = Settings::from_file(parse_file("offlineP95: 0.24\n").unwrap());
        assert_eq!(s.offline_p95, Some(0.24));
    }

    // ===== CLI overrides =====

    #[test]
    fn test_args_override_file_defaults() {
        let a = args(&[
            "--metrics-bind",
            ":9300",
            "--workers",
            "3",
            "--target",
            "0.33",
            "--mode",
            "aggressive",
            "--shutdown-after",
            "120",
            "--no-sampler",
        ]);
        let mut s = Settings::default();
        s.apply_args(&a);
        assert_eq!(s.metrics_bind, ":9300");
        assert_eq!(s.workers, 3);
        assert_eq!(s.controller.target_start, 0.33);
        assert_eq!(s.controller.mode_label, "aggressive");
        assert_eq!(s.shutdown_after, Some(Duration::from_secs(120)));
        assert!(!s.sampler_enabled);
    }

    #[test]
    fn test_offline_flag_selects_offline_client() {
        let a = args(&["--offline-p95", "0.27"]);
        let mut s = Settings::default();
        s.apply_args(&a);
        assert_eq!(s.offline_p95, Some(0.27));
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let a = args(&["--config", "/nonexistent/shaper.yaml"]);
        let err = Settings::load(&a).unwrap_err();
        assert!(matches!(err, ShaperError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write as _;
        writeln!(file, "pool:").unwrap();
        writeln!(file, "  workers: 4").unwrap();
        let a = args(&["--config", file.path().to_str().unwrap()]);
        let s = Settings::load(&a).unwrap();
        assert_eq!(s.workers, 4);
    }

    #[test]
    fn test_load_explicit_file_with_bad_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write as _;
        writeln!(file, "pool: [not a mapping").unwrap();
        let a = args(&["--config", file.path().to_str().unwrap()]);
        assert!(Settings::load(&a).is_err());
    }
}
