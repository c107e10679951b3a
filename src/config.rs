//! Typed configuration for the global knobs named in spec §5/§6, with a
//! fluent builder and named presets in the same style the rest of this
//! crate's resilience layer uses.

use std::path::PathBuf;
use std::time::Duration;

use crate::script::{BinaryCacheMode, BulkApiVersion, GlobalOptions};

/// Parallelism knobs from spec §5.
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// Blob fetch concurrency per task. Default 20.
    pub parallel_binary_downloads: usize,
    /// Across-batch concurrency within one task, bulk engines. Default 1.
    pub parallel_bulk_jobs: usize,
    /// Across-batch concurrency within one task, REST engine. Default 1.
    pub parallel_rest_jobs: usize,
    /// Maximum concurrent HTTP requests against the remote. Default 10.
    pub max_concurrent_requests: usize,
    pub enabled: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        ConcurrencyConfig {
            parallel_binary_downloads: 20,
            parallel_bulk_jobs: 1,
            parallel_rest_jobs: 1,
            max_concurrent_requests: 10,
            enabled: true,
        }
    }
}

/// Rate-limit budget shared across all engines (spec §5: "the engines
/// share a rate-limited request budget; no engine may exceed it").
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig { requests_per_minute: 1_000, enabled: true }
    }
}

/// Cancellation/timeout knobs from spec §5.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Upper bound on a bulk poll loop. Default 50 minutes.
    pub poll_timeout: Duration,
    /// Per-outbound-request timeout for ingest calls. Default 10 minutes.
    pub ingest_request_timeout: Duration,
    /// Per-outbound-request timeout for control-plane calls.
    pub control_request_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            poll_timeout: Duration::from_secs(50 * 60),
            ingest_request_timeout: Duration::from_secs(10 * 60),
            control_request_timeout: Duration::from_secs(2 * 60),
        }
    }
}

/// Top-level run configuration: the global knobs of spec §6 plus the
/// ambient concurrency/rate-limit/timeout model of spec §5.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub polling_interval: Duration,
    pub bulk_threshold: usize,
    pub bulk_api_version: BulkApiVersion,
    pub bulk_api_v1_batch_size: usize,
    pub all_or_none: bool,
    pub api_version: String,
    pub import_csv_files_as_is: bool,
    pub keep_object_order_while_execute: bool,
    pub create_target_csv_files: bool,
    pub binary_data_cache: BinaryCacheMode,
    pub source_records_cache: BinaryCacheMode,
    /// Root directory for `FileCache`/`CleanFileCache` entries (spec §4.3).
    /// Unused when both cache modes are `InMemory`.
    pub cache_dir: PathBuf,
    pub concurrency: ConcurrencyConfig,
    pub rate_limit: RateLimitConfig,
    pub timeouts: TimeoutConfig,
    /// Objects that may never be routed to a bulk engine (spec §4.5:
    /// "objects listed as 'not supported in bulk' are always routed to
    /// REST").
    pub bulk_unsupported_objects: Vec<String>,
}

impl From<&GlobalOptions> for RunConfig {
    fn from(opts: &GlobalOptions) -> Self {
        RunConfig {
            polling_interval: Duration::from_millis(opts.polling_interval_ms),
            bulk_threshold: opts.bulk_threshold,
            bulk_api_version: opts.bulk_api_version,
            bulk_api_v1_batch_size: opts.bulk_api_v1_batch_size,
            all_or_none: opts.all_or_none,
            api_version: opts.api_version.clone(),
            import_csv_files_as_is: opts.import_csv_files_as_is,
            keep_object_order_while_execute: opts.keep_object_order_while_execute,
            create_target_csv_files: opts.create_target_csv_files,
            binary_data_cache: opts.binary_data_cache,
            source_records_cache: opts.source_records_cache,
            cache_dir: default_cache_dir(),
            concurrency: ConcurrencyConfig::default(),
            rate_limit: RateLimitConfig::default(),
            timeouts: TimeoutConfig::default(),
            bulk_unsupported_objects: default_bulk_unsupported_objects(),
        }
    }
}

fn default_bulk_unsupported_objects() -> Vec<String> {
    // Objects the platform does not accept through Bulk v1/v2 ingest.
    vec!["User".to_string(), "Group".to_string(), "RecordType".to_string()]
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".")).join("sobject-migrate")
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig::from(&GlobalOptions::default())
    }
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::new()
    }

    /// Tuned for large transfers: higher bulk concurrency, longer poll
    /// timeout, Bulk v2 preferred.
    pub fn migration() -> Self {
        let mut cfg = RunConfig::default();
        cfg.concurrency.parallel_bulk_jobs = 4;
        cfg.concurrency.parallel_binary_downloads = 40;
        cfg.timeouts.poll_timeout = Duration::from_secs(90 * 60);
        cfg.bulk_api_version = BulkApiVersion::V2;
        cfg
    }

    /// Tuned for iterating locally: shorter timeouts, REST preferred for
    /// small volumes so failures surface quickly.
    pub fn development() -> Self {
        let mut cfg = RunConfig::default();
        cfg.bulk_threshold = 2_000;
        cfg.timeouts.poll_timeout = Duration::from_secs(5 * 60);
        cfg.timeouts.ingest_request_timeout = Duration::from_secs(60);
        cfg
    }

    pub fn is_bulk_supported(&self, object: &str) -> bool {
        !self.bulk_unsupported_objects.iter().any(|o| o.eq_ignore_ascii_case(object))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    pub fn new() -> Self {
        RunConfigBuilder { config: RunConfig::default() }
    }

    pub fn bulk_threshold(mut self, threshold: usize) -> Self {
        self.config.bulk_threshold = threshold;
        self
    }

    pub fn bulk_api_version(mut self, version: BulkApiVersion) -> Self {
        self.config.bulk_api_version = version;
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.config.polling_interval = interval;
        self
    }

    pub fn all_or_none(mut self, value: bool) -> Self {
        self.config.all_or_none = value;
        self
    }

    pub fn parallel_binary_downloads(mut self, n: usize) -> Self {
        self.config.concurrency.parallel_binary_downloads = n;
        self
    }

    pub fn max_concurrent_requests(mut self, n: usize) -> Self {
        self.config.concurrency.max_concurrent_requests = n;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn source_records_cache(mut self, mode: BinaryCacheMode) -> Self {
        self.config.source_records_cache = mode;
        self
    }

    pub fn build(self) -> RunConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = RunConfig::builder().bulk_threshold(500).all_or_none(true).build();
        assert_eq!(cfg.bulk_threshold, 500);
        assert!(cfg.all_or_none);
    }

    #[test]
    fn migration_preset_raises_concurrency() {
        let cfg = RunConfig::migration();
        assert!(cfg.concurrency.parallel_bulk_jobs > RunConfig::default().concurrency.parallel_bulk_jobs);
    }

    #[test]
    fn bulk_unsupported_objects_routed_to_rest() {
        let cfg = RunConfig::default();
        assert!(!cfg.is_bulk_supported("User"));
        assert!(cfg.is_bulk_supported("Account"));
    }

    #[test]
    fn builder_overrides_cache_settings() {
        let cfg = RunConfig::builder()
            .cache_dir("/tmp/sobject-migrate-test-cache")
            .source_records_cache(BinaryCacheMode::FileCache)
            .build();
        assert_eq!(cfg.cache_dir, PathBuf::from("/tmp/sobject-migrate-test-cache"));
        assert_eq!(cfg.source_records_cache, BinaryCacheMode::FileCache);
    }
}
