//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `REVAUDIT_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `REVAUDIT_` override YAML values
//! 3. **REVAUDIT_API_KEY** - Special case: overrides `api.api_key` if set
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `REVAUDIT_RATE_LIMIT__TIER=medium` sets the `rate_limit.tier` field.
//!
//! ## Example
//!
//! ```yaml
//! api:
//!   base_url: https://analytics.example.com/api/
//!   revision: "2024-10-15"
//! rate_limit:
//!   tier: small
//! extraction:
//!   max_concurrent_calls: 4
//!   stagger: 250ms
//!   run_timeout: 45m
//! revenue:
//!   metric_name: Placed Order
//!   preferred_integration: shopify
//! ```

use chrono::NaiveDate;
use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::aggregates::Interval;
use crate::errors::Error;
use crate::limits::{RateBudget, RateTier};

/// CLI args: config file plus the date range to extract
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "REVAUDIT_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// First day of the audit period (inclusive, YYYY-MM-DD)
    #[arg(long, requires = "end")]
    pub start: Option<NaiveDate>,

    /// Day after the audit period (exclusive, YYYY-MM-DD)
    #[arg(long, requires = "start")]
    pub end: Option<NaiveDate>,

    /// Audit the trailing N days ending yesterday, used when --start/--end are absent
    #[arg(long, default_value_t = 30, conflicts_with = "start")]
    pub days: u32,

    /// Write the snapshot here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Validate configuration and exit without contacting the upstream API.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Shortcut for `api.api_key`, populated from `REVAUDIT_API_KEY`
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Upstream API connection settings
    pub api: ApiConfig,
    /// Call budget shared by every outbound request
    pub rate_limit: RateLimitConfig,
    /// Retry behaviour for throttled and failed calls
    pub retry: RetryConfig,
    /// Orchestration settings for one extraction run
    pub extraction: ExtractionConfig,
    /// Which metric carries revenue and how it is attributed
    pub revenue: RevenueConfig,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    /// Base URL all API paths are joined onto
    pub base_url: Url,
    /// Private API key
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Header carrying the credential
    pub auth_header_name: String,
    /// Prefix placed before the key in the auth header
    pub auth_header_prefix: String,
    /// API revision sent in the `revision` header, if the platform versions its API
    pub revision: Option<String>,
    /// Timeout for a single HTTP attempt
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Upper bound on pages followed for one listing
    pub max_pages: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("https://api.example.com/api/").expect("static URL is valid"),
            api_key: None,
            auth_header_name: "Authorization".to_string(),
            auth_header_prefix: "Bearer ".to_string(),
            revision: None,
            request_timeout: Duration::from_secs(30),
            max_pages: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Named budget tier
    pub tier: RateTier,
    /// Overrides the tier's per-second limit
    pub max_per_second: Option<u32>,
    /// Overrides the tier's per-minute limit
    pub max_per_minute: Option<u32>,
}

impl RateLimitConfig {
    pub fn budget(&self) -> RateBudget {
        let base = self.tier.budget();
        RateBudget {
            max_per_second: self.max_per_second.unwrap_or(base.max_per_second),
            max_per_minute: self.max_per_minute.unwrap_or(base.max_per_minute),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries allowed after throttled (429) responses
    pub max_throttle_retries: u32,
    /// Retries allowed after network failures, timeouts, and 5xx responses
    pub max_transport_retries: u32,
    /// Base backoff duration in milliseconds (will be exponentially increased)
    pub backoff_ms: u64,
    /// Factor by which the backoff_ms is increased with each retry
    pub backoff_factor: u64,
    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,
    /// Upper bound of random delay added to every wait
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_throttle_retries: 5,
            max_transport_retries: 2,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 30000,
            jitter_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractionConfig {
    /// Logical calls allowed in flight at once across all domain tasks
    pub max_concurrent_calls: usize,
    /// Delay between consecutive per-entity sub-queries
    #[serde(with = "humantime_serde")]
    pub stagger: Duration,
    /// Deadline for the whole run; the partial snapshot is returned when it passes
    #[serde(with = "humantime_serde")]
    pub run_timeout: Duration,
    /// Longest range a single aggregate query may cover before it is chunked
    #[serde(with = "humantime_serde")]
    pub max_query_span: Duration,
    /// Bucket size for revenue time series
    pub interval: Interval,
    /// IANA timezone sent with aggregate queries
    pub timezone: String,
    /// Campaign channels to list
    pub campaign_channels: Vec<String>,
    /// Cap on per-entity fallback queries per domain
    pub max_entity_queries: usize,
    /// Metric counted as a form submission; `None` skips submission counts
    pub form_submission_metric: Option<String>,
    /// Dimension identifying the form on submission events
    pub form_dimension: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 4,
            stagger: Duration::from_millis(250),
            run_timeout: Duration::from_secs(45 * 60),
            max_query_span: Duration::from_secs(365 * 24 * 60 * 60),
            interval: Interval::Day,
            timezone: "UTC".to_string(),
            campaign_channels: vec!["email".to_string(), "sms".to_string()],
            max_entity_queries: 50,
            form_submission_metric: Some("Submitted Form".to_string()),
            form_dimension: "$form_id".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RevenueConfig {
    /// Name of the metric whose value is order revenue
    pub metric_name: String,
    /// Integration that owns the authoritative revenue metric when names collide
    pub preferred_integration: Option<String>,
    /// Dimension naming the flow an event is attributed to
    pub flow_dimension: String,
    /// Dimension naming the campaign an event is attributed to
    pub campaign_dimension: String,
    /// Fraction of `total - flow` assumed to be campaign revenue when no campaign series is
    /// available. `None` disables the estimate.
    pub campaign_estimate_fraction: Option<f64>,
}

impl Default for RevenueConfig {
    fn default() -> Self {
        Self {
            metric_name: "Placed Order".to_string(),
            preferred_integration: Some("shopify".to_string()),
            flow_dimension: "$attributed_flow".to_string(),
            campaign_dimension: "$attributed_campaign".to_string(),
            campaign_estimate_fraction: None,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        if let Some(key) = config.api_key.take() {
            config.api.api_key = Some(key);
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.api.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            return Err(invalid(
                "API key is not configured. Set REVAUDIT_API_KEY or add api.api_key to the config file.",
            ));
        }

        let budget = self.rate_limit.budget();
        if budget.max_per_second == 0 || budget.max_per_minute == 0 {
            return Err(invalid("rate limit budgets must be greater than zero"));
        }
        if budget.max_per_minute < budget.max_per_second {
            return Err(invalid(format!(
                "max_per_minute ({}) cannot be lower than max_per_second ({})",
                budget.max_per_minute, budget.max_per_second
            )));
        }

        if self.retry.max_throttle_retries > 20 || self.retry.max_transport_retries > 20 {
            return Err(invalid("retry counts above 20 are not allowed"));
        }
        if self.retry.backoff_factor == 0 {
            return Err(invalid("retry.backoff_factor must be at least 1"));
        }

        if self.extraction.max_concurrent_calls == 0 {
            return Err(invalid("extraction.max_concurrent_calls must be at least 1"));
        }
        if self.extraction.max_query_span < Duration::from_secs(24 * 60 * 60) {
            return Err(invalid("extraction.max_query_span must be at least one day"));
        }

        if let Some(fraction) = self.revenue.campaign_estimate_fraction
            && !(0.0..=1.0).contains(&fraction)
        {
            return Err(invalid(format!(
                "revenue.campaign_estimate_fraction must be within 0..=1, got {fraction}"
            )));
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values. Only keys naming a config
            // section are read, so unrelated REVAUDIT_* variables do not trip deny_unknown_fields.
            .merge(
                Env::prefixed("REVAUDIT_")
                    .filter(|key| {
                        let section = key.as_str().split("__").next().unwrap_or_default();
                        ENV_SECTIONS.iter().any(|s| section.eq_ignore_ascii_case(s))
                    })
                    .split("__"),
            )
    }
}

/// Top-level keys that `REVAUDIT_*` environment variables may set.
const ENV_SECTIONS: &[&str] = &[
    "api_key",
    "api",
    "rate_limit",
    "retry",
    "extraction",
    "revenue",
    "enable_otel_export",
];

fn invalid(message: impl Into<String>) -> Error {
    Error::BadRequest {
        message: format!("Config validation: {}", message.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args(path: &str) -> Args {
        Args {
            config: path.to_string(),
            start: None,
            end: None,
            days: 30,
            output: None,
            validate: false,
        }
    }

    #[test]
    fn test_loads_yaml_with_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
api:
  api_key: pk-test
  base_url: https://analytics.example.com/api/
  request_timeout: 10s
rate_limit:
  tier: medium
extraction:
  stagger: 100ms
revenue:
  preferred_integration: storefront
"#,
            )?;

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.api.api_key.as_deref(), Some("pk-test"));
            assert_eq!(config.api.request_timeout, Duration::from_secs(10));
            assert_eq!(config.rate_limit.tier, RateTier::Medium);
            assert_eq!(config.rate_limit.budget(), RateTier::Medium.budget());
            assert_eq!(config.extraction.stagger, Duration::from_millis(100));
            assert_eq!(config.extraction.max_concurrent_calls, 4); // default
            assert_eq!(config.revenue.preferred_integration.as_deref(), Some("storefront"));
            assert_eq!(config.revenue.metric_name, "Placed Order"); // default

            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_yaml() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "api:\n  api_key: from-file\n")?;
            jail.set_env("REVAUDIT_API_KEY", "from-env");
            jail.set_env("REVAUDIT_RATE_LIMIT__MAX_PER_MINUTE", "30");
            jail.set_env("REVAUDIT_EXTRACTION__MAX_CONCURRENT_CALLS", "2");

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.api.api_key.as_deref(), Some("from-env"));
            assert_eq!(config.rate_limit.budget().max_per_minute, 30);
            assert_eq!(config.extraction.max_concurrent_calls, 2);

            Ok(())
        });
    }

    #[test]
    fn test_unrelated_prefixed_env_is_ignored() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "api:\n  api_key: pk\n")?;
            jail.set_env("REVAUDIT_CONFIG", "test.yaml");
            jail.set_env("REVAUDIT_LOG_DIR", "/tmp/revaudit");
            jail.set_env("REVAUDIT_RETRY__JITTER_MS", "0");

            let config = Config::load(&args("test.yaml"))?;
            assert_eq!(config.retry.jitter_ms, 0);

            // Unknown keys inside a known section are still rejected
            jail.set_env("REVAUDIT_RETRY__NOT_A_FIELD", "1");
            assert!(Config::load(&args("test.yaml")).is_err());

            Ok(())
        });
    }

    #[test]
    fn test_missing_api_key_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "enable_otel_export: false\n")?;

            let err = Config::load(&args("test.yaml")).unwrap_err();
            assert!(err.to_string().contains("API key"));

            Ok(())
        });
    }

    #[test]
    fn test_custom_budget_must_be_consistent() {
        let mut config = Config::default();
        config.api.api_key = Some("pk".into());
        config.rate_limit.max_per_second = Some(10);
        config.rate_limit.max_per_minute = Some(5);

        assert!(config.validate().is_err());

        config.rate_limit.max_per_minute = Some(50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_estimate_fraction_bounds() {
        let mut config = Config::default();
        config.api.api_key = Some("pk".into());
        config.revenue.campaign_estimate_fraction = Some(1.5);
        assert!(config.validate().is_err());

        config.revenue.campaign_estimate_fraction = Some(0.3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "api:\n  api_key: pk\nnot_a_field: 1\n")?;
            assert!(Config::load(&args("test.yaml")).is_err());
            Ok(())
        });
    }
}
