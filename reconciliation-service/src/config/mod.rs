//! Configuration module for reconciliation-service.

use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub matching: MatchingConfig,
    pub allocation: AllocationConfig,
    pub pipeline: PipelineConfig,
    pub ai_fallback: AiFallbackConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Empty URL selects the in-memory store (local dev and tests).
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Amount tolerance as a percentage of the invoice outstanding balance.
    pub amount_tolerance_pct: Decimal,
    /// Days before/after the invoice due date a transaction may fall.
    pub due_window_days: i64,
    /// Cap on candidates per transaction to bound matcher cost.
    pub candidate_cap: usize,
    pub weight_amount: f64,
    pub weight_name: f64,
    pub weight_time: f64,
    /// Fuzzy candidates below this composite score are discarded.
    pub fuzzy_floor: f64,
    /// Scores in [review_floor, auto_threshold) route to manual review.
    pub review_floor: f64,
    pub auto_threshold: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            amount_tolerance_pct: Decimal::new(25, 1), // 2.5%
            due_window_days: 30,
            candidate_cap: 50,
            weight_amount: 1.0 / 3.0,
            weight_name: 1.0 / 3.0,
            weight_time: 1.0 / 3.0,
            fuzzy_floor: 0.3,
            review_floor: 0.5,
            auto_threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AllocationConfig {
    /// Bounded retries for the invoice version compare-and-swap.
    pub max_cas_retries: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self { max_cas_retries: 3 }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bounded worker pool size for batch runs.
    pub worker_count: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { worker_count: 8 }
    }
}

#[derive(Debug, Clone)]
pub struct AiFallbackConfig {
    /// Empty URL disables the AI fallback entirely.
    pub url: String,
    pub timeout_ms: u64,
    /// AI confidence is capped here so it can never auto-apply.
    pub confidence_cap: f64,
    /// Consecutive failures before the circuit breaker opens.
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for AiFallbackConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_ms: 3000,
            confidence_cap: 0.85,
            breaker_threshold: 5,
            breaker_cooldown_secs: 30,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ReconciliationConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let matching_defaults = MatchingConfig::default();
        let ai_defaults = AiFallbackConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "reconciliation-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_default(),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS", 2),
            },
            matching: MatchingConfig {
                amount_tolerance_pct: env::var("MATCH_AMOUNT_TOLERANCE_PCT")
                    .ok()
                    .and_then(|s| Decimal::from_str(&s).ok())
                    .unwrap_or(matching_defaults.amount_tolerance_pct),
                due_window_days: env_parse("MATCH_DUE_WINDOW_DAYS", matching_defaults.due_window_days),
                candidate_cap: env_parse("MATCH_CANDIDATE_CAP", matching_defaults.candidate_cap),
                weight_amount: env_parse("MATCH_WEIGHT_AMOUNT", matching_defaults.weight_amount),
                weight_name: env_parse("MATCH_WEIGHT_NAME", matching_defaults.weight_name),
                weight_time: env_parse("MATCH_WEIGHT_TIME", matching_defaults.weight_time),
                fuzzy_floor: env_parse("MATCH_FUZZY_FLOOR", matching_defaults.fuzzy_floor),
                review_floor: env_parse("MATCH_REVIEW_FLOOR", matching_defaults.review_floor),
                auto_threshold: env_parse("MATCH_AUTO_THRESHOLD", matching_defaults.auto_threshold),
            },
            allocation: AllocationConfig {
                max_cas_retries: env_parse("ALLOCATION_MAX_CAS_RETRIES", 3),
            },
            pipeline: PipelineConfig {
                worker_count: env_parse("PIPELINE_WORKER_COUNT", 8),
            },
            ai_fallback: AiFallbackConfig {
                url: env::var("AI_FALLBACK_URL").unwrap_or_default(),
                timeout_ms: env_parse("AI_FALLBACK_TIMEOUT_MS", ai_defaults.timeout_ms),
                confidence_cap: env_parse("AI_FALLBACK_CONFIDENCE_CAP", ai_defaults.confidence_cap),
                breaker_threshold: env_parse(
                    "AI_FALLBACK_BREAKER_THRESHOLD",
                    ai_defaults.breaker_threshold,
                ),
                breaker_cooldown_secs: env_parse(
                    "AI_FALLBACK_BREAKER_COOLDOWN_SECS",
                    ai_defaults.breaker_cooldown_secs,
                ),
            },
        })
    }
}
