//! Engine configuration with environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CONCURRENCY: usize = 2;
pub const DEFAULT_RETRY_LIMIT: usize = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SMALL_LINE_THRESHOLD: usize = 3;
pub const DEFAULT_BATCH_TOKEN_BUDGET: usize = 3_000;
pub const DEFAULT_MAX_BATCH_SYMBOLS: usize = 8;
pub const DEFAULT_CHECKPOINT_EVERY: usize = 20;
pub const DEFAULT_STORE_PATH: &str = ".logic_index/index.db";

/// Tunables for one indexing run.
///
/// Every field has a default, so a partially specified JSON document or an
/// empty environment still yields a usable configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Number of summarization workers.
    pub max_concurrency: usize,
    /// Retries after the first attempt for transient failures and truncated replies.
    pub retry_limit: usize,
    pub request_timeout_secs: u64,
    /// Skip short, marker-free symbols with a fixed placeholder summary.
    pub filter_small: bool,
    /// Symbols with fewer lines than this are "small".
    pub small_line_threshold: usize,
    /// Estimated prompt tokens per batch request.
    pub batch_token_budget: usize,
    pub max_batch_symbols: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Flush the store after this many completed symbols.
    pub checkpoint_every: usize,
    /// Relaxation passes for dependency hashes. `None` means file count + 1.
    pub cycle_iteration_cap: Option<usize>,
    pub store_path: PathBuf,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry_limit: DEFAULT_RETRY_LIMIT,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            filter_small: true,
            small_line_threshold: DEFAULT_SMALL_LINE_THRESHOLD,
            batch_token_budget: DEFAULT_BATCH_TOKEN_BUDGET,
            max_batch_symbols: DEFAULT_MAX_BATCH_SYMBOLS,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            cycle_iteration_cap: None,
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
        }
    }
}

impl IndexerConfig {
    /// Defaults overlaid with `LOGIC_INDEX_*` environment variables.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Overlay values from an arbitrary lookup. Split out from [`from_env`]
    /// so tests do not have to mutate the process environment.
    ///
    /// [`from_env`]: IndexerConfig::from_env
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| -> Option<u64> {
            lookup(key).and_then(|v| v.trim().parse::<u64>().ok())
        };

        if let Some(v) = number("LOGIC_INDEX_MAX_WORKERS") {
            self.max_concurrency = (v as usize).max(1);
        }
        if let Some(v) = number("LOGIC_INDEX_RETRY_LIMIT") {
            self.retry_limit = v as usize;
        }
        if let Some(v) = number("LOGIC_INDEX_TIMEOUT_SECS") {
            self.request_timeout_secs = v.max(1);
        }
        if let Some(v) = lookup("LOGIC_INDEX_FILTER_SMALL") {
            let v = v.trim().to_lowercase();
            match v.as_str() {
                "0" | "false" | "no" | "off" => self.filter_small = false,
                "1" | "true" | "yes" | "on" => self.filter_small = true,
                _ => {}
            }
        }
        if let Some(v) = number("LOGIC_INDEX_SMALL_THRESHOLD") {
            self.small_line_threshold = v as usize;
        }
        if let Some(v) = number("LOGIC_INDEX_BATCH_TOKENS") {
            self.batch_token_budget = (v as usize).max(1);
        }
        if let Some(v) = number("LOGIC_INDEX_BATCH_SYMBOLS") {
            self.max_batch_symbols = (v as usize).max(1);
        }
        if let Some(v) = number("LOGIC_INDEX_CHECKPOINT_EVERY") {
            self.checkpoint_every = (v as usize).max(1);
        }
        if let Some(v) = number("LOGIC_INDEX_CYCLE_CAP") {
            self.cycle_iteration_cap = Some((v as usize).max(1));
        }
        if let Some(v) = lookup("LOGIC_INDEX_DB") {
            let v = v.trim();
            if !v.is_empty() {
                self.store_path = PathBuf::from(v);
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Relaxation cap for a graph with `file_count` nodes.
    pub fn iteration_cap(&self, file_count: usize) -> usize {
        self.cycle_iteration_cap
            .unwrap_or(file_count + 1)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_conservative() {
        let config = IndexerConfig::default();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.retry_limit, 3);
        assert!(config.filter_small);
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = IndexerConfig::default();
        config.apply_env(lookup(&[
            ("LOGIC_INDEX_MAX_WORKERS", "5"),
            ("LOGIC_INDEX_FILTER_SMALL", "off"),
            ("LOGIC_INDEX_DB", "/tmp/x.db"),
            ("LOGIC_INDEX_CYCLE_CAP", "4"),
        ]));
        assert_eq!(config.max_concurrency, 5);
        assert!(!config.filter_small);
        assert_eq!(config.store_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.iteration_cap(100), 4);
    }

    #[test]
    fn unparseable_values_fall_back() {
        let mut config = IndexerConfig::default();
        config.apply_env(lookup(&[
            ("LOGIC_INDEX_MAX_WORKERS", "many"),
            ("LOGIC_INDEX_FILTER_SMALL", "maybe"),
            ("LOGIC_INDEX_MAX_WORKERS ", "9"),
        ]));
        assert_eq!(config, IndexerConfig::default());
    }

    #[test]
    fn zero_workers_clamped_to_one() {
        let mut config = IndexerConfig::default();
        config.apply_env(lookup(&[("LOGIC_INDEX_MAX_WORKERS", "0")]));
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn iteration_cap_defaults_to_file_count_plus_one() {
        let config = IndexerConfig::default();
        assert_eq!(config.iteration_cap(3), 4);
        assert_eq!(config.iteration_cap(0), 1);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: IndexerConfig =
            serde_json::from_str(r#"{"retry_limit": 7}"#).unwrap();
        assert_eq!(config.retry_limit, 7);
        assert_eq!(config.max_batch_symbols, DEFAULT_MAX_BATCH_SYMBOLS);
    }
}
