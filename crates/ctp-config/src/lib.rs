//! Layered YAML configuration for the pipeline core.
//!
//! Generalizes the single-purpose layered-config loader this workspace used
//! for trading config: deep-merge a list of YAML documents in order, then
//! canonicalize (sorted object keys) and hash the result so two daemons
//! booted from the same logical config can prove it without comparing files
//! byte-for-byte.

use std::collections::HashMap;
use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const ENV_DATABASE_URL: &str = "CTP_DATABASE_URL";
pub const ENV_FORCE_MAX_CONCURRENCY: &str = "CTP_FORCE_MAX_CONCURRENCY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Test,
    Debug,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        match std::env::var("CTP_ENV").ok().as_deref() {
            Some("production") => Environment::Production,
            Some("test") => Environment::Test,
            Some("debug") => Environment::Debug,
            _ => Environment::Development,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub retention_count: u32,
    pub stale_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub check_interval_ms: u64,
    pub max_wait_time_secs: u64,
    pub max_failure_rate: f64,
    pub required_idle_checks: u32,
    pub shutdown_timeouts: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub api_rate_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub probe_count: u32,
}

/// Top-level config surface recognized by this pipeline, per the external
/// interfaces section: global cap, per-kind worker limits/priorities,
/// outbox/batch timing, cleanup and monitoring knobs, performance
/// throttles, and one breaker config per external dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub environment: Environment,
    pub max_concurrency: u32,
    pub worker_limits: HashMap<String, u32>,
    pub worker_priorities: HashMap<String, i32>,
    pub polling_interval_ms: u64,
    pub batch_size: u32,
    pub flush_interval_ms: u64,
    pub cleanup: CleanupConfig,
    pub monitoring: MonitoringConfig,
    pub performance: PerformanceConfig,
    pub breakers: HashMap<String, BreakerConfig>,
}

impl PipelineConfig {
    /// Hard-coded defaults per environment. Real deployments layer a YAML
    /// file on top via `load_layered_yaml`; these are the fallback when no
    /// file overrides a given key.
    pub fn defaults_for(env: Environment) -> Self {
        let mut worker_limits = HashMap::new();
        worker_limits.insert("file-analysis".to_string(), 20);
        worker_limits.insert("relationship-resolution".to_string(), 20);
        worker_limits.insert("llm-analysis".to_string(), 10);
        worker_limits.insert("graph-ingestion".to_string(), 5);

        let mut worker_priorities = HashMap::new();
        worker_priorities.insert("file-analysis".to_string(), 5);
        worker_priorities.insert("relationship-resolution".to_string(), 5);
        worker_priorities.insert("llm-analysis".to_string(), 3);
        worker_priorities.insert("graph-ingestion".to_string(), 1);

        let mut breakers = HashMap::new();
        breakers.insert(
            "llm".to_string(),
            BreakerConfig {
                failure_threshold: 5,
                reset_timeout_ms: 30_000,
                probe_count: 1,
            },
        );
        breakers.insert(
            "graph-store".to_string(),
            BreakerConfig {
                failure_threshold: 5,
                reset_timeout_ms: 10_000,
                probe_count: 1,
            },
        );
        breakers.insert(
            "cache".to_string(),
            BreakerConfig {
                failure_threshold: 10,
                reset_timeout_ms: 5_000,
                probe_count: 2,
            },
        );

        let max_concurrency = match env {
            Environment::Test | Environment::Debug => 10,
            Environment::Development => 50,
            Environment::Production => 100,
        };

        PipelineConfig {
            environment: env,
            max_concurrency,
            worker_limits,
            worker_priorities,
            polling_interval_ms: 1_000,
            batch_size: 100,
            flush_interval_ms: 500,
            cleanup: CleanupConfig {
                retention_count: 1_000,
                stale_age_secs: 300,
            },
            monitoring: MonitoringConfig {
                check_interval_ms: 2_000,
                max_wait_time_secs: 3_600,
                max_failure_rate: 0.5,
                required_idle_checks: 3,
                shutdown_timeouts: HashMap::new(),
            },
            performance: PerformanceConfig {
                cpu_threshold: 0.9,
                memory_threshold: 0.9,
                api_rate_limit: 60,
            },
            breakers,
        }
    }

    /// Apply process-env overrides that must win over any file layer.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var(ENV_FORCE_MAX_CONCURRENCY) {
            if let Ok(n) = v.parse::<u32>() {
                self.max_concurrency = n;
            }
        }
    }
}

/// Postgres pool size for a daemon running at `max_concurrency`: never
/// fewer than 20 connections, and enough beyond that for one connection
/// per 8 in-flight units of work (outbox dispatch, queue claims, and POI
/// batch flushes all compete for the same pool).
pub fn queue_pool_size(max_concurrency: u32) -> u32 {
    20.max(max_concurrency.div_ceil(8))
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: PipelineConfig,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Load + merge YAML files in order on top of the environment's defaults,
/// then canonicalize to JSON and hash. Later files override earlier files
/// via deep-merge; missing files are simply skipped (all config is
/// optional beyond the environment defaults).
pub fn load_layered_yaml(env: Environment, paths: &[&str]) -> Result<LoadedConfig> {
    let defaults = serde_json::to_value(PipelineConfig::defaults_for(env))
        .context("serialize default config")?;
    let mut merged = defaults;

    for p in paths {
        let s = match fs::read_to_string(p) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let mut config: PipelineConfig =
        serde_json::from_value(merged.clone()).context("merged config does not match schema")?;
    config.apply_env_overrides();

    let canonical = canonicalize_json(&serde_json::to_value(&config)?);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config,
        canonical_json: canonical,
        config_hash: hash,
    })
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_pool_size_has_a_twenty_connection_floor() {
        assert_eq!(queue_pool_size(10), 20);
        assert_eq!(queue_pool_size(100), 20);
        assert_eq!(queue_pool_size(160), 20);
        assert_eq!(queue_pool_size(161), 21);
        assert_eq!(queue_pool_size(400), 50);
    }

    #[test]
    fn defaults_differ_by_environment() {
        let dev = PipelineConfig::defaults_for(Environment::Development);
        let prod = PipelineConfig::defaults_for(Environment::Production);
        assert!(prod.max_concurrency > dev.max_concurrency);
    }

    #[test]
    fn same_config_hashes_identically() {
        let a = PipelineConfig::defaults_for(Environment::Test);
        let b = PipelineConfig::defaults_for(Environment::Test);
        let ca = canonicalize_json(&serde_json::to_value(&a).unwrap());
        let cb = canonicalize_json(&serde_json::to_value(&b).unwrap());
        assert_eq!(ca, cb);
    }

    #[test]
    fn layered_file_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.yaml");
        fs::write(&path, "max_concurrency: 7\n").unwrap();

        let loaded =
            load_layered_yaml(Environment::Test, &[path.to_str().unwrap()]).unwrap();
        assert_eq!(loaded.config.max_concurrency, 7);
    }

    #[test]
    fn force_max_concurrency_env_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.yaml");
        fs::write(&path, "max_concurrency: 7\n").unwrap();

        std::env::set_var(ENV_FORCE_MAX_CONCURRENCY, "42");
        let loaded =
            load_layered_yaml(Environment::Test, &[path.to_str().unwrap()]).unwrap();
        std::env::remove_var(ENV_FORCE_MAX_CONCURRENCY);

        assert_eq!(loaded.config.max_concurrency, 42);
    }
}
