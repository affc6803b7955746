use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::queue::validate_name;
use crate::settings::CoordSettings;

pub const DEFAULT_CONFIG_FILENAME: &str = "leaseq.toml";
pub const ENV_CONFIG_KEY: &str = "LEASEQ_CONFIG";

pub fn resolve_config_source(config_path: Option<&str>) -> (Option<String>, String) {
    if let Some(path) = config_path {
        return (Some(path.to_string()), "explicit path".to_string());
    }

    if let Ok(env_path) = std::env::var(ENV_CONFIG_KEY)
        && !env_path.is_empty()
    {
        return (Some(env_path), format!("{ENV_CONFIG_KEY} env var"));
    }

    let default_path = Path::new(DEFAULT_CONFIG_FILENAME);
    if default_path.is_file() {
        return (
            Some(default_path.to_string_lossy().to_string()),
            format!("{DEFAULT_CONFIG_FILENAME} in cwd"),
        );
    }

    (None, "not found".to_string())
}

/// Loads settings from a TOML file, then applies `LEASEQ_*` environment overrides.
pub fn load_toml_settings(config_path: Option<&str>) -> Result<CoordSettings> {
    dotenvy::dotenv().ok();

    let (path, _) = resolve_config_source(config_path);
    let path = path.ok_or_else(|| {
        anyhow::anyhow!(
            "leaseq config not found. Pass a path, set {ENV_CONFIG_KEY}, or add {DEFAULT_CONFIG_FILENAME}."
        )
    })?;

    let payload = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config at {path}"))?;
    let toml_value: toml::Value =
        toml::from_str(&payload).with_context(|| format!("failed to parse TOML at {path}"))?;
    let json_value = serde_json::to_value(toml_value).context("failed to convert TOML to JSON")?;

    build_settings(unwrap_leaseq_table(json_value)?)
}

/// Like [`load_toml_settings`], but a missing config file yields defaults plus env overrides.
pub fn load_settings_or_default(config_path: Option<&str>) -> Result<CoordSettings> {
    let (path, _) = resolve_config_source(config_path);
    if path.is_some() {
        return load_toml_settings(config_path);
    }
    dotenvy::dotenv().ok();
    build_settings(Value::Object(Map::new()))
}

fn build_settings(file_value: Value) -> Result<CoordSettings> {
    let merged = deep_merge(file_value, env_overrides()?);
    let settings: CoordSettings = serde_json::from_value(merged)
        .map_err(|err| anyhow::anyhow!("invalid leaseq config: {err}"))?;
    validate_settings(&settings)?;
    Ok(settings)
}

fn unwrap_leaseq_table(payload: Value) -> Result<Value> {
    match payload {
        Value::Object(mut map) => match map.remove("leaseq") {
            Some(inner @ Value::Object(_)) => Ok(inner),
            Some(_) => Err(anyhow::anyhow!("[leaseq] must be a TOML table")),
            None => Ok(Value::Object(map)),
        },
        _ => Err(anyhow::anyhow!("leaseq config must be a TOML table")),
    }
}

pub fn validate_settings(settings: &CoordSettings) -> Result<()> {
    if settings.redis_dsn.trim().is_empty() {
        anyhow::bail!("redis_dsn cannot be empty");
    }
    validate_name("key_prefix", &settings.key_prefix)?;
    validate_name("default_queue_name", &settings.default_queue_name)?;
    if settings.default_max_retries < 0 {
        anyhow::bail!("default_max_retries must be >= 0");
    }
    if settings.default_job_timeout_seconds <= 0 {
        anyhow::bail!("default_job_timeout_seconds must be positive");
    }
    if settings.default_result_ttl_seconds < 0 {
        anyhow::bail!("default_result_ttl_seconds must be >= 0");
    }
    if settings.dequeue_batch_size == 0 {
        anyhow::bail!("dequeue_batch_size must be positive");
    }
    if settings.reclaim_batch_size == 0 || settings.promote_batch_size == 0 {
        anyhow::bail!("reclaim_batch_size and promote_batch_size must be positive");
    }
    if settings.base_retry_delay_seconds < 0.0 {
        anyhow::bail!("base_retry_delay_seconds must be >= 0");
    }
    if settings.max_retry_delay_seconds < settings.base_retry_delay_seconds {
        anyhow::bail!("max_retry_delay_seconds must be >= base_retry_delay_seconds");
    }
    if !(0.0..1.0).contains(&settings.retry_jitter_factor) {
        anyhow::bail!("retry_jitter_factor must be in [0, 1)");
    }
    if settings.worker_heartbeat_ttl_seconds <= 0 {
        anyhow::bail!("worker_heartbeat_ttl_seconds must be positive");
    }
    if settings.idempotency_ttl_seconds <= 0 {
        anyhow::bail!("idempotency_ttl_seconds must be positive");
    }
    if settings.max_payload_bytes == 0 {
        anyhow::bail!("max_payload_bytes must be positive");
    }
    if settings.lock.default_ttl_seconds <= 0.0 {
        anyhow::bail!("lock.default_ttl_seconds must be positive");
    }
    if settings.lock.acquire_timeout_seconds < 0.0 {
        anyhow::bail!("lock.acquire_timeout_seconds must be >= 0");
    }
    Ok(())
}

fn env_overrides() -> Result<Value> {
    let mut payload = Map::new();

    set_env_string(&mut payload, "redis_dsn", "LEASEQ_REDIS_DSN");
    set_env_string(&mut payload, "key_prefix", "LEASEQ_KEY_PREFIX");
    set_env_string(&mut payload, "default_queue_name", "LEASEQ_DEFAULT_QUEUE_NAME");
    set_env_int(&mut payload, "default_priority", "LEASEQ_DEFAULT_PRIORITY")?;
    set_env_int(
        &mut payload,
        "default_max_retries",
        "LEASEQ_DEFAULT_MAX_RETRIES",
    )?;
    set_env_int(
        &mut payload,
        "default_job_timeout_seconds",
        "LEASEQ_DEFAULT_JOB_TIMEOUT_SECONDS",
    )?;
    set_env_int(
        &mut payload,
        "default_result_ttl_seconds",
        "LEASEQ_DEFAULT_RESULT_TTL_SECONDS",
    )?;
    set_env_int(&mut payload, "dequeue_batch_size", "LEASEQ_DEQUEUE_BATCH_SIZE")?;
    set_env_int(&mut payload, "reclaim_batch_size", "LEASEQ_RECLAIM_BATCH_SIZE")?;
    set_env_int(&mut payload, "promote_batch_size", "LEASEQ_PROMOTE_BATCH_SIZE")?;
    set_env_float(
        &mut payload,
        "base_retry_delay_seconds",
        "LEASEQ_BASE_RETRY_DELAY_SECONDS",
    )?;
    set_env_float(
        &mut payload,
        "max_retry_delay_seconds",
        "LEASEQ_MAX_RETRY_DELAY_SECONDS",
    )?;
    set_env_float(
        &mut payload,
        "retry_jitter_factor",
        "LEASEQ_RETRY_JITTER_FACTOR",
    )?;
    set_env_int(
        &mut payload,
        "worker_heartbeat_ttl_seconds",
        "LEASEQ_WORKER_HEARTBEAT_TTL_SECONDS",
    )?;
    set_env_int(
        &mut payload,
        "idempotency_ttl_seconds",
        "LEASEQ_IDEMPOTENCY_TTL_SECONDS",
    )?;
    set_env_int(&mut payload, "max_payload_bytes", "LEASEQ_MAX_PAYLOAD_BYTES")?;

    let mut lock = Map::new();
    set_env_float(&mut lock, "default_ttl_seconds", "LEASEQ_LOCK_TTL_SECONDS")?;
    set_env_float(
        &mut lock,
        "acquire_timeout_seconds",
        "LEASEQ_LOCK_ACQUIRE_TIMEOUT_SECONDS",
    )?;
    set_env_int(&mut lock, "retry_delay_ms", "LEASEQ_LOCK_RETRY_DELAY_MS")?;
    if !lock.is_empty() {
        payload.insert("lock".to_string(), Value::Object(lock));
    }

    Ok(Value::Object(payload))
}

fn set_env_string(map: &mut Map<String, Value>, key: &str, env: &str) {
    if let Ok(value) = std::env::var(env)
        && !value.is_empty()
    {
        map.insert(key.to_string(), Value::String(value));
    }
}

fn set_env_int(map: &mut Map<String, Value>, key: &str, env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        if value.is_empty() {
            return Ok(());
        }
        let parsed: i64 = value
            .parse()
            .with_context(|| format!("Invalid {env} value: {value}"))?;
        map.insert(key.to_string(), Value::Number(parsed.into()));
    }
    Ok(())
}

fn set_env_float(map: &mut Map<String, Value>, key: &str, env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        if value.is_empty() {
            return Ok(());
        }
        let parsed: f64 = value
            .parse()
            .with_context(|| format!("Invalid {env} value: {value}"))?;
        let number = serde_json::Number::from_f64(parsed)
            .ok_or_else(|| anyhow::anyhow!("Invalid {env} value: {value}"))?;
        map.insert(key.to_string(), Value::Number(number));
    }
    Ok(())
}

fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay_value) => overlay_value,
    }
}

#[cfg(test)]
#[allow(unsafe_code)] // env var manipulation in tests
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Mutex, OnceLock};
    use uuid::Uuid;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn load_toml_settings_merges_env_over_file() {
        let _lock = env_lock().lock().unwrap();
        unsafe {
            std::env::set_var("LEASEQ_DEFAULT_QUEUE_NAME", "from_env");
            std::env::set_var("LEASEQ_LOCK_RETRY_DELAY_MS", "40");
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaseq.toml");
        let config = r#"
        [leaseq]
        redis_dsn = "redis://localhost:6379/9"
        default_queue_name = "from_toml"
        default_max_retries = 7
        [leaseq.lock]
        default_ttl_seconds = 12.5
        "#;
        fs::write(&path, config).unwrap();

        let result = load_toml_settings(Some(path.to_str().unwrap()));
        unsafe {
            std::env::remove_var("LEASEQ_DEFAULT_QUEUE_NAME");
            std::env::remove_var("LEASEQ_LOCK_RETRY_DELAY_MS");
        }
        let settings = result.unwrap();
        assert_eq!(settings.redis_dsn, "redis://localhost:6379/9");
        assert_eq!(settings.default_queue_name, "from_env");
        assert_eq!(settings.default_max_retries, 7);
        assert_eq!(settings.lock.default_ttl_seconds, 12.5);
        assert_eq!(settings.lock.retry_delay_ms, 40);
    }

    #[test]
    fn env_overrides_cover_batch_and_idempotency_settings() {
        let _lock = env_lock().lock().unwrap();
        unsafe {
            std::env::set_var("LEASEQ_RECLAIM_BATCH_SIZE", "7");
            std::env::set_var("LEASEQ_PROMOTE_BATCH_SIZE", "11");
            std::env::set_var("LEASEQ_IDEMPOTENCY_TTL_SECONDS", "90");
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaseq.toml");
        fs::write(&path, "[leaseq]\nreclaim_batch_size = 3\n").unwrap();
        let result = load_toml_settings(Some(path.to_str().unwrap()));
        unsafe {
            std::env::remove_var("LEASEQ_RECLAIM_BATCH_SIZE");
            std::env::remove_var("LEASEQ_PROMOTE_BATCH_SIZE");
            std::env::remove_var("LEASEQ_IDEMPOTENCY_TTL_SECONDS");
        }
        let settings = result.unwrap();
        assert_eq!(settings.reclaim_batch_size, 7);
        assert_eq!(settings.promote_batch_size, 11);
        assert_eq!(settings.idempotency_ttl_seconds, 90);
    }

    #[test]
    fn load_toml_settings_accepts_top_level_keys() {
        let _lock = env_lock().lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaseq.toml");
        fs::write(&path, "key_prefix = \"tenant-a\"\n").unwrap();
        let settings = load_toml_settings(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(settings.key_prefix, "tenant-a");
    }

    #[test]
    fn load_toml_settings_rejects_invalid_jitter() {
        let _lock = env_lock().lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaseq.toml");
        fs::write(&path, "[leaseq]\nretry_jitter_factor = 1.5\n").unwrap();
        let err = load_toml_settings(Some(path.to_str().unwrap())).unwrap_err();
        assert!(err.to_string().contains("retry_jitter_factor"));
    }

    #[test]
    fn load_toml_settings_rejects_bad_env_value() {
        let _lock = env_lock().lock().unwrap();
        unsafe {
            std::env::set_var("LEASEQ_DEFAULT_MAX_RETRIES", "lots");
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaseq.toml");
        fs::write(&path, "[leaseq]\n").unwrap();
        let result = load_toml_settings(Some(path.to_str().unwrap()));
        unsafe {
            std::env::remove_var("LEASEQ_DEFAULT_MAX_RETRIES");
        }
        let err = result.unwrap_err();
        assert!(err.to_string().contains("LEASEQ_DEFAULT_MAX_RETRIES"));
    }

    #[test]
    fn resolve_config_source_prefers_explicit_path() {
        let (path, source) = resolve_config_source(Some("custom.toml"));
        assert_eq!(path, Some("custom.toml".to_string()));
        assert_eq!(source, "explicit path");
    }

    #[test]
    fn resolve_config_source_falls_back_to_env() {
        let _lock = env_lock().lock().unwrap();
        let value = format!("leaseq-{}.toml", Uuid::new_v4());
        unsafe {
            std::env::set_var(ENV_CONFIG_KEY, &value);
        }
        let (path, source) = resolve_config_source(None);
        unsafe {
            std::env::remove_var(ENV_CONFIG_KEY);
        }
        assert_eq!(path, Some(value));
        assert!(source.contains(ENV_CONFIG_KEY));
    }

    #[test]
    fn deep_merge_overlays_nested_tables() {
        let base = serde_json::json!({ "lock": { "retry_delay_ms": 5, "default_ttl_seconds": 3.0 } });
        let overlay = serde_json::json!({ "lock": { "retry_delay_ms": 9 } });
        let merged = deep_merge(base, overlay);
        assert_eq!(merged["lock"]["retry_delay_ms"], 9);
        assert_eq!(merged["lock"]["default_ttl_seconds"], 3.0);
    }
}
