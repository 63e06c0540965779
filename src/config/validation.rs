//! Configuration validation.

use crate::config::Config;
use std::collections::HashSet;

/// Validate the configuration.
///
/// Every violation is collected, so one round trip surfaces all problems.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.balancer.port == 0 {
        errors.push("balancer.port must be positive".to_string());
    }

    if config.balancer.health_check_interval.is_zero() {
        errors.push("balancer.health_check_interval must be positive".to_string());
    }

    if config.balancer.failure_threshold <= 0.0 {
        errors.push(format!(
            "balancer.failure_threshold must be positive, got {}",
            config.balancer.failure_threshold
        ));
    }

    if config.backends.is_empty() {
        errors.push("at least one backend must be configured".to_string());
    }

    let mut keys = HashSet::new();
    for (i, backend) in config.backends.iter().enumerate() {
        if backend.host.is_empty() {
            errors.push(format!("backend {}: missing host", i));
        }
        if backend.port == 0 {
            errors.push(format!("backend {}: port must be positive", i));
        }
        if backend.weight == 0 {
            errors.push(format!(
                "backend {} ({}): weight must be >= 1",
                i,
                backend.key()
            ));
        }
        if !keys.insert(backend.key()) {
            errors.push(format!("duplicate backend: {}", backend.key()));
        }
    }

    if config.pool.max_idle == 0 {
        errors.push("pool.max_idle must be positive".to_string());
    }
    if config.pool.max_active == 0 {
        errors.push("pool.max_active must be positive".to_string());
    }
    if config.pool.idle_timeout.is_zero() {
        errors.push("pool.idle_timeout must be positive".to_string());
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
