//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `memory_max_bytes` exceeds 4GB
    /// - `max_body_bytes` is 0 or exceeds 100MB
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - `user_agent` is empty
    /// - `accepted_content_types` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_max_bytes as u64 > 4 * 1024 * 1024 * 1024 {
            return Err(ConfigError::Invalid {
                field: "memory_max_bytes".into(),
                reason: "must not exceed 4GB".into(),
            });
        }

        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid { field: "max_body_bytes".into(), reason: "must be greater than 0".into() });
        }
        if self.max_body_bytes > 100 * 1024 * 1024 {
            return Err(ConfigError::Invalid { field: "max_body_bytes".into(), reason: "must not exceed 100MB".into() });
        }

        if self.timeout_ms < 100 {
            return Err(ConfigError::Invalid { field: "timeout_ms".into(), reason: "must be at least 100ms".into() });
        }
        if self.timeout_ms > 300_000 {
            return Err(ConfigError::Invalid {
                field: "timeout_ms".into(),
                reason: "must not exceed 5 minutes (300000ms)".into(),
            });
        }

        if self.user_agent.is_empty() {
            return Err(ConfigError::Invalid { field: "user_agent".into(), reason: "must not be empty".into() });
        }

        if self.accepted_content_types.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: "accepted_content_types".into(),
                reason: "must name at least one content type".into(),
            });
        }

        if self.auth_username.is_some() != self.auth_password.is_some() {
            tracing::warn!(
                has_username = self.auth_username.is_some(),
                has_password = self.auth_password.is_some(),
                "Only one of auth_username and auth_password is set; \
                 no Authorization header will be sent"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_memory_budget_allowed() {
        let config = AppConfig { memory_max_bytes: 0, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_max_body_bytes_zero() {
        let config = AppConfig { max_body_bytes: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "max_body_bytes"));
    }

    #[test]
    fn test_validate_timeout_too_small() {
        let config = AppConfig { timeout_ms: 50, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "timeout_ms"));
    }

    #[test]
    fn test_validate_timeout_exceeds_limit() {
        let config = AppConfig { timeout_ms: 301_000, ..Default::default() }; // 5min 1sec
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "timeout_ms"));
    }

    #[test]
    fn test_validate_empty_user_agent() {
        let config = AppConfig { user_agent: String::new(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "user_agent"));
    }

    #[test]
    fn test_validate_empty_content_types() {
        let config = AppConfig { accepted_content_types: vec![" ".into()], ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "accepted_content_types"));
    }

    #[test]
    fn test_validate_half_credentials_only_warns() {
        let config = AppConfig { auth_username: Some("user".into()), ..Default::default() };
        assert!(config.validate().is_ok());
    }
}
