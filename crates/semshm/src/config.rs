//! Configuration for writers and readers

use serde::{Deserialize, Serialize};

use crate::{IpcError, Result};

/// Default number of keys tried before giving up on random allocation.
pub const DEFAULT_MAX_KEY_ATTEMPTS: u32 = 10_000;

/// Default mode bits for SystemV segments and semaphores.
pub const DEFAULT_SYSV_PERMISSIONS: u32 = 0o666;

/// Default mode bits for POSIX shared memory objects.
pub const DEFAULT_POSIX_PERMISSIONS: u32 = 0o600;

/// Default `ftok` project id.
pub const DEFAULT_PROJECT_ID: u8 = 1;

/// Configuration for the shared memory transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Keys tried before random allocation reports exhaustion
    pub max_key_attempts: u32,

    /// Permission bits passed to `shmget` and `semget`
    pub sysv_permissions: u32,

    /// Permission bits passed to `shm_open`
    pub posix_permissions: u32,

    /// Project id for path-derived keys
    pub project_id: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_key_attempts: DEFAULT_MAX_KEY_ATTEMPTS,
            sysv_permissions: DEFAULT_SYSV_PERMISSIONS,
            posix_permissions: DEFAULT_POSIX_PERMISSIONS,
            project_id: DEFAULT_PROJECT_ID,
        }
    }
}

impl TransportConfig {
    /// Create configuration from environment variables
    ///
    /// Reads `SEMSHM_MAX_KEY_ATTEMPTS`, `SEMSHM_SYSV_PERMISSIONS` (octal),
    /// `SEMSHM_POSIX_PERMISSIONS` (octal) and `SEMSHM_PROJECT_ID`. Missing or
    /// unparsable values keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let octal = |name: &str, default: u32| {
            lookup(name)
                .and_then(|s| u32::from_str_radix(s.trim().trim_start_matches("0o"), 8).ok())
                .unwrap_or(default)
        };

        let config = Self {
            max_key_attempts: lookup("SEMSHM_MAX_KEY_ATTEMPTS")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.max_key_attempts),
            sysv_permissions: octal("SEMSHM_SYSV_PERMISSIONS", defaults.sysv_permissions),
            posix_permissions: octal("SEMSHM_POSIX_PERMISSIONS", defaults.posix_permissions),
            project_id: lookup("SEMSHM_PROJECT_ID")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.project_id),
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the collision retry bound
    #[must_use]
    pub const fn with_max_key_attempts(mut self, attempts: u32) -> Self {
        self.max_key_attempts = attempts;
        self
    }

    /// Set the SystemV permission bits
    #[must_use]
    pub const fn with_sysv_permissions(mut self, mode: u32) -> Self {
        self.sysv_permissions = mode;
        self
    }

    /// Set the POSIX permission bits
    #[must_use]
    pub const fn with_posix_permissions(mut self, mode: u32) -> Self {
        self.posix_permissions = mode;
        self
    }

    /// Set the `ftok` project id
    #[must_use]
    pub const fn with_project_id(mut self, project_id: u8) -> Self {
        self.project_id = project_id;
        self
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Config`] if:
    /// - `max_key_attempts` is zero
    /// - `project_id` is zero
    /// - a permission value has bits outside `0o777`
    pub fn validate(&self) -> Result<()> {
        if self.max_key_attempts == 0 {
            return Err(IpcError::Config(
                "max_key_attempts must be at least 1".to_string(),
            ));
        }
        if self.project_id == 0 {
            return Err(IpcError::Config("project_id must be non-zero".to_string()));
        }
        for (field, mode) in [
            ("sysv_permissions", self.sysv_permissions),
            ("posix_permissions", self.posix_permissions),
        ] {
            if mode & !0o777 != 0 {
                return Err(IpcError::Config(format!(
                    "{field} {mode:#o} has bits outside 0o777"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.max_key_attempts, 10_000);
        assert_eq!(config.sysv_permissions, 0o666);
        assert_eq!(config.posix_permissions, 0o600);
        assert_eq!(config.project_id, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("SEMSHM_MAX_KEY_ATTEMPTS", "25"),
            ("SEMSHM_SYSV_PERMISSIONS", "640"),
            ("SEMSHM_POSIX_PERMISSIONS", "0o644"),
            ("SEMSHM_PROJECT_ID", "nope"),
        ]
        .into_iter()
        .collect();

        let config = TransportConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_string()))
            .expect("config should load");
        assert_eq!(config.max_key_attempts, 25);
        assert_eq!(config.sysv_permissions, 0o640);
        assert_eq!(config.posix_permissions, 0o644);
        assert_eq!(config.project_id, 1);
    }

    #[test]
    fn test_validation() {
        let config = TransportConfig::default().with_max_key_attempts(0);
        assert!(matches!(config.validate(), Err(IpcError::Config(_))));

        let config = TransportConfig::default().with_project_id(0);
        assert!(config.validate().is_err());

        let config = TransportConfig::default().with_posix_permissions(0o4755);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let config = TransportConfig::default().with_sysv_permissions(0o600);
        let json = serde_json::to_string(&config).expect("serialize");
        let back: TransportConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(config, back);
    }
}
