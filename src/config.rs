//! Vault configuration
//!
//! Every field has a default, so a config file only needs to name what it
//! changes. Durations are whole seconds unless the field name says otherwise.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::{AuthFactor, FactorSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VaultConfig {
    pub keys: KeyPolicy,
    pub log: LogConfig,
    pub failsafe: FailsafeConfig,
    pub hardware: HardwareConfig,
    pub background: BackgroundConfig,
    pub storage: StorageConfig,
}

/// Rotation and verification policy for signing keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyPolicy {
    /// Age after which the active key is rotated
    pub rotation_interval_secs: u64,
    /// Maximum age of a signature's binding timestamp
    pub validity_window_secs: u64,
    /// How long a retired key keeps verifying; defaults to the validity window
    pub grace_period_secs: Option<u64>,
    /// Tolerated clock drift for binding timestamps in the future
    pub clock_skew_secs: u64,
    /// PBKDF2 iterations for the metadata encryption key
    pub metadata_kdf_iterations: u32,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            rotation_interval_secs: 24 * 60 * 60,
            validity_window_secs: 60 * 60,
            grace_period_secs: None,
            clock_skew_secs: 30,
            metadata_kdf_iterations: 100_000,
        }
    }
}

impl KeyPolicy {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn validity_window(&self) -> Duration {
        Duration::from_secs(self.validity_window_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs.unwrap_or(self.validity_window_secs))
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Attach a hardware quote to each entry when a root is present
    pub attest_entries: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            attest_entries: true,
        }
    }
}

/// What a heartbeat does while the monitor is not armed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Ignore it
    #[default]
    Lenient,
    /// Reject it with `NotArmed`
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailsafeConfig {
    pub heartbeat_timeout_secs: u64,
    pub strictness: Strictness,
    /// Factors that must all be presented to arm or disarm
    pub required_factors: FactorSet,
    /// Factors for an explicit trigger; defaults to the arming set plus
    /// `remote-operator`
    pub explicit_trigger_factors: Option<FactorSet>,
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 60,
            strictness: Strictness::Lenient,
            required_factors: FactorSet::from([AuthFactor::Pin, AuthFactor::HardwareToken]),
            explicit_trigger_factors: None,
        }
    }
}

impl FailsafeConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn explicit_trigger_factors(&self) -> FactorSet {
        match &self.explicit_trigger_factors {
            Some(factors) => factors.clone(),
            None => self
                .required_factors
                .union(&FactorSet::from([AuthFactor::RemoteOperator])),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HardwareConfig {
    /// Upper bound on any single hardware call
    pub timeout_ms: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

impl HardwareConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Periods of the background threads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackgroundConfig {
    pub failsafe_tick_ms: u64,
    pub rotation_check_secs: u64,
    pub integrity_scan_secs: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            failsafe_tick_ms: 1_000,
            rotation_check_secs: 60,
            integrity_scan_secs: 300,
        }
    }
}

impl BackgroundConfig {
    pub fn failsafe_tick(&self) -> Duration {
        Duration::from_millis(self.failsafe_tick_ms)
    }

    pub fn rotation_check(&self) -> Duration {
        Duration::from_secs(self.rotation_check_secs)
    }

    pub fn integrity_scan(&self) -> Duration {
        Duration::from_secs(self.integrity_scan_secs)
    }
}

/// Where the file-backed stores live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub key_dir: PathBuf,
    pub log_path: PathBuf,
    /// Seed of the software root used with `--emulated-hardware`
    pub emulated_root_seed: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from("sealkeep/keys"),
            log_path: PathBuf::from("sealkeep/audit.jsonl"),
            emulated_root_seed: PathBuf::from("sealkeep/emulated-root.seed"),
        }
    }
}

impl VaultConfig {
    /// Read, parse and validate a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: VaultConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the vault cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let keys = &self.keys;
        non_zero("keys.rotation_interval_secs", keys.rotation_interval_secs)?;
        non_zero("keys.validity_window_secs", keys.validity_window_secs)?;
        non_zero(
            "keys.metadata_kdf_iterations",
            u64::from(keys.metadata_kdf_iterations),
        )?;
        if keys.grace_period() > keys.rotation_interval() {
            return Err(invalid(
                "keys.grace_period_secs",
                "must not exceed the rotation interval",
            ));
        }

        let failsafe = &self.failsafe;
        non_zero("failsafe.heartbeat_timeout_secs", failsafe.heartbeat_timeout_secs)?;
        if failsafe.required_factors.is_empty() {
            return Err(invalid(
                "failsafe.required_factors",
                "at least one factor is required",
            ));
        }
        if !failsafe
            .explicit_trigger_factors()
            .is_superset(&failsafe.required_factors)
        {
            return Err(invalid(
                "failsafe.explicit_trigger_factors",
                "must include every arming factor",
            ));
        }

        non_zero("hardware.timeout_ms", self.hardware.timeout_ms)?;
        non_zero("background.failsafe_tick_ms", self.background.failsafe_tick_ms)?;
        non_zero(
            "background.rotation_check_secs",
            self.background.rotation_check_secs,
        )?;
        non_zero(
            "background.integrity_scan_secs",
            self.background.integrity_scan_secs,
        )?;
        Ok(())
    }
}

fn non_zero(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = VaultConfig::default();
        config.validate().unwrap();

        assert_eq!(config.keys.grace_period(), Duration::from_secs(3600));
        assert_eq!(config.failsafe.heartbeat_timeout(), Duration::from_secs(60));
        assert!(config
            .failsafe
            .explicit_trigger_factors()
            .contains(AuthFactor::RemoteOperator));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = VaultConfig::from_toml_str(
            r#"
            [keys]
            rotation_interval_secs = 7200

            [failsafe]
            strictness = "strict"
            required_factors = ["pin", "passphrase"]
            "#,
        )
        .unwrap();

        assert_eq!(config.keys.rotation_interval(), Duration::from_secs(7200));
        assert_eq!(config.keys.validity_window_secs, 3600);
        assert_eq!(config.failsafe.strictness, Strictness::Strict);
        assert!(config.failsafe.required_factors.contains(AuthFactor::Passphrase));
        assert_eq!(config.hardware.timeout_ms, 5_000);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            VaultConfig::from_toml_str("[keys]\nrotation = 5\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_grace_beyond_rotation_rejected() {
        let mut config = VaultConfig::default();
        config.keys.grace_period_secs = Some(config.keys.rotation_interval_secs + 1);

        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "keys.grace_period_secs"
        ));
    }

    #[test]
    fn test_explicit_trigger_must_cover_arming_factors() {
        let mut config = VaultConfig::default();
        config.failsafe.explicit_trigger_factors =
            Some(FactorSet::from([AuthFactor::RemoteOperator]));

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = VaultConfig::default();
        config.failsafe.heartbeat_timeout_secs = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            VaultConfig::from_file("/nonexistent/sealkeep.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
