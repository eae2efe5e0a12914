//! Authentication factors presented to the failsafe monitor

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// One authentication factor the operator has already satisfied
///
/// Factor verification happens in the caller (PIN pad, token, biometric
/// reader); the monitor only compares sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthFactor {
    Pin,
    HardwareToken,
    Passphrase,
    Biometric,
    RemoteOperator,
}

impl AuthFactor {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthFactor::Pin => "pin",
            AuthFactor::HardwareToken => "hardware-token",
            AuthFactor::Passphrase => "passphrase",
            AuthFactor::Biometric => "biometric",
            AuthFactor::RemoteOperator => "remote-operator",
        }
    }

    pub fn parse(s: &str) -> Result<Self, FactorError> {
        match s.trim() {
            "pin" => Ok(AuthFactor::Pin),
            "hardware-token" => Ok(AuthFactor::HardwareToken),
            "passphrase" => Ok(AuthFactor::Passphrase),
            "biometric" => Ok(AuthFactor::Biometric),
            "remote-operator" => Ok(AuthFactor::RemoteOperator),
            other => Err(FactorError::Unknown {
                factor: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for AuthFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered set of factors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactorSet(BTreeSet<AuthFactor>);

impl FactorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, factor: AuthFactor) -> bool {
        self.0.insert(factor)
    }

    pub fn contains(&self, factor: AuthFactor) -> bool {
        self.0.contains(&factor)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_superset(&self, other: &FactorSet) -> bool {
        self.0.is_superset(&other.0)
    }

    /// Factors of `required` that are not in `self`
    pub fn missing_from(&self, required: &FactorSet) -> Vec<AuthFactor> {
        required.0.difference(&self.0).copied().collect()
    }

    pub fn union(&self, other: &FactorSet) -> FactorSet {
        FactorSet(self.0.union(&other.0).copied().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = AuthFactor> + '_ {
        self.0.iter().copied()
    }

    /// Parse a comma-separated list such as `pin,hardware-token`
    pub fn parse_list(list: &str) -> Result<Self, FactorError> {
        list.split(',')
            .filter(|s| !s.trim().is_empty())
            .map(AuthFactor::parse)
            .collect()
    }
}

impl FromIterator<AuthFactor> for FactorSet {
    fn from_iter<I: IntoIterator<Item = AuthFactor>>(iter: I) -> Self {
        FactorSet(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[AuthFactor; N]> for FactorSet {
    fn from(factors: [AuthFactor; N]) -> Self {
        factors.into_iter().collect()
    }
}

impl fmt::Display for FactorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|f| f.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FactorError {
    #[error("Unknown authentication factor: {factor}")]
    Unknown { factor: String },
}
