//! # Application Configuration
//!
//! Loaded from an optional TOML file, then overridden by `GNOSIS_*`
//! environment variables.
//!
//! ```toml
//! [core]
//! max_self_model_depth = 5
//! freshness_window_secs = 300
//!
//! [keys]
//! signing_key_file = "gnosis.key"
//!
//! [keys.planes]
//! digital = "<hex verifying key>"
//! mental = "<hex verifying key>"
//! ```

use ed25519_dalek::{SigningKey, VerifyingKey};
use gnosis_core::messaging::{generate_signing_key, signing_key_from_hex, verifying_key_from_hex};
use gnosis_core::{GnosisConfig, GnosisError, Plane};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Maximum config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

// =============================================================================
// CONFIG TYPES
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Core tunables.
    pub core: GnosisConfig,
    /// Key material for signing responses and verifying planes.
    pub keys: KeySettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySettings {
    /// File holding the core's hex-encoded signing key.
    pub signing_key_file: Option<PathBuf>,
    /// Plane name to hex-encoded verifying key.
    pub planes: BTreeMap<String, String>,
}

// =============================================================================
// LOADING
// =============================================================================

impl AppConfig {
    /// Read `path` (if any), apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, GnosisError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.core.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, GnosisError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            GnosisError::Storage(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(GnosisError::Validation(format!(
                "config file is {} bytes, limit is {}",
                metadata.len(),
                MAX_CONFIG_FILE_SIZE
            )));
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            GnosisError::Storage(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, GnosisError> {
        toml::from_str(text).map_err(|e| GnosisError::Serialization(format!("config: {}", e)))
    }

    /// Apply `GNOSIS_*` overrides fetched through `lookup`.
    ///
    /// Recognized names: every core field upper-cased with a `GNOSIS_`
    /// prefix, `GNOSIS_SIGNING_KEY_FILE` and `GNOSIS_PLANE_KEY_<PLANE>`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), GnosisError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let core = &mut self.core;
        override_with(&lookup, "GNOSIS_MAX_SELF_MODEL_DEPTH", &mut core.max_self_model_depth)?;
        override_with(&lookup, "GNOSIS_RECALL_BOOST", &mut core.recall_boost)?;
        override_with(&lookup, "GNOSIS_RECALL_THRESHOLD", &mut core.recall_threshold)?;
        override_with(&lookup, "GNOSIS_DEFAULT_DECAY_RATE", &mut core.default_decay_rate)?;
        override_with(
            &lookup,
            "GNOSIS_RECENCY_HALF_LIFE_SECS",
            &mut core.recency_half_life_secs,
        )?;
        override_with(&lookup, "GNOSIS_FEEDBACK_DECAY", &mut core.feedback_decay)?;
        override_with(
            &lookup,
            "GNOSIS_FRESHNESS_WINDOW_SECS",
            &mut core.freshness_window_secs,
        )?;

        if let Some(file) = lookup("GNOSIS_SIGNING_KEY_FILE").filter(|v| !v.is_empty()) {
            self.keys.signing_key_file = Some(PathBuf::from(file));
        }
        for plane in Plane::ALL {
            let name = format!("GNOSIS_PLANE_KEY_{}", plane.as_str().to_ascii_uppercase());
            if let Some(key) = lookup(&name).filter(|v| !v.is_empty()) {
                self.keys.planes.insert(plane.to_string(), key);
            }
        }
        Ok(())
    }

    // =========================================================================
    // KEYS
    // =========================================================================

    /// The configured signing key, or a fresh one when none is configured.
    pub fn signing_key(&self) -> Result<SigningKey, GnosisError> {
        match &self.keys.signing_key_file {
            Some(path) => read_signing_key(path),
            None => {
                tracing::warn!(
                    "No signing key configured; responses are signed with an ephemeral key. \
                     Set keys.signing_key_file or GNOSIS_SIGNING_KEY_FILE."
                );
                Ok(generate_signing_key())
            }
        }
    }

    /// Parsed plane verifying keys.
    pub fn plane_keys(&self) -> Result<Vec<(Plane, VerifyingKey)>, GnosisError> {
        self.keys
            .planes
            .iter()
            .map(|(plane, key)| Ok((Plane::from_str(plane)?, verifying_key_from_hex(key)?)))
            .collect()
    }
}

fn override_with<T, F>(lookup: &F, name: &str, slot: &mut T) -> Result<(), GnosisError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name).filter(|v| !v.is_empty()) else {
        return Ok(());
    };
    *slot = raw
        .trim()
        .parse()
        .map_err(|e| GnosisError::Validation(format!("{}={}: {}", name, raw, e)))?;
    Ok(())
}

/// Read a hex-encoded signing key from `path`.
pub fn read_signing_key(path: &Path) -> Result<SigningKey, GnosisError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        GnosisError::Storage(format!("cannot read key '{}': {}", path.display(), e))
    })?;
    signing_key_from_hex(&text)
}

// =============================================================================
// TESTS
// =============================================================================
