//! Runtime Settings
//!
//! Tunables that shape the runtime's resource footprint.
//!
//! ```rust,ignore
//! use cinder::RuntimeSettings;
//!
//! // Triple buffering with larger descriptor banks
//! let settings = RuntimeSettings {
//!     max_frames_in_flight: 3,
//!     descriptor_pool_bank_size: 256,
//!     ..Default::default()
//! };
//!
//! // Or from a JSON document
//! let settings = RuntimeSettings::from_json(r#"{ "max_frames_in_flight": 3 }"#)?;
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{CinderError, Result};

/// Configuration for a runtime instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Upper bound on the number of frame slots in the ring.
    ///
    /// The ring may be smaller when the presentation surface exposes fewer
    /// images, see `FrameRing::resize`.
    pub max_frames_in_flight: u32,

    /// Number of descriptor sets one pool bank can hold.
    ///
    /// Each bank reserves `bank_size × count` descriptors for every binding of
    /// the layout it serves.
    pub descriptor_pool_bank_size: u32,

    /// Number of background threads performing optimized pipeline relinks.
    pub relink_workers: usize,

    /// Log a JSON snapshot of every cache at `debug` level during shutdown.
    pub dump_caches_on_shutdown: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            descriptor_pool_bank_size: 64,
            relink_workers: 1,
            dump_caches_on_shutdown: true,
        }
    }
}

impl RuntimeSettings {
    /// Parses settings from JSON; missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frames_in_flight == 0 {
            return Err(CinderError::InvalidSettings(
                "max_frames_in_flight must be >= 1".into(),
            ));
        }
        if self.descriptor_pool_bank_size == 0 {
            return Err(CinderError::InvalidSettings(
                "descriptor_pool_bank_size must be >= 1".into(),
            ));
        }
        if self.relink_workers == 0 {
            return Err(CinderError::InvalidSettings(
                "relink_workers must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(RuntimeSettings::default().validate().is_ok());
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let s = RuntimeSettings::from_json(r#"{ "max_frames_in_flight": 3 }"#).unwrap();
        assert_eq!(s.max_frames_in_flight, 3);
        assert_eq!(s.descriptor_pool_bank_size, 64);
    }

    #[test]
    fn zero_bank_size_is_rejected() {
        let err = RuntimeSettings::from_json(r#"{ "descriptor_pool_bank_size": 0 }"#).unwrap_err();
        assert!(matches!(err, CinderError::InvalidSettings(_)));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = RuntimeSettings::from_json("{ max_frames_in_flight").unwrap_err();
        assert!(matches!(err, CinderError::SettingsParse(_)));
    }
}
