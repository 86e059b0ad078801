//! Observer configuration.

use fsp_error::{FspError, Result};
use fsp_types::{FsVariant, JournalingMode};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings fixed for the lifetime of one observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub filesystem: FsVariant,
    pub journaling_mode: JournalingMode,
    /// Match queued faults against traffic. Classification and tracing run
    /// regardless.
    pub inject_faults: bool,
    /// Feed completed writes through the protocol automaton.
    pub validate_protocol: bool,
    /// Records retained before the oldest are evicted.
    /// Default: 1,000,000.
    pub trace_capacity: usize,
    /// Byte budget of one extracted trace chunk.
    /// Default: 50 MiB.
    pub trace_chunk_bytes: usize,
    /// Record budget of one extracted trace chunk.
    /// Default: 100,000.
    pub trace_chunk_records: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            filesystem: FsVariant::Ext3,
            journaling_mode: JournalingMode::Ordered,
            inject_faults: false,
            validate_protocol: true,
            trace_capacity: 1_000_000,
            trace_chunk_bytes: 50 * 1024 * 1024,
            trace_chunk_records: 100_000,
        }
    }
}

impl ObserverConfig {
    #[must_use]
    pub fn new(filesystem: FsVariant, journaling_mode: JournalingMode) -> Self {
        Self {
            filesystem,
            journaling_mode,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| FspError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
            .map_err(|e| FspError::Config(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        if self.trace_capacity == 0 {
            return Err(FspError::Config("trace_capacity must be positive".to_owned()));
        }
        if self.trace_chunk_bytes == 0 || self.trace_chunk_records == 0 {
            return Err(FspError::Config(
                "trace chunk budgets must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_fields_take_defaults() {
        let config = ObserverConfig::from_json_str(r#"{"filesystem":"jfs","inject_faults":true}"#)
            .expect("config");
        assert_eq!(config.filesystem, FsVariant::Jfs);
        assert_eq!(config.journaling_mode, JournalingMode::Ordered);
        assert!(config.inject_faults);
        assert!(config.validate_protocol);
        assert_eq!(config.trace_chunk_records, 100_000);
    }

    #[test]
    fn zero_budgets_rejected() {
        let err = ObserverConfig::from_json_str(r#"{"trace_capacity":0}"#).expect_err("zero");
        assert!(matches!(err, FspError::Config(_)));
        assert!(ObserverConfig::from_json_str(r#"{"journaling_mode":"bogus"}"#).is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"filesystem":"reiserfs","journaling_mode":"writeback"}}"#)
            .expect("write");
        let config = ObserverConfig::load(file.path()).expect("load");
        assert_eq!(
            config,
            ObserverConfig::new(FsVariant::Reiserfs, JournalingMode::Writeback)
        );
    }
}
