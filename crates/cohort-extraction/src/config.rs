//! Extraction configuration.
//!
//! Both structs deserialize from JSON with every field optional, so a
//! deployment can override only what it needs:
//!
//! ```rust
//! use cohort_extraction::CrossServerConfig;
//!
//! let config = CrossServerConfig::from_json(r#"{ "temporary_database": "scratch" }"#).unwrap();
//! assert_eq!(config.temporary_database, "scratch");
//! assert!(config.create_database_if_not_exists);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ExtractionResult;

/// Where and how a cohort is copied for a cross-server extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossServerConfig {
    /// Scratch database on the dataset's server that receives the cohort.
    pub temporary_database: String,
    /// Create the temporary database when it is absent.
    pub create_database_if_not_exists: bool,
    /// Drop a pre-existing table with the cohort table's name.
    pub drop_existing_cohort_table: bool,
}

impl Default for CrossServerConfig {
    fn default() -> Self {
        Self {
            temporary_database: "tempdb".to_string(),
            create_database_if_not_exists: true,
            drop_existing_cohort_table: false,
        }
    }
}

impl CrossServerConfig {
    /// Creates a new builder.
    pub fn builder() -> CrossServerConfigBuilder {
        CrossServerConfigBuilder::default()
    }

    /// Reads a config from JSON; absent fields take their defaults.
    pub fn from_json(json: &str) -> ExtractionResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Builder for [`CrossServerConfig`].
#[derive(Debug, Default)]
pub struct CrossServerConfigBuilder {
    config: CrossServerConfig,
}

impl CrossServerConfigBuilder {
    /// Sets the temporary database name.
    pub fn with_temporary_database(mut self, database: impl Into<String>) -> Self {
        self.config.temporary_database = database.into();
        self
    }

    /// Allows or forbids creating the temporary database.
    pub fn with_create_database(mut self, create: bool) -> Self {
        self.config.create_database_if_not_exists = create;
        self
    }

    /// Allows or forbids dropping a pre-existing cohort table.
    pub fn with_drop_existing_table(mut self, drop: bool) -> Self {
        self.config.drop_existing_cohort_table = drop;
        self
    }

    /// Builds the config.
    pub fn build(self) -> CrossServerConfig {
        self.config
    }
}

/// Salt used when columns are hashed on release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashingConfig {
    /// Salt appended to every hashed value.
    pub salt: String,
}

impl HashingConfig {
    /// Creates a hashing config.
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// The salt, unless it is blank.
    pub fn salt(&self) -> Option<&str> {
        let salt = self.salt.trim();
        (!salt.is_empty()).then_some(salt)
    }

    /// Reads a config from JSON.
    pub fn from_json(json: &str) -> ExtractionResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractionError;

    #[test]
    fn test_default_config() {
        let config = CrossServerConfig::default();
        assert_eq!(config.temporary_database, "tempdb");
        assert!(config.create_database_if_not_exists);
        assert!(!config.drop_existing_cohort_table);
    }

    #[test]
    fn test_builder() {
        let config = CrossServerConfig::builder()
            .with_temporary_database("scratch")
            .with_create_database(false)
            .with_drop_existing_table(true)
            .build();
        assert_eq!(config.temporary_database, "scratch");
        assert!(!config.create_database_if_not_exists);
        assert!(config.drop_existing_cohort_table);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CrossServerConfig::from_json(r#"{"drop_existing_cohort_table": true}"#).unwrap();
        assert_eq!(config.temporary_database, "tempdb");
        assert!(config.drop_existing_cohort_table);
    }

    #[test]
    fn test_invalid_json() {
        let err = CrossServerConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidConfig(_)));
    }

    #[test]
    fn test_blank_salt_is_no_salt() {
        assert_eq!(HashingConfig::new("  ").salt(), None);
        assert_eq!(HashingConfig::from_json(r#"{"salt":"pepper"}"#).unwrap().salt(), Some("pepper"));
    }
}
