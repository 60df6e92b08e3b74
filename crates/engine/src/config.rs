//! Runtime configuration via `orecstm.toml`
//!
//! A runtime has one default transaction configuration plus any number of
//! named families. Each family table is a complete [`TxnConfig`]; fields it
//! leaves out take the built-in defaults, not the values of `[default]`.
//!
//! ```toml
//! [default]
//! max_retries = 500
//!
//! [families.transfer]
//! write_skew_allowed = false
//! timeout_ns = 1000000000
//! ```

use orecstm_core::{StmError, StmResult, TxnConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Conventional config file name
pub const CONFIG_FILE_NAME: &str = "orecstm.toml";

/// Runtime configuration loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StmConfig {
    /// Configuration used by `Stm::atomic` and unnamed executors
    pub default: TxnConfig,
    /// Named transaction families
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub families: BTreeMap<String, TxnConfig>,
}

impl StmConfig {
    /// Configuration with only a default family
    pub fn new(default: TxnConfig) -> Self {
        StmConfig {
            default,
            families: BTreeMap::new(),
        }
    }

    /// Add (or replace) a named family
    ///
    /// The family's `family_name` is set to `name`.
    pub fn with_family(mut self, name: impl Into<String>, config: TxnConfig) -> Self {
        let name = name.into();
        let config = config.with_family_name(name.clone());
        self.families.insert(name, config);
        self
    }

    /// Configuration for `family`, if one is declared
    pub fn family(&self, family: &str) -> Option<&TxnConfig> {
        self.families.get(family)
    }

    /// Validate the default and every family
    ///
    /// A family table whose `family_name` was left at the default is named
    /// after its table key.
    pub fn validate(&mut self) -> StmResult<()> {
        self.default.validate()?;
        let anonymous = TxnConfig::default().family_name;
        for (name, config) in self.families.iter_mut() {
            if name.is_empty() {
                return Err(StmError::InvalidConfig(
                    "family name must not be empty".to_string(),
                ));
            }
            if config.family_name == anonymous {
                config.family_name = name.clone();
            }
            config.validate().map_err(|e| match e {
                StmError::InvalidConfig(msg) => {
                    StmError::InvalidConfig(format!("family '{}': {}", name, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> StmResult<Self> {
        let mut config: StmConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_toml_file(path: &Path) -> StmResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> StmResult<String> {
        toml::to_string(self).map_err(|e| StmError::InvalidConfig(e.to_string()))
    }
}
