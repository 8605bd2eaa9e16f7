//! Coordinator configuration and per-call transaction options.

use serde::{Deserialize, Serialize};

use crate::transaction::isolation::IsolationLevel;

/// Coordinator configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Name used in the creator tag; shows up in logs and errors.
    pub name: String,
    /// Isolation level applied when the outermost `begin` requests none.
    /// `None` keeps whatever the connection has.
    pub default_isolation: Option<IsolationLevel>,
    /// Ask the external transaction bridge, if any, for a bound connection
    /// before acquiring one.
    pub use_external_transactions: bool,
    /// Log handles dropped without an explicit close at warn level
    /// instead of debug.
    pub warn_on_implicit_rollback: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "txshare".to_string(),
            default_isolation: None,
            use_external_transactions: true,
            warn_on_implicit_rollback: true,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new configuration with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Set default_isolation.
    pub fn default_isolation(mut self, level: Option<IsolationLevel>) -> Self {
        self.default_isolation = level;
        self
    }

    /// Set use_external_transactions flag.
    pub fn use_external_transactions(mut self, value: bool) -> Self {
        self.use_external_transactions = value;
        self
    }

    /// Set warn_on_implicit_rollback flag.
    pub fn warn_on_implicit_rollback(mut self, value: bool) -> Self {
        self.warn_on_implicit_rollback = value;
        self
    }
}

/// Settings requested by one `begin`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOptions {
    /// `None` keeps the level in effect (the enclosing level's, or the
    /// connection's for an outermost begin).
    pub isolation: Option<IsolationLevel>,
    /// Reserve the shared connection for writes; reads issued through
    /// [`Access::Read`] run on a separate auto-commit connection.
    pub for_update_only: bool,
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn for_update_only(mut self, value: bool) -> Self {
        self.for_update_only = value;
        self
    }
}

/// What a caller intends to do with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json_defaults_missing_fields() {
        let config = CoordinatorConfig::from_json_str(r#"{"name": "billing"}"#).unwrap();
        assert_eq!(config.name, "billing");
        assert_eq!(config.default_isolation, None);
        assert!(config.use_external_transactions);
    }

    #[test]
    fn test_config_from_json_full() {
        let json = r#"{
            "name": "billing",
            "default_isolation": "serializable",
            "use_external_transactions": false,
            "warn_on_implicit_rollback": false
        }"#;
        let config = CoordinatorConfig::from_json_str(json).unwrap();
        assert_eq!(
            config,
            CoordinatorConfig::new("billing")
                .default_isolation(Some(IsolationLevel::Serializable))
                .use_external_transactions(false)
                .warn_on_implicit_rollback(false)
        );
    }

    #[test]
    fn test_options_builder() {
        let opts = TxOptions::new()
            .isolation(IsolationLevel::RepeatableRead)
            .for_update_only(true);
        assert_eq!(opts.isolation, Some(IsolationLevel::RepeatableRead));
        assert!(opts.for_update_only);
        assert_eq!(TxOptions::default().isolation, None);
    }
}
