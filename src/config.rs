//! Compiler configuration
//!
//! All process-wide tunables live in a single immutable [`CompilerConfig`]
//! constructed at startup and passed by reference into the tier selector and
//! the orchestrator. There is no mutable global state; tests construct their
//! own configs.

use serde::{Deserialize, Serialize};

/// Immutable configuration for the compilation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerConfig {
    /// Whether the optimizing tier is enabled at all
    pub opt_enabled: bool,

    /// Optional regex applied to function names; functions that do not
    /// match are never optimized. `None` means all names pass.
    pub opt_filter: Option<String>,

    /// Optimize every function immediately after its baseline compile
    /// (testing aid)
    pub always_opt: bool,

    /// Stress-testing flag: use the legacy baseline backend for every
    /// function it can represent
    pub stress_legacy_baseline: bool,

    /// Whether numeric-subset module validation is enabled
    pub validate_numeric_modules: bool,

    /// Stress-testing flag: run the numeric-module validator on every
    /// function, not just declared numeric modules
    pub stress_validate_numeric: bool,

    /// Maximum number of optimizing jobs admitted to the background queue
    pub concurrent_queue_capacity: usize,

    /// Heap budget in bytes used by the memory-pressure admission check
    pub memory_budget: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            opt_enabled: true,
            opt_filter: None,
            always_opt: false,
            stress_legacy_baseline: false,
            validate_numeric_modules: true,
            stress_validate_numeric: false,
            concurrent_queue_capacity: 8,
            memory_budget: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl CompilerConfig {
    /// Parse a configuration from a JSON string. Unknown fields are
    /// rejected so typos in config files fail loudly.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| crate::Error::InternalError(format!("invalid config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CompilerConfig::default();
        assert!(config.opt_enabled);
        assert!(config.opt_filter.is_none());
        assert!(!config.always_opt);
        assert!(config.concurrent_queue_capacity > 0);
    }

    #[test]
    fn test_config_from_json_partial() {
        let config = CompilerConfig::from_json(r#"{"opt_enabled": false, "always_opt": true}"#)
            .unwrap();
        assert!(!config.opt_enabled);
        assert!(config.always_opt);
        // Unspecified fields fall back to defaults
        assert!(config.validate_numeric_modules);
    }

    #[test]
    fn test_config_from_json_invalid() {
        assert!(CompilerConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_config_rejects_unknown_fields() {
        assert!(CompilerConfig::from_json(r#"{"opt_enabld": true}"#).is_err());
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = CompilerConfig::default();
        config.opt_filter = Some("^hot_".to_string());
        config.concurrent_queue_capacity = 2;
        let json = serde_json::to_string(&config).unwrap();
        let back = CompilerConfig::from_json(&json).unwrap();
        assert_eq!(back.opt_filter.as_deref(), Some("^hot_"));
        assert_eq!(back.concurrent_queue_capacity, 2);
    }
}
