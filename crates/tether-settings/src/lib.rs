//! # tether-settings
//!
//! Layered configuration for the tether engine.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`TetherSettings::default()`]
//! 2. **Settings file**: `~/.tether/settings.json` or an explicit path, deep-merged over defaults
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)
//!
//! The merged result is validated before it is returned.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_env_overrides_from, deep_merge, load_settings,
    load_settings_from_path, load_with_env, settings_path,
};
pub use types::{
    ClientSettings, ConnectionSettings, LoggingSettings, ReactorSettings, ServerSettings,
    TetherSettings, UnknownTypePolicy,
};

use std::sync::OnceLock;

static SETTINGS: OnceLock<TetherSettings> = OnceLock::new();

/// Process-wide settings, loaded on first access.
///
/// Falls back to compiled defaults if loading fails.
pub fn get_settings() -> &'static TetherSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Install the process-wide settings.
///
/// Returns the value back if settings were already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: TetherSettings) -> std::result::Result<(), TetherSettings> {
    SETTINGS.set(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = TetherSettings::default();
        assert!(settings_path().ends_with(".tether/settings.json"));
    }

    #[test]
    fn global_settings_initialize_once() {
        let custom = TetherSettings {
            logging: LoggingSettings {
                level: "trace".into(),
                json: false,
            },
            ..TetherSettings::default()
        };
        let first = init_settings(custom.clone());
        // Either this test set it, or another path already did; both leave a value.
        let current = get_settings();
        if first.is_ok() {
            assert_eq!(current.logging.level, "trace");
        }
        assert!(init_settings(custom).is_err());
    }
}
