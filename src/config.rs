//! Backend configuration
//!
//! [`DrmBackendConfig::default`] gives the built-in defaults, [`DrmBackendConfig::from_env`]
//! applies overrides from the environment:
//!
//! - `ATOMIC_KMS_FORCE_SW_CURSOR`: never use cursor planes
//! - `ATOMIC_KMS_DPMS_DELAY_MS`: delay between a power-off request and the actual power-off
//! - `ATOMIC_KMS_DISABLE_CONNECTORS`: disable everything the previous drm master left on
//! - `ATOMIC_KMS_SWAPCHAIN_SLOTS`: number of primary buffers per output (2 or 3)
//!
//! Boolean variables accept `1`, `true`, `yes` and `y`, in any case.

use std::time::Duration;

use tracing::{info, warn};

/// Default delay before an output is powered off
pub const DEFAULT_DPMS_DELAY: Duration = Duration::from_millis(250);

/// Configuration of a [`DrmBackend`](crate::backend::drm::DrmBackend)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmBackendConfig {
    /// Disable all connectors, crtcs and planes when a gpu is added
    pub disable_connectors_on_init: bool,
    /// Delay between a soft power-off request and the actual power-off
    pub dpms_turn_off_delay: Duration,
    /// Never use cursor planes
    pub software_cursor_only: bool,
    /// Number of primary buffers per output
    pub swapchain_slots: usize,
}

impl Default for DrmBackendConfig {
    fn default() -> Self {
        DrmBackendConfig {
            disable_connectors_on_init: false,
            dpms_turn_off_delay: DEFAULT_DPMS_DELAY,
            software_cursor_only: false,
            swapchain_slots: 3,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    let value = value.to_lowercase();
    value == "1" || value == "true" || value == "yes" || value == "y"
}

impl DrmBackendConfig {
    /// Defaults with overrides from the process environment
    pub fn from_env() -> DrmBackendConfig {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DrmBackendConfig {
        let mut config = DrmBackendConfig::default();

        if let Some(value) = lookup("ATOMIC_KMS_FORCE_SW_CURSOR") {
            config.software_cursor_only = parse_bool(&value);
            if config.software_cursor_only {
                info!("ATOMIC_KMS_FORCE_SW_CURSOR is set. Forcing software cursors.");
            }
        }

        if let Some(value) = lookup("ATOMIC_KMS_DISABLE_CONNECTORS") {
            config.disable_connectors_on_init = parse_bool(&value);
        }

        if let Some(value) = lookup("ATOMIC_KMS_DPMS_DELAY_MS") {
            match value.trim().parse::<u64>() {
                Ok(ms) => config.dpms_turn_off_delay = Duration::from_millis(ms),
                Err(_) => warn!("ATOMIC_KMS_DPMS_DELAY_MS was set to an invalid value: {}", value),
            }
        }

        if let Some(value) = lookup("ATOMIC_KMS_SWAPCHAIN_SLOTS") {
            match value.trim().parse::<usize>() {
                Ok(slots @ 2..=3) => config.swapchain_slots = slots,
                _ => warn!("Ignoring ATOMIC_KMS_SWAPCHAIN_SLOTS, expected 2 or 3, got {}", value),
            }
        }

        config
    }
}

#[cfg(test)]
mod test {
    use super::{DrmBackendConfig, DEFAULT_DPMS_DELAY};
    use std::{collections::HashMap, time::Duration};

    fn lookup(vars: &[(&str, &str)]) -> DrmBackendConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DrmBackendConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = lookup(&[]);
        assert_eq!(config, DrmBackendConfig::default());
        assert_eq!(config.dpms_turn_off_delay, DEFAULT_DPMS_DELAY);
        assert_eq!(config.swapchain_slots, 3);
    }

    #[test]
    fn boolean_values() {
        for value in ["1", "true", "TRUE", "Yes", "y"] {
            assert!(lookup(&[("ATOMIC_KMS_FORCE_SW_CURSOR", value)]).software_cursor_only);
        }
        for value in ["0", "false", "no", ""] {
            assert!(!lookup(&[("ATOMIC_KMS_DISABLE_CONNECTORS", value)]).disable_connectors_on_init);
        }
    }

    #[test]
    fn numeric_values() {
        let config = lookup(&[("ATOMIC_KMS_DPMS_DELAY_MS", "0"), ("ATOMIC_KMS_SWAPCHAIN_SLOTS", "2")]);
        assert_eq!(config.dpms_turn_off_delay, Duration::ZERO);
        assert_eq!(config.swapchain_slots, 2);

        let config = lookup(&[("ATOMIC_KMS_DPMS_DELAY_MS", "soon"), ("ATOMIC_KMS_SWAPCHAIN_SLOTS", "8")]);
        assert_eq!(config.dpms_turn_off_delay, DEFAULT_DPMS_DELAY);
        assert_eq!(config.swapchain_slots, 3);
    }
}
