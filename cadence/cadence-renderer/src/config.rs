//! Frame core configuration: ring depth, context ceiling, timeouts, presentation preferences.

use std::time::Duration;

use cadence_rhi::{PresentMode, TextureFormat};

use crate::error::ConfigError;

/// Upper bound on frames in flight.
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

/// Frame orchestrator configuration.
#[derive(Clone, Debug)]
pub struct FrameConfig {
    /// Ring size: how many frames the CPU may run ahead of the GPU.
    pub frames_in_flight: usize,
    /// Maximum slot fence wait before the frame is declared fatal.
    pub fence_timeout: Duration,
    /// Ceiling on live command contexts in the orchestrator's pool.
    pub max_contexts: usize,
    /// Ready contexts kept by `trim`.
    pub trim_retain: usize,
    /// Run `trim` every this many frames. 0 disables it.
    pub trim_interval: u64,
    /// Chain image format.
    pub surface_format: TextureFormat,
    /// Present modes in order of preference; the first one the surface supports wins.
    pub present_mode_preference: Vec<PresentMode>,
    /// Requested chain image count.
    pub min_image_count: u32,
    /// Compare live bound state against the applied state after every batch.
    pub validate_live_state: bool,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            fence_timeout: Duration::from_secs(5),
            max_contexts: 8,
            trim_retain: 2,
            trim_interval: 120,
            surface_format: TextureFormat::Bgra8UnormSrgb,
            present_mode_preference: vec![PresentMode::Mailbox, PresentMode::Immediate, PresentMode::Fifo],
            min_image_count: 3,
            validate_live_state: cfg!(debug_assertions),
        }
    }
}

impl FrameConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(ConfigError::FramesInFlight {
                got: self.frames_in_flight,
                max: MAX_FRAMES_IN_FLIGHT,
            });
        }
        if self.max_contexts < self.frames_in_flight {
            return Err(ConfigError::ContextCeiling {
                max_contexts: self.max_contexts,
                frames_in_flight: self.frames_in_flight,
            });
        }
        if self.fence_timeout.is_zero() {
            return Err(ConfigError::FenceTimeout);
        }
        Ok(())
    }

    /// Defaults overridden by `CADENCE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup, then validate.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = lookup("CADENCE_FRAMES_IN_FLIGHT") {
            self.frames_in_flight = parse("CADENCE_FRAMES_IN_FLIGHT", &v)?;
        }
        if let Some(v) = lookup("CADENCE_MAX_CONTEXTS") {
            self.max_contexts = parse("CADENCE_MAX_CONTEXTS", &v)?;
        }
        if let Some(v) = lookup("CADENCE_FENCE_TIMEOUT_MS") {
            self.fence_timeout = Duration::from_millis(parse("CADENCE_FENCE_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("CADENCE_VALIDATION") {
            self.validate_live_state = match v.trim() {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                _ => {
                    return Err(ConfigError::Env {
                        key: "CADENCE_VALIDATION",
                        value: v,
                    })
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    pub(crate) fn fence_timeout_ns(&self) -> u64 {
        u64::try_from(self.fence_timeout.as_nanos()).unwrap_or(u64::MAX)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> = pairs.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_is_valid() {
        assert!(FrameConfig::default().validate().is_ok());
    }

    #[test]
    fn ring_size_bounds() {
        for bad in [0, MAX_FRAMES_IN_FLIGHT + 1] {
            let config = FrameConfig {
                frames_in_flight: bad,
                ..FrameConfig::default()
            };
            assert!(matches!(config.validate(), Err(ConfigError::FramesInFlight { .. })));
        }
    }

    #[test]
    fn ceiling_must_cover_ring() {
        let config = FrameConfig {
            frames_in_flight: 3,
            max_contexts: 2,
            ..FrameConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ContextCeiling { .. })));
    }

    #[test]
    fn env_overrides_apply() {
        let config = FrameConfig::default()
            .with_overrides(lookup(&[
                ("CADENCE_FRAMES_IN_FLIGHT", "3"),
                ("CADENCE_FENCE_TIMEOUT_MS", "250"),
                ("CADENCE_VALIDATION", "1"),
            ]))
            .unwrap();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.fence_timeout, Duration::from_millis(250));
        assert!(config.validate_live_state);
    }

    #[test]
    fn env_garbage_is_rejected() {
        let err = FrameConfig::default()
            .with_overrides(lookup(&[("CADENCE_MAX_CONTEXTS", "lots")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Env {
                key: "CADENCE_MAX_CONTEXTS",
                value: "lots".to_string()
            }
        );
    }
}
