use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

/// Every tunable of the edge device in one place. Components receive the
/// narrow views below instead of the whole struct.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    // General
    pub device_id: String,
    pub site_utc_offset_minutes: i32, // Schedules are evaluated in site-local wall time

    // Recognition session
    #[serde(with = "humantime_serde")]
    pub session_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub adapter_call_timeout: Duration,
    pub max_capture_attempts: usize, // Transient failures retried in place up to this many captures
    pub camera_fault_limit: usize,   // Consecutive camera faults before the reset signal fires
    #[serde(with = "humantime_serde")]
    pub capture_retry_backoff: Duration,

    // Liveness / match
    pub min_face_diagonal_px: f64,
    pub severe_shortfall_ratio: f64, // Diagonal below this fraction of the minimum => much_too_far
    pub liveness_threshold: f64,
    pub match_threshold: f64,
    pub separation_margin: f64,

    // Second factor
    #[serde(with = "humantime_serde")]
    pub otp_ttl: Duration,
    pub otp_max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub otp_provider_timeout: Duration,

    // Door commands
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub actuator_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub relock_after: Duration,

    // Access tokens handed out on approval
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,

    // Pub/sub emulation (simulator and tests only)
    pub bus_min_delay_ms: u64,
    pub bus_max_delay_ms: u64,
    pub bus_drop_rate: f64,
    pub bus_tick_interval_ms: Option<u64>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        AccessConfig {
            device_id: "front-door".to_string(),
            site_utc_offset_minutes: 0,

            session_deadline: Duration::from_secs(60),
            adapter_call_timeout: Duration::from_secs(5),
            max_capture_attempts: 5,
            camera_fault_limit: 3,
            capture_retry_backoff: Duration::from_millis(200),

            min_face_diagonal_px: 141.0, // ~100x100 px face
            severe_shortfall_ratio: 0.75,
            liveness_threshold: 0.5,
            match_threshold: 0.6,
            separation_margin: 0.05,

            otp_ttl: Duration::from_secs(5 * 60),
            otp_max_attempts: 5,
            otp_provider_timeout: Duration::from_secs(10),

            ack_timeout: Duration::from_secs(3),
            actuator_timeout: Duration::from_secs(2),
            relock_after: Duration::from_secs(10),

            token_ttl: Duration::from_secs(3600),

            bus_min_delay_ms: 5,
            bus_max_delay_ms: 20,
            bus_drop_rate: 0.0,
            bus_tick_interval_ms: Some(5),
        }
    }
}

/// Knobs the recognition session worker needs.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub deadline: Duration,
    pub adapter_call_timeout: Duration,
    pub max_capture_attempts: usize,
    pub camera_fault_limit: usize,
    pub retry_backoff: Duration,
}

/// Gates applied by the liveness/match adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct AdapterThresholds {
    pub min_face_diagonal_px: f64,
    pub severe_shortfall_ratio: f64,
    pub liveness_threshold: f64,
    pub match_threshold: f64,
    pub separation_margin: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OtpConfig {
    pub ttl: Duration,
    pub max_attempts: u32,
    pub provider_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DispatchConfig {
    pub device_id: String,
    pub ack_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EndpointConfig {
    pub device_id: String,
    pub actuator_timeout: Duration,
    pub relock_after: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BusConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub drop_rate: f64,
    pub tick_interval_ms: Option<u64>,
}

impl AccessConfig {
    /// Loads a JSON config file. Missing fields fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: AccessConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.is_empty() || self.device_id.contains(['/', '+', '#']) {
            return Err(invalid("device_id", "must be non-empty and contain no topic separators"));
        }
        if self.session_deadline.is_zero() {
            return Err(invalid("session_deadline", "must be positive"));
        }
        if self.adapter_call_timeout.is_zero() || self.adapter_call_timeout >= self.session_deadline {
            return Err(invalid("adapter_call_timeout", "must be positive and shorter than the session deadline"));
        }
        if self.max_capture_attempts == 0 {
            return Err(invalid("max_capture_attempts", "must be at least 1"));
        }
        if self.camera_fault_limit == 0 {
            return Err(invalid("camera_fault_limit", "must be at least 1"));
        }
        if self.min_face_diagonal_px <= 0.0 {
            return Err(invalid("min_face_diagonal_px", "must be positive"));
        }
        if !(0.0 < self.severe_shortfall_ratio && self.severe_shortfall_ratio < 1.0) {
            return Err(invalid("severe_shortfall_ratio", "must lie strictly between 0 and 1"));
        }
        if !(0.0..=1.0).contains(&self.liveness_threshold) {
            return Err(invalid("liveness_threshold", "must lie within [0, 1]"));
        }
        if self.match_threshold <= 0.0 || self.separation_margin < 0.0 {
            return Err(invalid("match_threshold", "threshold must be positive and margin non-negative"));
        }
        if self.otp_ttl.is_zero() || self.otp_max_attempts == 0 {
            return Err(invalid("otp_ttl", "ttl and attempt budget must be positive"));
        }
        if self.otp_provider_timeout.is_zero() || self.ack_timeout.is_zero() || self.actuator_timeout.is_zero() {
            return Err(invalid("ack_timeout", "external call timeouts must be positive"));
        }
        if self.bus_min_delay_ms > self.bus_max_delay_ms {
            return Err(invalid("bus_min_delay_ms", "must not exceed bus_max_delay_ms"));
        }
        if !(0.0..=1.0).contains(&self.bus_drop_rate) {
            return Err(invalid("bus_drop_rate", "must lie within [0, 1]"));
        }
        Ok(())
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            deadline: self.session_deadline,
            adapter_call_timeout: self.adapter_call_timeout,
            max_capture_attempts: self.max_capture_attempts,
            camera_fault_limit: self.camera_fault_limit,
            retry_backoff: self.capture_retry_backoff,
        }
    }

    pub fn thresholds(&self) -> AdapterThresholds {
        AdapterThresholds {
            min_face_diagonal_px: self.min_face_diagonal_px,
            severe_shortfall_ratio: self.severe_shortfall_ratio,
            liveness_threshold: self.liveness_threshold,
            match_threshold: self.match_threshold,
            separation_margin: self.separation_margin,
        }
    }

    pub fn otp(&self) -> OtpConfig {
        OtpConfig {
            ttl: self.otp_ttl,
            max_attempts: self.otp_max_attempts,
            provider_timeout: self.otp_provider_timeout,
        }
    }

    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig { device_id: self.device_id.clone(), ack_timeout: self.ack_timeout }
    }

    pub fn endpoint(&self) -> EndpointConfig {
        EndpointConfig {
            device_id: self.device_id.clone(),
            actuator_timeout: self.actuator_timeout,
            relock_after: self.relock_after,
        }
    }

    pub fn bus(&self) -> BusConfig {
        BusConfig {
            min_delay_ms: self.bus_min_delay_ms,
            max_delay_ms: self.bus_max_delay_ms,
            drop_rate: self.bus_drop_rate,
            tick_interval_ms: self.bus_tick_interval_ms,
        }
    }

    pub fn site_offset(&self) -> chrono::FixedOffset {
        // Out-of-range offsets fall back to UTC rather than failing a decision
        use chrono::Offset;
        chrono::FixedOffset::east_opt(self.site_utc_offset_minutes * 60)
            .unwrap_or_else(|| chrono::Utc.fix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AccessConfig::default();
        assert_eq!(config.session_deadline, Duration::from_secs(60));
        assert_eq!(config.adapter_call_timeout, Duration::from_secs(5));
        assert_eq!(config.camera_fault_limit, 3);
        assert_eq!(config.otp_ttl, Duration::from_secs(300));
        assert_eq!(config.otp_max_attempts, 5);
        assert_eq!(config.match_threshold, 0.6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults_and_parses_humantime() {
        let config = AccessConfig::from_json_str(
            r#"{ "device_id": "lab-door", "ack_timeout": "750ms", "otp_ttl": "2m" }"#,
        )
        .unwrap();
        assert_eq!(config.device_id, "lab-door");
        assert_eq!(config.ack_timeout, Duration::from_millis(750));
        assert_eq!(config.otp_ttl, Duration::from_secs(120));
        assert_eq!(config.session_deadline, Duration::from_secs(60));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = AccessConfig::from_json_str(r#"{ "device_id": "door/1" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "device_id", .. }));

        let err = AccessConfig::from_json_str(r#"{ "severe_shortfall_ratio": 1.5 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "severe_shortfall_ratio", .. }));

        let err = AccessConfig::from_json_str(r#"{ "adapter_call_timeout": "2m" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "adapter_call_timeout", .. }));

        assert!(matches!(AccessConfig::from_json_str("{ nope"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "site_utc_offset_minutes": 120, "bus_drop_rate": 0.25 }}"#).unwrap();
        let config = AccessConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.site_offset().local_minus_utc(), 7200);
        assert_eq!(config.bus().drop_rate, 0.25);
    }

    #[test]
    fn derived_views_mirror_fields() {
        let config = AccessConfig::default();
        assert_eq!(config.session().deadline, config.session_deadline);
        assert_eq!(config.thresholds().liveness_threshold, config.liveness_threshold);
        assert_eq!(config.dispatch().device_id, "front-door");
        assert_eq!(config.endpoint().relock_after, Duration::from_secs(10));
    }
}
