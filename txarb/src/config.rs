//! Configuration knobs for mailboxes and the scheduler.
//!
//! These structs are the whole configuration surface of the crate. They carry
//! no loading logic of their own; an outer layer (file, CLI, sysctl shim) is
//! expected to deserialize them and hand them over.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::topology::CpuConfig;

/// Default slot count for every mailbox kind.
pub const DEFAULT_MAILBOX_ENTRIES: usize = 512;

/// Default logical cache-line size in bytes.
pub const DEFAULT_LINE_SIZE: usize = 128;

/// Size of one mailbox slot in bytes.
pub const ENTRY_SIZE: usize = std::mem::size_of::<usize>();

/// Configuration rejected at construction time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A knob has a value the scheduler cannot work with.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Name of the offending knob.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl ConfigError {
    pub(crate) const fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::Invalid { field, reason }
    }
}

/// Geometry of a single mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Number of slots. Must be a power of two.
    pub entries: usize,
    /// Logical cache-line size in bytes. Must be a power of two.
    pub line_size: usize,
}

impl MailboxConfig {
    /// Creates a geometry without validating it.
    #[must_use]
    pub const fn new(entries: usize, line_size: usize) -> Self {
        Self { entries, line_size }
    }

    /// Number of slots sharing one logical cache line.
    #[must_use]
    pub const fn entries_per_line(&self) -> usize {
        self.line_size / ENTRY_SIZE
    }

    /// Checks the geometry invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] unless both values are powers of two,
    /// a line holds at least one slot, and the mailbox spans more than two lines.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.entries.is_power_of_two() {
            return Err(ConfigError::invalid("mailbox entries", "must be a power of two"));
        }
        if !self.line_size.is_power_of_two() {
            return Err(ConfigError::invalid("mailbox line size", "must be a power of two"));
        }
        if self.line_size < ENTRY_SIZE {
            return Err(ConfigError::invalid("mailbox line size", "smaller than one entry"));
        }
        match self.entries.checked_mul(ENTRY_SIZE) {
            Some(bytes) if bytes > 2 * self.line_size => Ok(()),
            _ => Err(ConfigError::invalid(
                "mailbox entries",
                "must span more than two cache lines",
            )),
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_ENTRIES, DEFAULT_LINE_SIZE)
    }
}

/// Who performs the actual transmit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmitMode {
    /// The arbiter rate-limits and transmits itself.
    ImmediateSend,
    /// The arbiter forwards into a mailbox drained by a dispatcher thread.
    #[default]
    BatchDispatch,
}

/// Configuration of one arbiter instance and everything it owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of per-CPU queues.
    pub queues: usize,
    /// Geometry of the mailbox each client creates.
    pub client_mailbox: MailboxConfig,
    /// Geometry of each per-CPU queue.
    pub queue_mailbox: MailboxConfig,
    /// Geometry of the forward buffer between arbiter and transmit.
    pub dispatch_mailbox: MailboxConfig,
    /// Transmit mode.
    pub mode: TransmitMode,
    /// Link rate in bytes per second; zero disables the limiter.
    pub rate: u64,
    /// Maximum packets the arbiter transmits per round (immediate mode).
    pub arbiter_batch: usize,
    /// Maximum packets the dispatcher transmits per run.
    pub dispatcher_batch: usize,
    /// Backoff between idle rounds.
    pub round_interval: Duration,
    /// Rounds per rolling statistics window.
    pub stats_window: u64,
    /// Worker thread placement.
    pub cpu: CpuConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queues: num_cpus::get().max(1),
            client_mailbox: MailboxConfig::default(),
            queue_mailbox: MailboxConfig::default(),
            dispatch_mailbox: MailboxConfig::default(),
            mode: TransmitMode::default(),
            rate: 0,
            arbiter_batch: 64,
            dispatcher_batch: 256,
            round_interval: Duration::from_micros(1),
            stats_window: 1000,
            cpu: CpuConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Checks every knob and every mailbox geometry.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues == 0 {
            return Err(ConfigError::invalid("queues", "at least one queue is required"));
        }
        if self.arbiter_batch == 0 {
            return Err(ConfigError::invalid("arbiter batch", "must be non-zero"));
        }
        if self.dispatcher_batch == 0 {
            return Err(ConfigError::invalid("dispatcher batch", "must be non-zero"));
        }
        if self.stats_window == 0 {
            return Err(ConfigError::invalid("stats window", "must be non-zero"));
        }
        self.client_mailbox.validate()?;
        self.queue_mailbox.validate()?;
        self.dispatch_mailbox.validate()
    }

    /// Picoseconds a single byte occupies the link, or zero when unlimited.
    #[must_use]
    pub fn picos_per_byte(&self) -> u64 {
        if self.rate == 0 {
            0
        } else {
            1_000_000_000_000 / self.rate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_is_valid() {
        assert!(MailboxConfig::default().validate().is_ok());
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two() {
        let err = MailboxConfig::new(100, 64).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "mailbox entries", .. }));

        let err = MailboxConfig::new(128, 48).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "mailbox line size", .. }));
    }

    #[test]
    fn rejects_two_lines_or_less() {
        // 16 entries * 8 bytes == 2 * 64 bytes
        assert!(MailboxConfig::new(16, 64).validate().is_err());
        assert!(MailboxConfig::new(8, 64).validate().is_err());
        assert!(MailboxConfig::new(32, 64).validate().is_ok());
    }

    #[test]
    fn rejects_line_smaller_than_entry() {
        assert!(MailboxConfig::new(64, 4).validate().is_err());
    }

    #[test]
    fn entries_per_line() {
        assert_eq!(MailboxConfig::new(64, 64).entries_per_line(), 64 / ENTRY_SIZE);
    }

    #[test]
    fn scheduler_rejects_zero_knobs() {
        let config = SchedulerConfig {
            queues: 0,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SchedulerConfig {
            arbiter_batch: 0,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SchedulerConfig {
            dispatch_mailbox: MailboxConfig::new(3, 64),
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn picos_per_byte_from_rate() {
        let mut config = SchedulerConfig::default();
        assert_eq!(config.picos_per_byte(), 0);
        config.rate = 1_000_000;
        assert_eq!(config.picos_per_byte(), 1_000_000);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: SchedulerConfig = serde_json::from_str(
            r#"{
                "queues": 4,
                "mode": "immediate_send",
                "rate": 125000000,
                "dispatch_mailbox": { "entries": 1024, "line_size": 64 },
                "cpu": { "manual": { "arbiter_core": 3, "dispatcher_core": null } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.queues, 4);
        assert_eq!(config.mode, TransmitMode::ImmediateSend);
        assert_eq!(config.dispatch_mailbox, MailboxConfig::new(1024, 64));
        assert_eq!(config.client_mailbox, MailboxConfig::default());
        assert_eq!(config.arbiter_batch, SchedulerConfig::default().arbiter_batch);
        assert_eq!(
            config.cpu,
            CpuConfig::Manual {
                arbiter_core: Some(3),
                dispatcher_core: None
            }
        );
        assert!(config.validate().is_ok());
    }
}
