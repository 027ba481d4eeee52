//! Run configuration

use crate::error::{ProbeError, Result};
use crate::sampler::CACHE_LINE_SIZE;
use crate::transport::TransportConfig;
use std::time::Duration;

/// Default TCP port of the rendezvous channel
pub const DEFAULT_TCP_PORT: u16 = 19875;

/// How the prober picks its targets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProbeMode {
    /// Every cell of the server buffer, columns outer and rows inner
    #[default]
    Sequential,
    /// Random cache lines without replacement
    Random,
    /// The first line only, flushed by the server between probes
    FixedFlush,
}

/// Which side of the connection this process plays
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Listens, exposes the large buffer and stays passive
    Server,
    /// Connects and runs the probes
    Client,
}

/// Configuration of one side of a run
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    /// Host to connect to; listen when unset
    pub server_name: Option<String>,
    pub tcp_port: u16,
    pub transport: TransportConfig,
    /// Probes in random and fixed-flush modes
    pub iterations: u64,
    pub mode: ProbeMode,
    /// Bytes moved per operation, and the cell size of the server buffer
    pub msg_size: usize,
    pub column_count: usize,
    pub row_count: usize,
    /// Seed of the random sampler; entropy when unset
    pub seed: Option<u64>,
    /// Pin the prober to the CPU it starts on
    pub pin_cpu: bool,
    /// Skip calibration and use this counter frequency
    pub cycles_per_usec: Option<f64>,
    /// Deadline of every bounded completion poll
    pub poll_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            server_name: None,
            tcp_port: DEFAULT_TCP_PORT,
            transport: TransportConfig::default(),
            iterations: 1000,
            mode: ProbeMode::Sequential,
            msg_size: 8,
            column_count: 1024,
            row_count: 8192,
            seed: None,
            pin_cpu: true,
            cycles_per_usec: None,
            poll_timeout: Duration::from_millis(2000),
        }
    }
}

impl ProbeConfig {
    pub fn role(&self) -> Role {
        match self.server_name {
            Some(_) => Role::Client,
            None => Role::Server,
        }
    }

    /// Size of the server buffer in bytes
    pub fn address_space_bytes(&self) -> Option<usize> {
        self.row_count
            .checked_mul(self.column_count)?
            .checked_mul(self.msg_size)
    }

    /// Size of this side's buffer in bytes
    pub fn buffer_size(&self) -> usize {
        match self.role() {
            Role::Server => self.address_space_bytes().unwrap_or(0),
            Role::Client => self.msg_size,
        }
    }

    /// Reject settings the probe loop cannot honour.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ProbeError::InvalidConfig(msg));

        if self.msg_size == 0 {
            return invalid("msg-size must be non-zero".to_string());
        }
        if u32::try_from(self.msg_size).is_err() {
            return invalid(format!("msg-size {} does not fit a work request", self.msg_size));
        }
        if self.row_count == 0 || self.column_count == 0 {
            return invalid("row-count and column-count must be non-zero".to_string());
        }
        let Some(total) = self.address_space_bytes() else {
            return invalid("row-count * column-count * msg-size overflows".to_string());
        };
        if self.mode == ProbeMode::Random {
            // a probe starting at a line boundary must stay inside the buffer
            if self.msg_size > CACHE_LINE_SIZE {
                return invalid(format!(
                    "random mode needs msg-size <= {} (got {})",
                    CACHE_LINE_SIZE, self.msg_size
                ));
            }
            if total < CACHE_LINE_SIZE {
                return invalid(format!(
                    "random mode needs a buffer of at least one {}-byte line (got {} bytes)",
                    CACHE_LINE_SIZE, total
                ));
            }
        }
        if let Some(freq) = self.cycles_per_usec {
            if !(freq.is_finite() && freq > 0.0) {
                return invalid(format!("cycles per usec must be positive (got {})", freq));
            }
        }
        if self.poll_timeout.is_zero() {
            return invalid("poll timeout must be non-zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProbeConfig::default();
        assert_eq!(config.tcp_port, 19875);
        assert_eq!(config.transport.ib_port, 1);
        assert_eq!(config.transport.gid_index, None);
        assert_eq!(config.role(), Role::Server);
        assert_eq!(config.buffer_size(), 8192 * 1024 * 8);
        assert_eq!(config.poll_timeout, Duration::from_millis(2000));
        config.validate().unwrap();
    }

    #[test]
    fn test_client_buffer() {
        let config = ProbeConfig {
            server_name: Some("10.0.0.1".to_string()),
            msg_size: 16,
            ..Default::default()
        };
        assert_eq!(config.role(), Role::Client);
        assert_eq!(config.buffer_size(), 16);
    }

    #[test]
    fn test_random_mode_limits() {
        let config = ProbeConfig {
            mode: ProbeMode::Random,
            msg_size: 128,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ProbeError::InvalidConfig(_))));

        let config = ProbeConfig {
            mode: ProbeMode::Random,
            row_count: 1,
            column_count: 4,
            msg_size: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_sizes() {
        for config in [
            ProbeConfig {
                msg_size: 0,
                ..Default::default()
            },
            ProbeConfig {
                row_count: 0,
                ..Default::default()
            },
            ProbeConfig {
                cycles_per_usec: Some(0.0),
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_overflow_rejected() {
        let config = ProbeConfig {
            row_count: usize::MAX,
            column_count: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
