// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Command Line Parsing
//!
//! Boot arguments are whitespace-separated `key=value` pairs. This module
//! splits them into a [`Cmdline`] and builds the socket core's
//! [`StackConfig`] from the `pipe.*` and `net.*` keys.
//!
//! # Design
//!
//! - A key without `=` gets an empty value
//! - Later occurrences of a key override earlier ones
//! - Numbers are decimal or `0x`-prefixed hex
//! - Unknown keys are logged and skipped; a malformed value for a known key
//!   rejects the whole command line with `InvalidArgs`
//!
//! # Usage
//!
//! ```text
//! let config = StackConfig::from_cmdline("pipe.size=512 net.tcp.retries=3")?;
//! let stack = NetStack::new(config, output)?;
//! ```

use alloc::string::String;
use alloc::vec::Vec;

use crate::rustux::errors::{Error, Result};
use crate::rustux::types::{ms_to_ns, Nanoseconds, NS_PER_MS};

// Import logging macros
use crate::{log_debug, log_warn};

/// ============================================================================
/// Command Line
/// ============================================================================

/// Maximum command line size
const CMDLINE_MAX: usize = 4096;

/// Parsed `key=value` arguments, in command line order
#[derive(Debug, Default, Clone)]
pub struct Cmdline {
    entries: Vec<(String, String)>,
}

impl Cmdline {
    /// Parse a command line
    ///
    /// Input beyond [`CMDLINE_MAX`] bytes is ignored. Control characters
    /// other than whitespace are replaced with '.'.
    pub fn parse(data: &str) -> Self {
        let mut cmdline = Self::default();
        cmdline.append(data);
        cmdline
    }

    /// Append more arguments
    pub fn append(&mut self, data: &str) {
        let used: usize = self.entries.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
        let mut budget = CMDLINE_MAX.saturating_sub(used);

        for arg in data.split_ascii_whitespace() {
            if arg.len() + 2 > budget {
                log_warn!("cmdline: truncated at '{}'", arg);
                break;
            }
            budget -= arg.len() + 2;

            let clean: String = arg
                .chars()
                .map(|c| if c.is_control() { '.' } else { c })
                .collect();
            let (key, value) = match clean.split_once('=') {
                Some((key, value)) => (String::from(key), String::from(value)),
                None => (clean, String::new()),
            };
            self.entries.push((key, value));
        }
    }

    /// Get a value from the command line
    ///
    /// Returns the last value given for `key`, `Some("")` for a bare key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Get a boolean value from the command line
    ///
    /// Returns false if the value is "0", "false", or "off", true for any
    /// other value, and `default` if the key is missing.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(v) => !matches!(v, "0" | "false" | "off"),
        }
    }

    /// Get a u32 value, `default` if missing or invalid
    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key)
            .and_then(parse_uint)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(default)
    }

    /// Get a u64 value, `default` if missing or invalid
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(parse_uint).unwrap_or(default)
    }

    /// Iterate over the arguments
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Get the number of command line entries
    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

/// Parse a decimal or `0x` hex number
fn parse_uint(v: &str) -> Option<u64> {
    let (digits, radix) = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (v, 10),
    };
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

/// ============================================================================
/// Stack Configuration
/// ============================================================================

/// Tunables of the pipe and socket layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    /// Pipe/FIFO ring capacity in bytes (`pipe.size`)
    pub pipe_capacity: usize,
    /// Live pipes allowed (`pipe.max`)
    pub max_pipes: usize,
    /// Live sockets allowed across all families (`net.sockets.max`)
    pub max_sockets: usize,
    /// Unix-domain stream receive ring (`net.local.stream_buf`)
    pub local_stream_buf: usize,
    /// Unix-domain datagrams queued per socket (`net.local.dgram_queue`)
    pub local_dgram_queue: usize,
    /// Upper bound on any listen backlog (`net.listen.backlog`)
    pub listen_backlog: usize,
    /// Frames queued per packet socket (`net.packet.queue`)
    pub packet_queue: usize,
    /// Datagrams queued per UDP socket (`net.udp.queue`)
    pub udp_queue: usize,
    /// TCP send buffer (`net.tcp.sndbuf`)
    pub tcp_sndbuf: usize,
    /// TCP receive buffer, also the advertised window (`net.tcp.rcvbuf`)
    pub tcp_rcvbuf: usize,
    /// TCP maximum segment size (`net.tcp.mss`)
    pub tcp_mss: usize,
    /// First retransmission timeout (`net.tcp.rto_ms`)
    pub tcp_rto_initial: Nanoseconds,
    /// Backoff ceiling (`net.tcp.rto_max_ms`)
    pub tcp_rto_max: Nanoseconds,
    /// Retransmissions before a connection is reset (`net.tcp.retries`)
    pub tcp_max_retries: u32,
    /// Lowest ephemeral port (`net.ephemeral.first`)
    pub ephemeral_first: u16,
    /// Highest ephemeral port (`net.ephemeral.last`)
    pub ephemeral_last: u16,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: 4096,
            max_pipes: 256,
            max_sockets: 1024,
            local_stream_buf: 8192,
            local_dgram_queue: 16,
            listen_backlog: 128,
            packet_queue: 32,
            udp_queue: 64,
            tcp_sndbuf: 16384,
            tcp_rcvbuf: 16384,
            tcp_mss: 1460,
            tcp_rto_initial: ms_to_ns(200),
            tcp_rto_max: ms_to_ns(8000),
            tcp_max_retries: 5,
            ephemeral_first: 49152,
            ephemeral_last: 65535,
        }
    }
}

impl StackConfig {
    /// Build a configuration from boot arguments
    ///
    /// Keys that are not given keep their defaults.
    ///
    /// # Returns
    ///
    /// - `Err(Error::InvalidArgs)` if a known key has a malformed value, or
    ///   the resulting configuration is inconsistent
    pub fn from_cmdline(data: &str) -> Result<Self> {
        Self::from_args(&Cmdline::parse(data))
    }

    /// Build a configuration from already-parsed arguments
    pub fn from_args(cmdline: &Cmdline) -> Result<Self> {
        let mut config = Self::default();

        for (key, value) in cmdline.iter() {
            if !key.starts_with("pipe.") && !key.starts_with("net.") {
                continue;
            }
            config.apply(key, value)?;
        }

        config.validate()?;
        log_debug!("stack config: {:?}", config);
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result {
        let num = || {
            parse_uint(value).ok_or_else(|| {
                log_warn!("cmdline: bad value '{}' for {}", value, key);
                Error::InvalidArgs
            })
        };
        let size = || num().and_then(|v| usize::try_from(v).map_err(|_| Error::InvalidArgs));
        let port = || num().and_then(|v| u16::try_from(v).map_err(|_| Error::InvalidArgs));

        match key {
            "pipe.size" => self.pipe_capacity = size()?,
            "pipe.max" => self.max_pipes = size()?,
            "net.sockets.max" => self.max_sockets = size()?,
            "net.local.stream_buf" => self.local_stream_buf = size()?,
            "net.local.dgram_queue" => self.local_dgram_queue = size()?,
            "net.listen.backlog" => self.listen_backlog = size()?,
            "net.packet.queue" => self.packet_queue = size()?,
            "net.udp.queue" => self.udp_queue = size()?,
            "net.tcp.sndbuf" => self.tcp_sndbuf = size()?,
            "net.tcp.rcvbuf" => self.tcp_rcvbuf = size()?,
            "net.tcp.mss" => self.tcp_mss = size()?,
            "net.tcp.rto_ms" => self.tcp_rto_initial = ms_to_ns(num()?),
            "net.tcp.rto_max_ms" => self.tcp_rto_max = ms_to_ns(num()?),
            "net.tcp.retries" => {
                self.tcp_max_retries = u32::try_from(num()?).map_err(|_| Error::InvalidArgs)?
            }
            "net.ephemeral.first" => self.ephemeral_first = port()?,
            "net.ephemeral.last" => self.ephemeral_last = port()?,
            _ => log_warn!("cmdline: ignoring unknown key {}", key),
        }
        Ok(())
    }

    /// Reject zero sizes, inverted timeouts and an empty port range
    pub(crate) fn validate(&self) -> Result {
        let sizes = [
            self.pipe_capacity,
            self.max_pipes,
            self.max_sockets,
            self.local_stream_buf,
            self.local_dgram_queue,
            self.listen_backlog,
            self.packet_queue,
            self.udp_queue,
            self.tcp_sndbuf,
            self.tcp_rcvbuf,
            self.tcp_mss,
        ];
        if sizes.iter().any(|&s| s == 0) {
            log_warn!("stack config: zero-sized buffer or limit");
            return Err(Error::InvalidArgs);
        }
        if self.tcp_rto_initial < NS_PER_MS || self.tcp_rto_initial > self.tcp_rto_max {
            log_warn!("stack config: bad retransmission timeouts");
            return Err(Error::InvalidArgs);
        }
        if self.ephemeral_first == 0 || self.ephemeral_first > self.ephemeral_last {
            log_warn!("stack config: bad ephemeral port range");
            return Err(Error::InvalidArgs);
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_empty() {
        let cmdline = Cmdline::parse("");
        assert!(cmdline.get("test").is_none());
        assert_eq!(cmdline.count(), 0);
    }

    #[test]
    fn test_cmdline_spaces_and_bare_keys() {
        let cmdline = Cmdline::parse("  key1=value1\tkey2=value2   quiet ");
        assert_eq!(cmdline.get("key1"), Some("value1"));
        assert_eq!(cmdline.get("key2"), Some("value2"));
        assert_eq!(cmdline.get("quiet"), Some(""));
        assert_eq!(cmdline.count(), 3);
    }

    #[test]
    fn test_cmdline_last_wins() {
        let mut cmdline = Cmdline::parse("a=1");
        cmdline.append("a=2");
        assert_eq!(cmdline.get("a"), Some("2"));
    }

    #[test]
    fn test_cmdline_get_bool() {
        let cmdline = Cmdline::parse("flag1=true flag2=false flag3=1 flag4=off");

        assert!(cmdline.get_bool("flag1", false));
        assert!(!cmdline.get_bool("flag2", true));
        assert!(cmdline.get_bool("flag3", false));
        assert!(!cmdline.get_bool("flag4", true));

        // Test default for missing key
        assert!(cmdline.get_bool("missing", true));
    }

    #[test]
    fn test_cmdline_get_numbers() {
        let cmdline = Cmdline::parse("num1=123 num2=0x1ff num3=0XABC big=0x1ffffffff bad=12z");

        assert_eq!(cmdline.get_u32("num1", 0), 123);
        assert_eq!(cmdline.get_u32("num2", 0), 0x1ff);
        assert_eq!(cmdline.get_u32("num3", 0), 0xABC);
        assert_eq!(cmdline.get_u32("big", 7), 7);
        assert_eq!(cmdline.get_u64("big", 0), 0x1ffffffff);
        assert_eq!(cmdline.get_u32("bad", 42), 42);

        // Test default for missing key
        assert_eq!(cmdline.get_u32("missing", 42), 42);
    }

    #[test]
    fn test_stack_config_defaults() {
        let config = StackConfig::from_cmdline("").unwrap();
        assert_eq!(config, StackConfig::default());
        assert_eq!(config.pipe_capacity, 4096);
        assert_eq!(config.tcp_rto_initial, ms_to_ns(200));
        assert_eq!(config.ephemeral_first, 49152);
    }

    #[test]
    fn test_stack_config_overrides() {
        let config = StackConfig::from_cmdline(
            "console=ttyS0 pipe.size=512 net.tcp.retries=3 net.tcp.rto_ms=0x32 net.unknown=1",
        )
        .unwrap();
        assert_eq!(config.pipe_capacity, 512);
        assert_eq!(config.tcp_max_retries, 3);
        assert_eq!(config.tcp_rto_initial, ms_to_ns(50));
        assert_eq!(config.udp_queue, StackConfig::default().udp_queue);
    }

    #[test]
    fn test_stack_config_rejects_bad_values() {
        assert_eq!(StackConfig::from_cmdline("pipe.size=lots"), Err(Error::InvalidArgs));
        assert_eq!(StackConfig::from_cmdline("pipe.size=0"), Err(Error::InvalidArgs));
        assert_eq!(StackConfig::from_cmdline("net.ephemeral.first=70000"), Err(Error::InvalidArgs));
        assert_eq!(
            StackConfig::from_cmdline("net.ephemeral.first=60000 net.ephemeral.last=50000"),
            Err(Error::InvalidArgs)
        );
        assert_eq!(
            StackConfig::from_cmdline("net.tcp.rto_ms=9000 net.tcp.rto_max_ms=1000"),
            Err(Error::InvalidArgs)
        );
    }
}
