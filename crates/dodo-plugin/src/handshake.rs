//! Plugin handshake
//!
//! The host launches the plugin with two environment variables:
//!
//! ```text
//! DODO_STAGE_PLUGIN=<stage type>      magic cookie
//! DODO_PLUGIN_PROTOCOLS=mux,netrpc    protocols the host speaks, preferred first
//! ```
//!
//! and the plugin answers with a single stdout line
//! `<core version>|<app version>|stdio|<protocol>` before any RPC traffic.

use crate::error::{PluginError, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Cookie key of stage plugins; its value is the stage type
pub const COOKIE_KEY: &str = "DODO_STAGE_PLUGIN";
pub const PROTOCOLS_ENV: &str = "DODO_PLUGIN_PROTOCOLS";

pub const CORE_PROTOCOL_VERSION: u32 = 1;
pub const APP_PROTOCOL_VERSION: u32 = 1;

/// Only transport: the plugin's standard streams
pub const NETWORK: &str = "stdio";

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// RPC framing spoken after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Multiplexed: frames carry a request id
    Mux,
    /// Legacy point-to-point: bare request/response frames
    NetRpc,
}

impl Protocol {
    /// What the host offers, preferred first
    pub const HOST_PREFERENCE: [Protocol; 2] = [Protocol::Mux, Protocol::NetRpc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mux => "mux",
            Protocol::NetRpc => "netrpc",
        }
    }

    /// Comma-separated list for [`PROTOCOLS_ENV`]
    pub fn offer(protocols: &[Protocol]) -> String {
        protocols
            .iter()
            .map(Protocol::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "mux" => Ok(Protocol::Mux),
            "netrpc" => Ok(Protocol::NetRpc),
            other => Err(PluginError::Handshake(format!("unknown protocol '{}'", other))),
        }
    }
}

/// Pick the first protocol of the host's offer this side supports
///
/// A host that sets no offer is an old host speaking only `netrpc`.
pub fn negotiate(offer: Option<&str>) -> Result<Protocol> {
    let Some(offer) = offer.filter(|o| !o.trim().is_empty()) else {
        return Ok(Protocol::NetRpc);
    };

    offer
        .split(',')
        .find_map(|name| name.parse::<Protocol>().ok())
        .ok_or_else(|| PluginError::Handshake(format!("no supported protocol in '{}'", offer)))
}

/// The plugin's handshake line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub core_version: u32,
    pub app_version: u32,
    pub network: String,
    pub protocol: Protocol,
}

impl Handshake {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version: APP_PROTOCOL_VERSION,
            network: NETWORK.to_string(),
            protocol,
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.core_version, self.app_version, self.network, self.protocol
        )
    }

    /// Parse and validate a handshake line
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 4 {
            return Err(PluginError::Handshake(format!(
                "malformed handshake line '{}'; is this a dodo plugin?",
                line
            )));
        }

        let version = |raw: &str, what: &str| {
            raw.parse::<u32>()
                .map_err(|_| PluginError::Handshake(format!("invalid {} version '{}'", what, raw)))
        };
        let core_version = version(parts[0], "core protocol")?;
        let app_version = version(parts[1], "app protocol")?;

        if core_version != CORE_PROTOCOL_VERSION {
            return Err(PluginError::Handshake(format!(
                "core protocol version {} is not supported (expected {})",
                core_version, CORE_PROTOCOL_VERSION
            )));
        }
        if app_version != APP_PROTOCOL_VERSION {
            return Err(PluginError::Handshake(format!(
                "plugin speaks protocol version {}, dodo speaks {}",
                app_version, APP_PROTOCOL_VERSION
            )));
        }
        if parts[2] != NETWORK {
            return Err(PluginError::Handshake(format!(
                "unsupported transport '{}'",
                parts[2]
            )));
        }

        Ok(Self {
            core_version,
            app_version,
            network: parts[2].to_string(),
            protocol: parts[3].parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_line() {
        let handshake = Handshake::parse("1|1|stdio|mux\n").unwrap();
        assert_eq!(handshake, Handshake::new(Protocol::Mux));
        assert_eq!(Handshake::new(Protocol::NetRpc).to_line(), "1|1|stdio|netrpc");
    }

    #[test]
    fn test_rejects_mismatches() {
        for line in [
            "2|1|stdio|mux",
            "1|2|stdio|mux",
            "1|1|tcp|mux",
            "1|1|stdio|grpc",
            "1|1|stdio",
            "hello world",
            "x|1|stdio|mux",
        ] {
            assert!(
                matches!(Handshake::parse(line), Err(PluginError::Handshake(_))),
                "{} should be rejected",
                line
            );
        }
    }

    #[test]
    fn test_negotiate_prefers_host_order() {
        assert_eq!(negotiate(Some("mux,netrpc")).unwrap(), Protocol::Mux);
        assert_eq!(negotiate(Some("netrpc,mux")).unwrap(), Protocol::NetRpc);
        assert_eq!(negotiate(Some("grpc,netrpc")).unwrap(), Protocol::NetRpc);
        assert_eq!(negotiate(None).unwrap(), Protocol::NetRpc);
        assert!(negotiate(Some("grpc")).is_err());
        assert_eq!(Protocol::offer(&Protocol::HOST_PREFERENCE), "mux,netrpc");
    }
}
