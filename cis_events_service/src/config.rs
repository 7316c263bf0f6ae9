// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process configuration, parsed eagerly at startup from environment
//! variables (or matching CLI flags) so a misconfiguration fails fast.

use std::net::SocketAddr;

use clap::Parser;

/// Event bus service configuration.
#[derive(Parser, Debug)]
#[command(name = "cis-events-service", about = "Typed publish/subscribe event bus")]
pub struct Config {
    /// MQTT broker URL, e.g. `mqtt://broker.local:1883`.
    #[arg(long, env = "MQTT_URL")]
    pub mqtt_url: String,

    /// Address the public gRPC listener binds to.
    #[arg(long, env = "LISTEN", default_value = ":8090")]
    pub listen: String,

    /// Address the admin gRPC listener binds to. Requests arriving here are
    /// tagged for a downstream auth interceptor to treat as superuser; this
    /// binary only runs the second listener.
    #[arg(long, env = "ADMIN_LISTEN", default_value = ":8091")]
    pub admin_listen: String,

    /// Comma-separated list of origins allowed by CORS on the public
    /// listener.
    #[arg(long, env = "ALLOWED_ORIGINS", default_value = "*")]
    pub allowed_origins: String,
}

impl Config {
    /// Parse configuration from the process environment and command line.
    ///
    /// # Errors
    /// Returns a description of the problem if a required value is missing
    /// or a listen address cannot be parsed.
    pub fn load() -> Result<Self, String> {
        let config = Self::try_parse().map_err(|e| e.to_string())?;
        // Validate eagerly so a typo'd listen address is reported before any
        // socket is opened, not when the listener is bound.
        parse_listen_addr(&config.listen)?;
        parse_listen_addr(&config.admin_listen)?;
        Ok(config)
    }

    /// The public listener's resolved socket address.
    ///
    /// # Errors
    /// Returns a description of the problem if the address is malformed.
    pub fn listen_addr(&self) -> Result<SocketAddr, String> {
        parse_listen_addr(&self.listen)
    }

    /// The admin listener's resolved socket address.
    ///
    /// # Errors
    /// Returns a description of the problem if the address is malformed.
    pub fn admin_listen_addr(&self) -> Result<SocketAddr, String> {
        parse_listen_addr(&self.admin_listen)
    }
}

/// Parse a Go-style listen address (`:8090`, meaning "all interfaces on port
/// 8090") or an ordinary `host:port` pair.
fn parse_listen_addr(addr: &str) -> Result<SocketAddr, String> {
    let addr = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    };
    addr.parse()
        .map_err(|e| format!("invalid listen address {addr:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_binds_all_interfaces() {
        assert_eq!(parse_listen_addr(":8090").unwrap(), "0.0.0.0:8090".parse().unwrap());
    }

    #[test]
    fn host_and_port_parses_directly() {
        assert_eq!(
            parse_listen_addr("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse().unwrap()
        );
    }

    #[test]
    fn malformed_address_is_rejected() {
        assert!(parse_listen_addr("not-an-address").is_err());
    }
}
