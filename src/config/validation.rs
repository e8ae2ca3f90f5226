//! Input validation functions
//!
//! This module validates everything an entity write can carry: interface
//! names, hosts, ports, subnets, keepalive intervals and allow-lists.

use crate::error::{FleetError, Result};
use ipnetwork::Ipv4Network;
use std::net::{IpAddr, Ipv4Addr};

/// Allow-list value meaning "everything"
pub const ALLOW_ALL: &str = "0.0.0.0/0";

/// Validate interface name (alphanumeric, max 15 chars)
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FleetError::Validation(
            "Interface name cannot be empty".to_string(),
        ));
    }

    if name.len() > 15 {
        return Err(FleetError::Validation(format!(
            "Interface name '{}' exceeds maximum length of 15 characters",
            name
        )));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(FleetError::Validation(format!(
            "Interface name '{}' contains invalid characters (only alphanumeric, '_', and '-' allowed)",
            name
        )));
    }

    Ok(())
}

/// Validate an entity display name
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(FleetError::Validation(format!("{} name cannot be empty", kind)));
    }
    if name.len() > 255 {
        return Err(FleetError::Validation(format!(
            "{} name exceeds maximum length of 255 characters",
            kind
        )));
    }
    Ok(())
}

/// Validate a management host (IP or hostname).
///
/// The host ends up on the ssh command line, so only characters that can
/// appear in a hostname or IP literal are accepted.
pub fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(FleetError::Validation("Host cannot be empty".to_string()));
    }

    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    if host.starts_with('-')
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(FleetError::Validation(format!(
            "Invalid host '{}' (expected an IP address or hostname)",
            host
        )));
    }

    Ok(())
}

/// Validate listen port
pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(FleetError::Validation(
            "Port number cannot be 0".to_string(),
        ));
    }
    Ok(())
}

/// Parse a server subnet. Host bits must be zero.
pub fn parse_network(network: &str) -> Result<Ipv4Network> {
    let trimmed = network.trim();
    let parsed: Ipv4Network = trimmed
        .parse()
        .map_err(|_| FleetError::Validation(format!("Not a valid network: {}", network)))?;

    if parsed.ip() != parsed.network() {
        return Err(FleetError::Validation(format!(
            "Network {} has host bits set (did you mean {}/{}?)",
            trimmed,
            parsed.network(),
            parsed.prefix()
        )));
    }

    Ok(parsed)
}

/// Validate keepalive timeout
pub fn validate_keepalive(secs: u16) -> Result<()> {
    // Reasonable range: 0 (disabled) or 10-300 seconds
    if secs > 0 && secs < 10 {
        return Err(FleetError::Validation(format!(
            "Keepalive interval {} is too short (minimum 10 seconds or 0 to disable)",
            secs
        )));
    }

    if secs > 300 {
        return Err(FleetError::Validation(format!(
            "Keepalive interval {} is too long (maximum 300 seconds)",
            secs
        )));
    }

    Ok(())
}

/// Validate one allow-list token: an IPv4 address or IPv4 network
pub fn validate_allow_token(token: &str) -> Result<()> {
    if token.parse::<Ipv4Addr>().is_ok() {
        return Ok(());
    }

    if token.contains('/') && token.parse::<Ipv4Network>().is_ok() {
        return Ok(());
    }

    Err(FleetError::Validation(format!(
        "'{}' is not a valid IPv4 address or network",
        token
    )))
}

/// Validate a download token (lowercase hex of the fixed token length)
pub fn validate_download_token(token: &str) -> Result<()> {
    let well_formed = token.len() == crate::model::TOKEN_LEN
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if !well_formed {
        return Err(FleetError::Validation(format!(
            "Token '{}' must be {} lowercase hex characters",
            token,
            crate::model::TOKEN_LEN
        )));
    }
    Ok(())
}

fn split_tokens(input: &str) -> impl Iterator<Item = &str> {
    input.split(',').map(str::trim).filter(|t| !t.is_empty())
}

/// Validate and normalize a group allow-list.
///
/// Tokens are trimmed and rejoined one per line (`",\n"`). Any occurrence of
/// `0.0.0.0/0` collapses the whole list to `0.0.0.0/0`.
pub fn normalize_allow_list(input: &str) -> Result<String> {
    if input.contains(ALLOW_ALL) {
        return Ok(ALLOW_ALL.to_string());
    }

    let tokens: Vec<&str> = split_tokens(input).collect();
    for token in &tokens {
        validate_allow_token(token)?;
    }

    Ok(tokens.join(",\n"))
}

/// Validate and normalize a client's extra allowed ranges.
///
/// Returns `None` for blank input, otherwise the tokens joined with `,`
/// ready to be appended to an `AllowedIPs` line.
pub fn normalize_extra_allowed(input: &str) -> Result<Option<String>> {
    let tokens: Vec<&str> = split_tokens(input).collect();
    if tokens.is_empty() {
        return Ok(None);
    }

    for token in &tokens {
        validate_allow_token(token)?;
    }

    Ok(Some(tokens.join(",")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_interface_name() {
        assert!(validate_interface_name("wg0").is_ok());
        assert!(validate_interface_name("wg-test").is_ok());
        assert!(validate_interface_name("wg_test").is_ok());
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("wg@test").is_err());
        assert!(validate_interface_name("wg0;reboot").is_err());
        assert!(validate_interface_name("toolonginterfacename").is_err());
    }

    #[test]
    fn test_validate_host() {
        assert!(validate_host("192.168.1.1").is_ok());
        assert!(validate_host("vpn-1.example.com").is_ok());
        assert!(validate_host("::1").is_ok());
        assert!(validate_host("").is_err());
        assert!(validate_host("-oProxyCommand=x").is_err());
        assert!(validate_host("host name").is_err());
    }

    #[test]
    fn test_validate_port() {
        assert!(validate_port(41800).is_ok());
        assert!(validate_port(0).is_err());
    }

    #[test]
    fn test_parse_network() {
        let net = parse_network("10.10.10.0/24").unwrap();
        assert_eq!(net.network(), Ipv4Addr::new(10, 10, 10, 0));
        assert_eq!(net.prefix(), 24);

        assert!(parse_network("10.10.10.5/24").is_err());
        assert!(parse_network("10.10.10.0/33").is_err());
        assert!(parse_network("not-a-network").is_err());
        assert!(parse_network("fe80::/64").is_err());
    }

    #[test]
    fn test_validate_keepalive() {
        assert!(validate_keepalive(0).is_ok());
        assert!(validate_keepalive(20).is_ok());
        assert!(validate_keepalive(300).is_ok());
        assert!(validate_keepalive(5).is_err());
        assert!(validate_keepalive(301).is_err());
    }

    #[test]
    fn test_normalize_allow_list() {
        assert_eq!(
            normalize_allow_list("10.0.0.0/8, 192.168.1.1").unwrap(),
            "10.0.0.0/8,\n192.168.1.1"
        );
        assert_eq!(
            normalize_allow_list("10.0.0.0/8, 0.0.0.0/0, 192.168.1.1").unwrap(),
            "0.0.0.0/0"
        );
        assert_eq!(normalize_allow_list("0.0.0.0/0").unwrap(), "0.0.0.0/0");
        assert!(normalize_allow_list("not-an-ip").is_err());
        assert!(normalize_allow_list("10.0.0.0/8, nope").is_err());
        assert!(normalize_allow_list("10.0.0.0/40").is_err());
    }

    #[test]
    fn test_normalize_allow_list_is_idempotent() {
        let once = normalize_allow_list("10.0.0.0/8, 192.168.1.1").unwrap();
        assert_eq!(normalize_allow_list(&once).unwrap(), once);
    }

    #[test]
    fn test_normalize_extra_allowed() {
        assert_eq!(normalize_extra_allowed("").unwrap(), None);
        assert_eq!(normalize_extra_allowed(" , ").unwrap(), None);
        assert_eq!(
            normalize_extra_allowed("192.168.50.0/24, 10.1.1.1").unwrap(),
            Some("192.168.50.0/24,10.1.1.1".to_string())
        );
        assert!(normalize_extra_allowed("192.168.50.0/24 10.1.1.1").is_err());
    }

    #[test]
    fn test_validate_download_token() {
        assert!(validate_download_token("a1b2c3").is_ok());
        assert!(validate_download_token("A1B2C3").is_err());
        assert!(validate_download_token("a1b2c").is_err());
        assert!(validate_download_token("a1b2cz").is_err());
    }
}
