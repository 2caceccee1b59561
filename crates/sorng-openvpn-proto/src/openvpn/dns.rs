//! `dhcp-option` grammar: DNS servers, domains and proxy hints.

use crate::openvpn::types::*;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A parsed `dhcp-option`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhcpOption {
    Dns(IpAddr),
    Domain(String),
    DomainSearch(String),
    ProxyHttp(ProxyEndpoint),
    ProxyHttps(ProxyEndpoint),
    ProxyAutoConfigUrl(String),
    ProxyBypass(Vec<String>),
    /// Recognised by OpenVPN but not used by this client (NBT, WINS, …).
    Ignored(String),
}

fn single_arg<'a>(name: &str, args: &[&'a str]) -> Result<&'a str, OpenVpnError> {
    match args {
        [_, value] => Ok(value),
        _ => Err(OpenVpnError::parse(format!("dhcp-option {} takes 1 argument", name))),
    }
}

fn proxy_endpoint(name: &str, args: &[&str]) -> Result<ProxyEndpoint, OpenVpnError> {
    match args {
        [_, host, port] => {
            let port: u16 = port.parse().map_err(|_| {
                OpenVpnError::parse(format!("dhcp-option {} has malformed port", name))
                    .with_detail(port.to_string())
            })?;
            Ok(ProxyEndpoint::new(*host, port))
        }
        _ => Err(OpenVpnError::parse(format!("dhcp-option {} takes host and port", name))),
    }
}

/// Parse the arguments of a `dhcp-option` directive (the kind comes first).
pub fn parse_dhcp_option(args: &[&str]) -> Result<DhcpOption, OpenVpnError> {
    let kind = args
        .first()
        .ok_or_else(|| OpenVpnError::parse("dhcp-option without kind"))?;
    match kind.to_uppercase().as_str() {
        "DNS" | "DNS6" => {
            let value = single_arg(kind, args)?;
            let ip: IpAddr = value.parse().map_err(|_| {
                OpenVpnError::parse("dhcp-option DNS has malformed address")
                    .with_detail(value.to_string())
            })?;
            Ok(DhcpOption::Dns(ip))
        }
        "DOMAIN" => Ok(DhcpOption::Domain(single_arg(kind, args)?.to_string())),
        "DOMAIN-SEARCH" => Ok(DhcpOption::DomainSearch(single_arg(kind, args)?.to_string())),
        "PROXY_HTTP" => Ok(DhcpOption::ProxyHttp(proxy_endpoint(kind, args)?)),
        "PROXY_HTTPS" => Ok(DhcpOption::ProxyHttps(proxy_endpoint(kind, args)?)),
        "PROXY_AUTO_CONFIG_URL" => {
            let value = single_arg(kind, args)?;
            url::Url::parse(value).map_err(|e| {
                OpenVpnError::parse("dhcp-option PROXY_AUTO_CONFIG_URL has malformed URL")
                    .with_detail(e.to_string())
            })?;
            Ok(DhcpOption::ProxyAutoConfigUrl(value.to_string()))
        }
        "PROXY_BYPASS" => {
            if args.len() < 2 {
                return Err(OpenVpnError::parse("dhcp-option PROXY_BYPASS without domains"));
            }
            Ok(DhcpOption::ProxyBypass(
                args[1..].iter().map(|s| s.to_string()).collect(),
            ))
        }
        _ => Ok(DhcpOption::Ignored(kind.to_string())),
    }
}
