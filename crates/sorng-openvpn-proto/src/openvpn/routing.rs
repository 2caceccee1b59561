//! Subnets, routes and per-family IP settings, with the mask/prefix helpers
//! the option grammar needs.

use crate::openvpn::types::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Subnet
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An address with its prefix length, e.g. `10.8.0.2/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subnet {
    pub address: IpAddr,
    pub prefix_length: u8,
}

impl Subnet {
    /// IPv4 address plus dotted mask.
    pub fn with_mask(address: &str, mask: &str) -> Result<Self, OpenVpnError> {
        let ip: Ipv4Addr = address.parse().map_err(|_| {
            OpenVpnError::parse("invalid IPv4 address").with_detail(address.to_string())
        })?;
        let prefix = mask_to_prefix(mask).ok_or_else(|| {
            OpenVpnError::parse("invalid IPv4 netmask").with_detail(mask.to_string())
        })?;
        Ok(Self {
            address: IpAddr::V4(ip),
            prefix_length: prefix,
        })
    }

    /// Any address family plus prefix length.
    pub fn with_prefix(address: &str, prefix_length: u8) -> Result<Self, OpenVpnError> {
        let ip: IpAddr = address.parse().map_err(|_| {
            OpenVpnError::parse("invalid IP address").with_detail(address.to_string())
        })?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        if prefix_length > max {
            return Err(OpenVpnError::parse("prefix length out of range")
                .with_detail(format!("{}/{}", address, prefix_length)));
        }
        Ok(Self {
            address: ip,
            prefix_length,
        })
    }

    /// Parse `addr/prefix`.
    pub fn from_cidr(cidr: &str) -> Result<Self, OpenVpnError> {
        let (addr, prefix) = cidr.split_once('/').ok_or_else(|| {
            OpenVpnError::parse("address must have a /prefix").with_detail(cidr.to_string())
        })?;
        let prefix: u8 = prefix.parse().map_err(|_| {
            OpenVpnError::parse("address prefix must be a 8-bit number").with_detail(cidr.to_string())
        })?;
        Self::with_prefix(addr, prefix)
    }

    /// Dotted mask, IPv4 only.
    pub fn mask(&self) -> Option<String> {
        match self.address {
            IpAddr::V4(_) => Some(prefix_to_mask(self.prefix_length)),
            IpAddr::V6(_) => None,
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_length)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Route / IP settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A route. No destination means the default route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub destination: Option<Subnet>,
    pub gateway: Option<IpAddr>,
}

impl Route {
    pub fn new(destination: Subnet, gateway: Option<IpAddr>) -> Self {
        Self {
            destination: Some(destination),
            gateway,
        }
    }

    pub fn default_with_gateway(gateway: IpAddr) -> Self {
        Self {
            destination: None,
            gateway: Some(gateway),
        }
    }

    pub fn is_default(&self) -> bool {
        self.destination.is_none()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.destination {
            Some(d) => write!(f, "{}", d)?,
            None => write!(f, "default")?,
        }
        if let Some(gw) = &self.gateway {
            write!(f, " via {}", gw)?;
        }
        Ok(())
    }
}

/// Address assignment for one family plus the routes bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSettings {
    pub subnet: Subnet,
    pub included_routes: Vec<Route>,
    pub excluded_routes: Vec<Route>,
}

impl IpSettings {
    pub fn new(subnet: Subnet) -> Self {
        Self {
            subnet,
            included_routes: Vec::new(),
            excluded_routes: Vec::new(),
        }
    }

    pub fn including(mut self, routes: impl IntoIterator<Item = Route>) -> Self {
        self.included_routes.extend(routes);
        self
    }

    pub fn excluding(mut self, routes: impl IntoIterator<Item = Route>) -> Self {
        self.excluded_routes.extend(routes);
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Mask/prefix conversions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Convert a contiguous subnet mask to a CIDR prefix length.
pub fn mask_to_prefix(mask: &str) -> Option<u8> {
    let addr: Ipv4Addr = mask.parse().ok()?;
    let bits = u32::from(addr);
    let prefix = bits.leading_ones();
    if prefix < 32 && bits << prefix != 0 {
        return None;
    }
    Some(prefix as u8)
}

/// Convert a CIDR prefix length to a subnet mask.
pub fn prefix_to_mask(prefix: u8) -> String {
    if prefix >= 32 {
        return "255.255.255.255".into();
    }
    let bits: u32 = if prefix == 0 {
        0
    } else {
        !0u32 << (32 - prefix)
    };
    Ipv4Addr::from(bits).to_string()
}

/// Parse a gateway argument; `vpn_gateway` means "use the default gateway".
pub fn parse_gateway(arg: Option<&str>) -> Result<Option<IpAddr>, OpenVpnError> {
    match arg {
        None | Some("vpn_gateway") => Ok(None),
        Some(gw) => gw
            .parse()
            .map(Some)
            .map_err(|_| OpenVpnError::parse("invalid gateway").with_detail(gw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── mask helpers ─────────────────────────────────────────────

    #[test]
    fn mask_to_prefix_common() {
        assert_eq!(mask_to_prefix("255.255.255.0"), Some(24));
        assert_eq!(mask_to_prefix("255.255.255.255"), Some(32));
        assert_eq!(mask_to_prefix("0.0.0.0"), Some(0));
        assert_eq!(mask_to_prefix("255.0.255.0"), None);
        assert_eq!(mask_to_prefix("garbage"), None);
    }

    #[test]
    fn prefix_to_mask_common() {
        assert_eq!(prefix_to_mask(24), "255.255.255.0");
        assert_eq!(prefix_to_mask(0), "0.0.0.0");
        assert_eq!(prefix_to_mask(32), "255.255.255.255");
        assert_eq!(prefix_to_mask(40), "255.255.255.255");
    }

    // ── Subnet ───────────────────────────────────────────────────

    #[test]
    fn subnet_with_mask() {
        let s = Subnet::with_mask("10.8.0.2", "255.255.255.0").unwrap();
        assert_eq!(s.to_string(), "10.8.0.2/24");
        assert_eq!(s.mask().as_deref(), Some("255.255.255.0"));
    }

    #[test]
    fn subnet_rejects_bad_input() {
        assert!(Subnet::with_mask("10.8.0.300", "255.255.255.0").is_err());
        assert!(Subnet::with_mask("10.8.0.2", "255.0.255.0").is_err());
        assert!(Subnet::with_prefix("fe80::1", 129).is_err());
    }

    #[test]
    fn subnet_from_cidr_v6() {
        let s = Subnet::from_cidr("fd00::2/64").unwrap();
        assert!(s.address.is_ipv6());
        assert_eq!(s.prefix_length, 64);
        assert_eq!(s.mask(), None);
        assert!(Subnet::from_cidr("fd00::2").is_err());
        assert!(Subnet::from_cidr("fd00::2/x").is_err());
    }

    // ── Route ────────────────────────────────────────────────────

    #[test]
    fn route_display() {
        let gw: IpAddr = "10.8.0.1".parse().unwrap();
        let r = Route::new(Subnet::with_mask("192.168.1.0", "255.255.255.0").unwrap(), Some(gw));
        assert_eq!(r.to_string(), "192.168.1.0/24 via 10.8.0.1");
        let d = Route::default_with_gateway(gw);
        assert!(d.is_default());
        assert_eq!(d.to_string(), "default via 10.8.0.1");
    }

    #[test]
    fn gateway_parsing() {
        assert_eq!(parse_gateway(None).unwrap(), None);
        assert_eq!(parse_gateway(Some("vpn_gateway")).unwrap(), None);
        assert!(parse_gateway(Some("10.0.0.1")).unwrap().is_some());
        assert!(parse_gateway(Some("nope")).is_err());
    }

    #[test]
    fn ip_settings_builder() {
        let s = Subnet::with_mask("10.8.0.2", "255.255.255.0").unwrap();
        let gw: IpAddr = "10.8.0.1".parse().unwrap();
        let ip = IpSettings::new(s).including([Route::default_with_gateway(gw)]);
        assert_eq!(ip.included_routes.len(), 1);
        assert!(ip.excluded_routes.is_empty());
    }

    #[test]
    fn ip_settings_serde_roundtrip() {
        let ip = IpSettings::new(Subnet::from_cidr("fd00::2/64").unwrap());
        let json = serde_json::to_string(&ip).unwrap();
        let back: IpSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(ip, back);
    }
}
