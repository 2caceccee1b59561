//! Merge of local and server-pushed settings into the modules a tunnel
//! provider installs: addresses and routes, DNS, and HTTP proxies.
//!
//! Local settings always apply. Remote settings of a category apply only
//! while that category is absent from the local `no_pull_mask`.

use crate::openvpn::config::Configuration;
use crate::openvpn::routing::{IpSettings, Route};
use crate::openvpn::types::*;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpModule {
    pub ipv4: Option<IpSettings>,
    pub ipv6: Option<IpSettings>,
    pub mtu: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsModule {
    pub servers: Vec<IpAddr>,
    pub domain_name: Option<String>,
    pub search_domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpProxyModule {
    pub proxy: Option<ProxyEndpoint>,
    pub secure_proxy: Option<ProxyEndpoint>,
    pub pac_url: Option<String>,
    pub bypass_domains: Vec<String>,
}

/// Network modules for one negotiated session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSet {
    pub ip: Option<IpModule>,
    pub dns: Option<DnsModule>,
    pub http_proxy: Option<HttpProxyModule>,
}

impl ModuleSet {
    pub fn is_empty(&self) -> bool {
        self.ip.is_none() && self.dns.is_none() && self.http_proxy.is_none()
    }
}

/// Computes the effective network settings from local and remote options.
pub struct NetworkSettingsBuilder<'a> {
    local: &'a Configuration,
    remote: &'a Configuration,
}

impl<'a> NetworkSettingsBuilder<'a> {
    pub fn new(local: &'a Configuration, remote: &'a Configuration) -> Self {
        Self { local, remote }
    }

    pub fn modules(&self) -> ModuleSet {
        ModuleSet {
            ip: self.ip_module(),
            dns: self.dns_module(),
            http_proxy: self.http_proxy_module(),
        }
    }

    /// Log the merged result at info level.
    pub fn log_negotiated(&self) {
        let modules = self.modules();
        if let Some(ip) = &modules.ip {
            if let Some(v4) = &ip.ipv4 {
                log::info!("Negotiated IPv4: {}", v4.subnet);
                for route in &v4.included_routes {
                    log::info!("\tRoute: {}", route);
                }
            }
            if let Some(v6) = &ip.ipv6 {
                log::info!("Negotiated IPv6: {}", v6.subnet);
                for route in &v6.included_routes {
                    log::info!("\tRoute: {}", route);
                }
            }
            if let Some(mtu) = ip.mtu {
                log::info!("Negotiated MTU: {}", mtu);
            }
        }
        if let Some(dns) = &modules.dns {
            let servers: Vec<String> = dns.servers.iter().map(|s| s.to_string()).collect();
            log::info!("Negotiated DNS: servers {:?}", servers);
            if let Some(domain) = &dns.domain_name {
                log::info!("\tDomain: {}", domain);
            }
            if !dns.search_domains.is_empty() {
                log::info!("\tSearch domains: {:?}", dns.search_domains);
            }
        }
        if let Some(proxy) = &modules.http_proxy {
            if let Some(p) = &proxy.proxy {
                log::info!("Negotiated HTTP proxy: {}", p);
            }
            if let Some(p) = &proxy.secure_proxy {
                log::info!("Negotiated HTTPS proxy: {}", p);
            }
            if let Some(url) = &proxy.pac_url {
                log::info!("Negotiated PAC URL: {}", url);
            }
            if !proxy.bypass_domains.is_empty() {
                log::info!("\tBypass domains: {:?}", proxy.bypass_domains);
            }
        }
    }

    // ── pull mask ────────────────────────────────────────────────

    fn pulls(&self, category: PullCategory) -> bool {
        self.local.pulls(category)
    }

    /// Pick remote over local when pulling `category`, local otherwise.
    fn pick<T: Clone>(
        &self,
        category: PullCategory,
        f: impl Fn(&Configuration) -> Option<T>,
    ) -> Option<T> {
        if self.pulls(category) {
            f(self.remote).or_else(|| f(self.local))
        } else {
            f(self.local)
        }
    }

    /// Local values, followed by remote values when pulling `category`.
    fn concat<T: Clone>(
        &self,
        category: PullCategory,
        f: impl Fn(&Configuration) -> Option<&Vec<T>>,
    ) -> Vec<T> {
        let mut out: Vec<T> = f(self.local).cloned().unwrap_or_default();
        if self.pulls(category) {
            if let Some(remote) = f(self.remote) {
                out.extend(remote.iter().cloned());
            }
        }
        out
    }

    // ── IP ───────────────────────────────────────────────────────

    fn routing_policies(&self) -> Vec<RoutingPolicy> {
        self.pick(PullCategory::Routes, |c| c.routing_policies.clone())
            .unwrap_or_default()
    }

    fn is_ipv4_gateway(&self) -> bool {
        self.routing_policies().contains(&RoutingPolicy::Ipv4)
    }

    fn is_ipv6_gateway(&self) -> bool {
        self.routing_policies().contains(&RoutingPolicy::Ipv6)
    }

    fn merge_family(
        &self,
        remote: &IpSettings,
        local_routes: Option<&Vec<Route>>,
        remote_routes: Option<&Vec<Route>>,
        is_gateway: bool,
    ) -> IpSettings {
        let mut routes: Vec<Route> = remote.included_routes.clone();
        routes.extend(local_routes.into_iter().flatten().copied());
        if self.pulls(PullCategory::Routes) {
            routes.extend(remote_routes.into_iter().flatten().copied());
        }
        let included: Vec<Route> = routes
            .into_iter()
            .filter(|r| !r.is_default() || (is_gateway && r.gateway.is_some()))
            .collect();
        IpSettings::new(remote.subnet)
            .including(included)
            .excluding(remote.excluded_routes.iter().copied())
    }

    fn ipv4_settings(&self) -> Option<IpSettings> {
        let remote = self.remote.ipv4.as_ref()?;
        Some(self.merge_family(
            remote,
            self.local.routes4.as_ref(),
            self.remote.routes4.as_ref(),
            self.is_ipv4_gateway(),
        ))
    }

    fn ipv6_settings(&self) -> Option<IpSettings> {
        let remote = self.remote.ipv6.as_ref()?;
        Some(self.merge_family(
            remote,
            self.local.routes6.as_ref(),
            self.remote.routes6.as_ref(),
            self.is_ipv6_gateway(),
        ))
    }

    fn ip_module(&self) -> Option<IpModule> {
        let ipv4 = self.ipv4_settings();
        let ipv6 = self.ipv6_settings();
        let mtu = self.local.mtu.filter(|m| *m > 0);
        if ipv4.is_none() && ipv6.is_none() && mtu.is_none() {
            return None;
        }
        Some(IpModule { ipv4, ipv6, mtu })
    }

    // ── DNS ──────────────────────────────────────────────────────

    fn dns_module(&self) -> Option<DnsModule> {
        let servers = self.concat(PullCategory::Dns, |c| c.dns_servers.as_ref());
        if servers.is_empty() {
            return None;
        }
        Some(DnsModule {
            servers,
            domain_name: self.pick(PullCategory::Dns, |c| c.dns_domain.clone()),
            search_domains: self.concat(PullCategory::Dns, |c| c.search_domains.as_ref()),
        })
    }

    // ── Proxy ────────────────────────────────────────────────────

    fn http_proxy_module(&self) -> Option<HttpProxyModule> {
        let proxy = self.pick(PullCategory::Proxy, |c| c.http_proxy.clone());
        let secure_proxy = self.pick(PullCategory::Proxy, |c| c.https_proxy.clone());
        let pac_url = self.pick(PullCategory::Proxy, |c| c.proxy_auto_configuration_url.clone());
        if proxy.is_none() && secure_proxy.is_none() && pac_url.is_none() {
            return None;
        }
        Some(HttpProxyModule {
            proxy,
            secure_proxy,
            pac_url,
            bypass_domains: self.concat(PullCategory::Proxy, |c| c.proxy_bypass_domains.as_ref()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openvpn::routing::Subnet;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn remote() -> Configuration {
        let subnet = Subnet::with_mask("10.8.0.2", "255.255.255.0").unwrap();
        Configuration::builder()
            .ipv4(IpSettings::new(subnet).including([Route::default_with_gateway(ip("10.8.0.1"))]))
            .routes4(vec![Route::new(
                Subnet::with_mask("192.168.10.0", "255.255.255.0").unwrap(),
                Some(ip("10.8.0.1")),
            )])
            .routing_policies(vec![RoutingPolicy::Ipv4])
            .dns_servers(vec![ip("10.8.0.1")])
            .dns_domain("vpn.example".into())
            .search_domains(vec!["corp.example".into()])
            .http_proxy(ProxyEndpoint::new("proxy.remote", 8080))
            .proxy_bypass_domains(vec!["remote.bypass".into()])
            .build()
    }

    // ── IP ───────────────────────────────────────────────────────

    #[test]
    fn routes_merge_in_order() {
        let local = Configuration::builder()
            .routes4(vec![Route::new(
                Subnet::with_mask("172.16.0.0", "255.240.0.0").unwrap(),
                Some(ip("10.8.0.1")),
            )])
            .build();
        let remote = remote();
        let modules = NetworkSettingsBuilder::new(&local, &remote).modules();
        let v4 = modules.ip.unwrap().ipv4.unwrap();
        let routes: Vec<String> = v4.included_routes.iter().map(|r| r.to_string()).collect();
        assert_eq!(
            routes,
            vec![
                "default via 10.8.0.1",
                "172.16.0.0/12 via 10.8.0.1",
                "192.168.10.0/24 via 10.8.0.1",
            ]
        );
    }

    #[test]
    fn default_route_needs_gateway_policy() {
        let local = Configuration::default();
        let remote = remote().to_builder().routing_policies(vec![]).build();
        let modules = NetworkSettingsBuilder::new(&local, &remote).modules();
        let v4 = modules.ip.unwrap().ipv4.unwrap();
        assert!(v4.included_routes.iter().all(|r| !r.is_default()));
    }

    #[test]
    fn no_pull_routes_keeps_only_local() {
        let local = Configuration::builder()
            .no_pull_mask(vec![PullCategory::Routes])
            .build();
        let remote = remote();
        let modules = NetworkSettingsBuilder::new(&local, &remote).modules();
        let v4 = modules.ip.unwrap().ipv4.unwrap();
        assert_eq!(v4.subnet.to_string(), "10.8.0.2/24");
        // Local has no redirect-gateway, so the pushed default route is dropped.
        assert!(v4.included_routes.is_empty());
    }

    #[test]
    fn mtu_only_when_positive() {
        let remote = Configuration::default();
        let local = Configuration::builder().mtu(0).build();
        assert!(NetworkSettingsBuilder::new(&local, &remote).modules().ip.is_none());
        let local = Configuration::builder().mtu(1400).build();
        let ip = NetworkSettingsBuilder::new(&local, &remote).modules().ip.unwrap();
        assert_eq!(ip.mtu, Some(1400));
        assert!(ip.ipv4.is_none());
    }

    // ── DNS ──────────────────────────────────────────────────────

    #[test]
    fn dns_merges_local_then_remote() {
        let local = Configuration::builder()
            .dns_servers(vec![ip("1.1.1.1")])
            .dns_domain("local.example".into())
            .search_domains(vec!["home.example".into()])
            .build();
        let remote = remote();
        let dns = NetworkSettingsBuilder::new(&local, &remote).modules().dns.unwrap();
        assert_eq!(dns.servers, vec![ip("1.1.1.1"), ip("10.8.0.1")]);
        assert_eq!(dns.domain_name.as_deref(), Some("vpn.example"));
        assert_eq!(dns.search_domains, vec!["home.example", "corp.example"]);
    }

    #[test]
    fn dns_suppressed_by_pull_mask() {
        let local = Configuration::builder()
            .no_pull_mask(vec![PullCategory::Dns])
            .build();
        let remote = remote();
        assert!(NetworkSettingsBuilder::new(&local, &remote).modules().dns.is_none());
    }

    // ── Proxy ────────────────────────────────────────────────────

    #[test]
    fn proxy_remote_overrides_local() {
        let local = Configuration::builder()
            .http_proxy(ProxyEndpoint::new("proxy.local", 3128))
            .proxy_bypass_domains(vec!["local.bypass".into()])
            .build();
        let remote = remote();
        let proxy = NetworkSettingsBuilder::new(&local, &remote)
            .modules()
            .http_proxy
            .unwrap();
        assert_eq!(proxy.proxy, Some(ProxyEndpoint::new("proxy.remote", 8080)));
        assert_eq!(proxy.bypass_domains, vec!["local.bypass", "remote.bypass"]);
    }

    #[test]
    fn bypass_alone_yields_no_proxy_module() {
        let local = Configuration::builder()
            .proxy_bypass_domains(vec!["local.bypass".into()])
            .build();
        let remote = Configuration::default();
        assert!(NetworkSettingsBuilder::new(&local, &remote)
            .modules()
            .http_proxy
            .is_none());
    }

    #[test]
    fn empty_inputs_yield_empty_set() {
        let c = Configuration::default();
        assert!(NetworkSettingsBuilder::new(&c, &c).modules().is_empty());
    }
}
