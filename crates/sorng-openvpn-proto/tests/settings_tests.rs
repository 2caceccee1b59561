use sorng_openvpn_proto::openvpn::*;
use std::net::IpAddr;

const ASSIGNED: &str = "topology subnet,route-gateway 10.8.0.1,ifconfig 10.8.0.2 255.255.255.0";

fn pushed(directives: &str) -> Configuration {
    PushReply::parse(&format!("PUSH_REPLY,{}", directives))
        .unwrap()
        .options
}

/// Pushed settings on top of a subnet-topology address assignment.
fn assigned(directives: &str) -> Configuration {
    pushed(&format!("{},{}", ASSIGNED, directives))
}

fn remote_with_routes(routes: &[&str]) -> Configuration {
    let mut directives = vec![ASSIGNED.to_string()];
    directives.extend(routes.iter().map(|r| format!("route {}", r)));
    pushed(&directives.join(","))
}

fn route_strings(modules: &ModuleSet) -> Vec<String> {
    modules
        .ip
        .as_ref()
        .and_then(|ip| ip.ipv4.as_ref())
        .map(|v4| v4.included_routes.iter().map(|r| r.to_string()).collect())
        .unwrap_or_default()
}

#[test]
fn test_merge_is_deterministic() {
    let local = parse_ovpn(
        "dhcp-option DNS 1.1.1.1\nroute 172.16.0.0 255.240.0.0 10.8.0.1\ntun-mtu 1400\n",
    )
    .unwrap();
    let remote = pushed(
        "topology subnet,ifconfig 10.8.0.2 255.255.255.0,route 192.168.1.0 255.255.255.0 10.8.0.1,\
         redirect-gateway def1,route-gateway 10.8.0.1,dhcp-option DNS 10.8.0.1,\
         dhcp-option DOMAIN corp.example,http-proxy 10.0.0.1 8080",
    );
    let first = NetworkSettingsBuilder::new(&local, &remote).modules();
    let second = NetworkSettingsBuilder::new(&local, &remote).modules();
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn test_route_pull_mask_drops_every_remote_route() {
    let local = Configuration::builder()
        .no_pull_mask(vec![PullCategory::Routes])
        .routes4(vec![Route::new(
            Subnet::with_mask("172.16.0.0", "255.240.0.0").unwrap(),
            Some("10.8.0.1".parse().unwrap()),
        )])
        .build();

    let route_lists: [&[&str]; 4] = [
        &[],
        &["192.168.1.0 255.255.255.0 10.8.0.1"],
        &["10.10.0.0 255.255.0.0 10.8.0.1", "10.20.0.0 255.255.0.0"],
        &["0.0.0.0 0.0.0.0 10.8.0.1", "192.168.50.0 255.255.255.0 10.8.0.1"],
    ];
    for routes in route_lists {
        let remote = remote_with_routes(routes);
        let modules = NetworkSettingsBuilder::new(&local, &remote).modules();
        assert_eq!(
            route_strings(&modules),
            vec!["172.16.0.0/12 via 10.8.0.1"],
            "remote routes leaked for {:?}",
            routes
        );
    }
}

#[test]
fn test_routes_pulled_without_mask() {
    let local = Configuration::default();
    let remote = remote_with_routes(&["192.168.1.0 255.255.255.0 10.8.0.1"]);
    let modules = NetworkSettingsBuilder::new(&local, &remote).modules();
    assert_eq!(route_strings(&modules), vec!["192.168.1.0/24 via 10.8.0.1"]);
}

#[test]
fn test_proxy_pull_mask_suppresses_proxy_module() {
    let local = Configuration::builder()
        .no_pull_mask(vec![PullCategory::Proxy])
        .build();
    let remote = assigned("http-proxy 10.0.0.1 8080");
    assert_eq!(
        remote.http_proxy,
        Some(ProxyEndpoint::new("10.0.0.1", 8080))
    );
    let modules = NetworkSettingsBuilder::new(&local, &remote).modules();
    assert!(modules.http_proxy.is_none());
    assert!(modules.ip.is_some());
}

#[test]
fn test_mtu_absent_when_unset_locally() {
    let local = Configuration::default();
    let remote = assigned("route 10.1.0.0 255.255.0.0 10.8.0.1");
    let ip = NetworkSettingsBuilder::new(&local, &remote)
        .modules()
        .ip
        .unwrap();
    assert_eq!(ip.mtu, None);
    assert!(ip.ipv4.is_some());
}

#[test]
fn test_dns_absent_without_servers() {
    let local = Configuration::builder()
        .search_domains(vec!["home.example".into()])
        .build();
    let remote = assigned("dhcp-option DOMAIN corp.example");
    let modules = NetworkSettingsBuilder::new(&local, &remote).modules();
    assert!(modules.dns.is_none());
}

#[test]
fn test_dns_from_both_sides() {
    let local = parse_ovpn("dhcp-option DNS 9.9.9.9\n").unwrap();
    let remote = pushed("dhcp-option DNS 10.8.0.1,dhcp-option DNS6 fd00::1");
    let dns = NetworkSettingsBuilder::new(&local, &remote)
        .modules()
        .dns
        .unwrap();
    let servers: Vec<IpAddr> = ["9.9.9.9", "10.8.0.1", "fd00::1"]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();
    assert_eq!(dns.servers, servers);
}

#[test]
fn test_default_route_honoured_only_for_gateway() {
    let local = Configuration::default();
    let with_policy = pushed(
        "ifconfig 10.8.0.2 255.255.255.0,route-gateway 10.8.0.1,topology subnet,\
         redirect-gateway def1",
    );
    let modules = NetworkSettingsBuilder::new(&local, &with_policy).modules();
    assert!(route_strings(&modules).iter().any(|r| r.starts_with("default")));

    let without = pushed(ASSIGNED);
    let modules = NetworkSettingsBuilder::new(&local, &without).modules();
    assert!(route_strings(&modules).iter().all(|r| !r.starts_with("default")));
}

#[test]
fn test_module_set_serialization() {
    let local = Configuration::default();
    let remote = assigned("dhcp-option DNS 10.8.0.1");
    let modules = NetworkSettingsBuilder::new(&local, &remote).modules();
    let json = serde_json::to_string(&modules).unwrap();
    let back: ModuleSet = serde_json::from_str(&json).unwrap();
    assert_eq!(back, modules);
}
