use sorng_openvpn_proto::openvpn::*;
use std::time::Duration;

const SUBNET_REPLY: &str = "PUSH_REPLY,dhcp-option DNS 8.8.8.8,dhcp-option DNS 4.4.4.4,\
    route-gateway 10.8.0.1,route 192.168.0.0 255.255.255.0 10.8.0.12,topology subnet,\
    ping 10,ping-restart 120,ifconfig 10.8.0.2 255.255.255.0,peer-id 0";

const NET30_REPLY: &str = "PUSH_REPLY,dhcp-option DNS 8.8.8.8,comp-lzo no,route 10.8.0.1,\
    topology net30,ping 10,ping-restart 120,ifconfig 10.8.0.6 10.8.0.5,peer-id 0,\
    cipher AES-256-GCM";

#[test]
fn test_ifconfig_address_and_mask() {
    let reply = PushReply::parse(SUBNET_REPLY).unwrap();
    let v4 = reply.options.ipv4.as_ref().unwrap();
    assert_eq!(v4.subnet, Subnet::with_mask("10.8.0.2", "255.255.255.0").unwrap());
    assert_eq!(v4.subnet.mask().as_deref(), Some("255.255.255.0"));
    assert_eq!(
        reply.options,
        PushReply::parse(SUBNET_REPLY).unwrap().options
    );
}

#[test]
fn test_net30_ifconfig_uses_peer_as_gateway() {
    let reply = PushReply::parse(NET30_REPLY).unwrap();
    let v4 = reply.options.ipv4.as_ref().unwrap();
    assert_eq!(v4.subnet.to_string(), "10.8.0.6/32");
    assert_eq!(
        v4.included_routes,
        vec![Route::default_with_gateway("10.8.0.5".parse().unwrap())]
    );
    assert_eq!(reply.options.cipher, Some(Cipher::Aes256Gcm));
    assert_eq!(
        reply.options.compression_framing,
        Some(CompressionFraming::CompLzo)
    );
    assert_eq!(
        reply.options.compression_algorithm,
        Some(CompressionAlgorithm::Disabled)
    );
}

#[test]
fn test_keep_alive_and_routes() {
    let reply = PushReply::parse(SUBNET_REPLY).unwrap();
    let o = &reply.options;
    assert_eq!(o.keep_alive_interval, Some(Duration::from_secs(10)));
    assert_eq!(o.keep_alive_timeout, Some(Duration::from_secs(120)));
    assert_eq!(o.peer_id, Some(0));
    assert_eq!(
        o.routes4.as_ref().unwrap()[0].to_string(),
        "192.168.0.0/24 via 10.8.0.12"
    );
    assert_eq!(o.dns_servers.as_ref().map(Vec::len), Some(2));
}

#[test]
fn test_auth_token_redacted_for_display() {
    let token = "AUkQf/b3nj3L+CH4RJPP0Vuq8/gpntr7uPqzjQhncig=";
    let raw = format!(
        "PUSH_REPLY,redirect-gateway def1,dhcp-option DNS 209.222.18.222,ping 10,\
         comp-lzo no,route 10.5.10.1,topology net30,ifconfig 10.5.10.6 10.5.10.5,auth-token {}",
        token
    );
    let reply = PushReply::parse(&raw).unwrap();
    assert_eq!(reply.options.auth_token.as_deref(), Some(token));
    assert!(!reply.redacted().contains(token));
    assert!(!reply.to_string().contains(token));
    assert!(!format!("{:?}", reply).contains(token));
    assert!(reply.redacted().contains("auth-token"));
}

#[test]
fn test_auth_token_redacted_in_any_spelling() {
    for directive in [
        "AUTH-TOKEN SECRETX",
        "Auth-Token SECRETX",
        "auth-token  SECRETX",
        "auth-token\tSECRETX",
        "auth-token \"SECRETX\"",
    ] {
        let raw = format!(
            "PUSH_REPLY,topology subnet,route-gateway 10.8.0.1,ifconfig 10.8.0.2 255.255.255.0,{},ping 10",
            directive
        );
        let reply = PushReply::parse(&raw).unwrap();
        assert_eq!(reply.options.auth_token.as_deref(), Some("SECRETX"), "{}", directive);
        assert!(!reply.redacted().contains("SECRETX"), "{}", directive);
        assert!(!reply.to_string().contains("SECRETX"), "{}", directive);
        assert!(!format!("{:?}", reply).contains("SECRETX"), "{}", directive);
        assert!(reply.redacted().ends_with(",ping 10"));
    }
}

#[test]
fn test_continuation_always_rejected() {
    for raw in [
        "PUSH_REPLY,push-continuation 2",
        "PUSH_REPLY,ping 10,push-continuation 2,ifconfig 10.8.0.2 255.255.255.0",
        "PUSH_REPLY,ifconfig broken,push-continuation 2",
    ] {
        let err = PushReply::parse(raw).unwrap_err();
        assert_eq!(err.kind, OpenVpnErrorKind::ContinuationPushReply, "{}", raw);
    }
}

#[test]
fn test_malformed_directive_is_named() {
    let err = PushReply::parse("PUSH_REPLY,route-gateway 10.8.0.1,ifconfig 10.8.0.2").unwrap_err();
    assert_eq!(err.kind, OpenVpnErrorKind::ParseError);
    assert!(err.to_string().contains("ifconfig"));
}

#[test]
fn test_bad_dns_address_rejected() {
    let err = PushReply::parse("PUSH_REPLY,dhcp-option DNS not-an-ip").unwrap_err();
    assert_eq!(err.kind, OpenVpnErrorKind::ParseError);
}

#[test]
fn test_nothing_recognised_is_invalid() {
    let err = PushReply::parse("PUSH_REPLY,frobnicate 1").unwrap_err();
    assert_eq!(err.kind, OpenVpnErrorKind::ParseError);
}
