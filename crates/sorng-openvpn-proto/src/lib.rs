//! # sorng-openvpn-proto
//!
//! OpenVPN client protocol core: everything between the raw transport and the
//! installed tunnel settings.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **types** | Shared enums, pull mask, routing policy, error taxonomy |
//! | **logging** | Redaction helpers for bytes and secrets in log lines |
//! | **clock** | Injectable monotonic clock (system / manual) |
//! | **crypto** | External TLS, data-channel and control-wrap capabilities |
//! | **xor** | XOR obfuscation of outbound/inbound datagrams |
//! | **link** | Link/tunnel traits, TCP framing, tokio UDP/TCP links |
//! | **packet** | Control packet codec, opcodes, OCC / ping constants |
//! | **serializer** | Plain, tls-auth and tls-crypt control serializers |
//! | **control** | Reliable control channel – ids, acks, retransmission, reordering |
//! | **auth** | Credentials and the key-method 2 auth exchange |
//! | **routing** | Subnets, routes, IP settings, mask helpers |
//! | **dns** | `dhcp-option` parsing |
//! | **config** | `Configuration`, connection timing, option grammar |
//! | **push_reply** | `PUSH_REPLY` parsing and redaction |
//! | **network_settings** | Local/remote merge into IP / DNS / proxy modules |
//! | **negotiator** | TLS → auth → push state machine, renegotiation |
//! | **session** | Session orchestrator and its spawned task handle |

pub mod openvpn;
