//! OpenVPN protocol module root – re-exports public API surface.

pub mod types;
pub mod logging;
pub mod clock;
pub mod crypto;
pub mod xor;
pub mod link;
pub mod packet;
pub mod serializer;
pub mod control;
pub mod auth;
pub mod routing;
pub mod dns;
pub mod config;
pub mod push_reply;
pub mod network_settings;
pub mod negotiator;
pub mod session;

pub use types::*;
pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::{
    AuthResponse, ControlCipher, CryptoProvider, DataChannelParams, DataCrypto, OsPrng, Prng,
    Tls, TlsOptions,
};
pub use xor::{XorLink, XorMethod};
pub use link::{Link, MemoryLink, TcpLink, Tunnel, UdpLink};
pub use packet::{ControlPacket, Opcode};
pub use control::{ControlChannel, SessionId};
pub use serializer::{ControlChannelSerializer, PlainSerializer};
pub use auth::{Authenticator, Credentials, OtpMethod};
pub use routing::{IpSettings, Route, Subnet};
pub use dns::DhcpOption;
pub use config::{
    parse_ovpn, Configuration, ConfigurationBuilder, ConnectionOptions,
    StaticChallenge,
};
pub use push_reply::PushReply;
pub use network_settings::{DnsModule, HttpProxyModule, IpModule, ModuleSet, NetworkSettingsBuilder};
pub use negotiator::{Established, Negotiator, NegotiatorOptions, NegotiatorState};
pub use session::{
    Session, SessionCommand, SessionEvent, SessionEventKind, SessionHandle, SessionState,
};
