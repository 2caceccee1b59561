//! `PUSH_REPLY` parsing.

use crate::openvpn::config::{parse_push_options, Configuration};
use crate::openvpn::logging::redact_auth_token;
use crate::openvpn::types::*;
use std::fmt;

/// Settings pushed by the server, with the raw message kept for display.
#[derive(Clone, PartialEq, Eq)]
pub struct PushReply {
    raw: String,
    pub options: Configuration,
}

impl PushReply {
    pub const PREFIX: &'static str = "PUSH_REPLY,";

    pub fn is_push_reply(message: &str) -> bool {
        message.starts_with(Self::PREFIX)
    }

    pub fn parse(message: &str) -> Result<Self, OpenVpnError> {
        let rest = message.strip_prefix(Self::PREFIX).ok_or_else(|| {
            OpenVpnError::parse("not a PUSH_REPLY").with_detail(redact_auth_token(
                message.split(',').next().unwrap_or_default(),
            ))
        })?;

        // Reject continuations before any directive is interpreted.
        if rest
            .split(',')
            .any(|token| token.split_whitespace().collect::<Vec<_>>() == ["push-continuation", "2"])
        {
            return Err(OpenVpnError::new(
                OpenVpnErrorKind::ContinuationPushReply,
                "multi-part PUSH_REPLY is not supported",
            ));
        }

        let options = parse_push_options(rest.split(','))?;
        Ok(Self {
            raw: message.to_string(),
            options,
        })
    }

    /// The received text with the auth-token value removed.
    pub fn redacted(&self) -> String {
        redact_auth_token(&self.raw)
    }
}

impl fmt::Display for PushReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for PushReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushReply")
            .field("raw", &self.redacted())
            .finish_non_exhaustive()
    }
}
