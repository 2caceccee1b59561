//! Redaction helpers shared by every log line in the protocol core.
//!
//! Nothing here installs a logger; callers log through the `log` facade and
//! pass packet bodies, session ids and push replies through these helpers.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// `auth-token` in any case and the rest of that directive.
    static ref AUTH_TOKEN_RE: Regex =
        Regex::new(r"(?i)\b(auth-token)\b[^,\n]*").expect("static regex");
}

/// Bytes shown in a hex preview.
const PREVIEW_LEN: usize = 16;

/// `len=N <hex…>` with at most [`PREVIEW_LEN`] bytes of hex.
pub fn hex_preview(bytes: &[u8]) -> String {
    if bytes.len() <= PREVIEW_LEN {
        format!("len={} {}", bytes.len(), hex::encode(bytes))
    } else {
        format!(
            "len={} {}…",
            bytes.len(),
            hex::encode(&bytes[..PREVIEW_LEN])
        )
    }
}

/// Session ids are not secret, log them as plain hex.
pub fn session_id_hex(sid: &[u8]) -> String {
    hex::encode(sid)
}

/// Strip the value of any `auth-token` directive from a push reply.
pub fn redact_auth_token(message: &str) -> String {
    AUTH_TOKEN_RE
        .replace_all(message, "$1")
        .into_owned()
}

/// Log a packet body at trace level, never verbatim.
pub fn trace_packet(direction: &str, what: &str, bytes: &[u8]) {
    if log::log_enabled!(log::Level::Trace) {
        log::trace!("{} {}: {}", direction, what, hex_preview(bytes));
    }
}
