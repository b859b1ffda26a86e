//! First-bytes tunnel token
//!
//! When the publisher dials back into a public port it writes this token as
//! the very first bytes on the wire, before any application data flows. The
//! broker peeks the first chunk of every accepted connection and tries to
//! parse it as a token.
//!
//! Parsing success alone never classifies a connection as publisher-origin: a
//! public client is free to send bytes that happen to look like a token. The
//! remote address check against the registered publisher address is the trust
//! boundary; this type only deals with the shape.

use serde::{Deserialize, Serialize};

/// Session-identifying token replayed by the publisher on dial-back
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelToken {
    pub tunnel_id: String,
    pub service_id: String,
}

impl TunnelToken {
    pub fn new(tunnel_id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            service_id: service_id.into(),
        }
    }

    /// Try to parse a peeked byte buffer as a token.
    ///
    /// Returns `None` for anything that is not exactly a JSON object carrying
    /// `tunnelId` and `serviceId`; such buffers are ordinary client payload
    /// and must be forwarded verbatim.
    pub fn parse(peeked: &[u8]) -> Option<Self> {
        if peeked.first() != Some(&b'{') {
            return None;
        }
        serde_json::from_slice(peeked).ok()
    }

    /// Wire form written as the first bytes of a dial-back connection
    pub fn to_wire(&self) -> Vec<u8> {
        // Token shape is infallible to serialize
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_token() {
        let token = TunnelToken::new("tun-1", "svc-1");
        let wire = token.to_wire();
        assert_eq!(TunnelToken::parse(&wire), Some(token));
    }

    #[test]
    fn test_parse_rejects_plain_payload() {
        assert_eq!(TunnelToken::parse(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(TunnelToken::parse(b""), None);
    }

    #[test]
    fn test_parse_rejects_json_without_token_fields() {
        assert_eq!(TunnelToken::parse(br#"{"hello":"world"}"#), None);
        assert_eq!(TunnelToken::parse(br#"{"tunnelId":"only-half"}"#), None);
    }

    #[test]
    fn test_parse_rejects_truncated_json() {
        assert_eq!(TunnelToken::parse(br#"{"tunnelId":"tun","ser"#), None);
    }

    #[test]
    fn test_parse_tolerates_extra_fields() {
        let parsed = TunnelToken::parse(
            br#"{"tunnelId":"tun-1","serviceId":"svc-1","identity":"pub-1","publicPort":9000}"#,
        );
        assert_eq!(parsed, Some(TunnelToken::new("tun-1", "svc-1")));
    }
}
