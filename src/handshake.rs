//! # Handshake
//!
//! The opening handshake of [RFC 6455 Section 4](https://datatracker.ietf.org/doc/html/rfc6455#section-4).
//!
//! The server side decides whether a request may be upgraded ([`evaluate`]) and derives the
//! `Sec-WebSocket-Accept` value from the client's key ([`accept_key`]). The client side generates a key
//! and checks the server's answer against it.
//!
//! ```rust
//! use wsgate::handshake::accept_key;
//!
//! assert_eq!(
//!     accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
//!     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
//! );
//! ```
use http::{header, HeaderMap, HeaderName, Response, StatusCode, Version};
use sha1::{Digest, Sha1};

use crate::{ResponseState, Result, WebSocketError};

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this crate speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Why an exchange cannot be upgraded to a WebSocket.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpgradeRefusal {
    /// The request does not ask for `Upgrade: websocket` with `Connection: upgrade` over HTTP/1.1.
    NotUpgradeRequest,
    /// `Sec-WebSocket-Key` is absent.
    MissingKey,
    /// `Sec-WebSocket-Version` is absent or not 13.
    MissingVersion,
    /// Response bytes were already committed, or the exchange was already upgraded.
    AlreadyCommitted,
}

impl From<UpgradeRefusal> for WebSocketError {
    fn from(refusal: UpgradeRefusal) -> Self {
        match refusal {
            UpgradeRefusal::NotUpgradeRequest => WebSocketError::NotUpgradeRequest,
            UpgradeRefusal::MissingKey => WebSocketError::MissingSecWebSocketKey,
            UpgradeRefusal::MissingVersion => WebSocketError::InvalidSecWebsocketVersion,
            UpgradeRefusal::AlreadyCommitted => WebSocketError::AlreadyCommitted,
        }
    }
}

/// Outcome of an upgrade eligibility check.
///
/// `reason` is `None` exactly when `eligible` is `true`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UpgradeDecision {
    pub eligible: bool,
    pub reason: Option<UpgradeRefusal>,
}

impl UpgradeDecision {
    fn accept() -> Self {
        Self {
            eligible: true,
            reason: None,
        }
    }

    fn refuse(reason: UpgradeRefusal) -> Self {
        Self {
            eligible: false,
            reason: Some(reason),
        }
    }

    /// Converts the decision into a `Result`, mapping the refusal to its error.
    pub fn into_result(self) -> Result<()> {
        match self.reason {
            None => Ok(()),
            Some(reason) => Err(reason.into()),
        }
    }
}

/// Computes the `Sec-WebSocket-Accept` value for a client key:
/// `base64(sha1(key ++ GUID))`.
pub fn accept_key(key: &[u8]) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Generates a random `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    use base64::prelude::*;
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Returns `true` if any instance of header `name` lists `token` among its comma-separated values,
/// ignoring ASCII case and surrounding whitespace.
pub fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Returns `true` if the request asks to switch protocols, whatever the target protocol.
///
/// This only looks at the request: HTTP/1.1 or later, a `Connection` header with the `upgrade` token
/// and a non-empty `Upgrade` header.
pub fn is_upgrade_request(version: Version, headers: &HeaderMap) -> bool {
    version >= Version::HTTP_11
        && header_has_token(headers, header::CONNECTION, "upgrade")
        && headers
            .get_all(header::UPGRADE)
            .iter()
            .any(|value| !value.as_bytes().iter().all(u8::is_ascii_whitespace))
}

/// Decides whether an exchange can be upgraded to a WebSocket.
///
/// The response state is checked before anything else, so an exchange that already wrote response
/// bytes is refused with [`UpgradeRefusal::AlreadyCommitted`] no matter what the request looks like.
pub fn evaluate(version: Version, headers: &HeaderMap, state: ResponseState) -> UpgradeDecision {
    if state != ResponseState::Pending {
        return UpgradeDecision::refuse(UpgradeRefusal::AlreadyCommitted);
    }

    if version < Version::HTTP_11
        || !header_has_token(headers, header::UPGRADE, "websocket")
        || !header_has_token(headers, header::CONNECTION, "upgrade")
    {
        return UpgradeDecision::refuse(UpgradeRefusal::NotUpgradeRequest);
    }

    if !headers.contains_key(header::SEC_WEBSOCKET_KEY) {
        return UpgradeDecision::refuse(UpgradeRefusal::MissingKey);
    }

    let version_ok = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.trim() == WEBSOCKET_VERSION)
        .unwrap_or(false);
    if !version_ok {
        return UpgradeDecision::refuse(UpgradeRefusal::MissingVersion);
    }

    UpgradeDecision::accept()
}

/// Checks a server's handshake response against the key the client sent.
pub(crate) fn verify<B>(response: &Response<B>, key: &str) -> Result<()> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(WebSocketError::InvalidStatusCode(
            response.status().as_u16(),
        ));
    }

    let headers = response.headers();

    if !header_has_token(headers, header::UPGRADE, "websocket") {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !header_has_token(headers, header::CONNECTION, "upgrade") {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    let expected = accept_key(key.as_bytes());
    if !headers
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .map(|h| h.as_bytes() == expected.as_bytes())
        .unwrap_or(false)
    {
        return Err(WebSocketError::InvalidSecWebSocketAccept);
    }

    Ok(())
}
