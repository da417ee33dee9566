//! Header names used by the paywall. HTTP header names are case-insensitive; these are
//! the lowercase forms so they can be used as static [`http::HeaderName`]s.

/// Request header naming the payment session that pays for the request (`X-Session-Id`).
pub const SESSION_HEADER: &str = "x-session-id";

/// Optional request header carrying a client-side payment proof (`X-Payment-Proof`).
pub const PROOF_HEADER: &str = "x-payment-proof";

/// Response header echoing the session that was accepted (`X-Session-Accepted`).
pub const SESSION_ACCEPTED_HEADER: &str = "x-session-accepted";
