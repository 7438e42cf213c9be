//! Control connection sessions.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use streamd_rpc::RequestId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What an activated session may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessLevel {
    #[default]
    Full,
    /// Service queries only, no stream control
    VerifyOnly,
}

impl AccessLevel {
    /// Access requested in `activate` params; `"verify"` limits the session.
    #[must_use]
    pub fn from_request(access: Option<&str>) -> Self {
        match access {
            Some(a) if a.eq_ignore_ascii_case("verify") => AccessLevel::VerifyOnly,
            _ => AccessLevel::Full,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub verified: bool,
    /// License expiry in ms since the Unix epoch, 0 until activated
    pub expiration: i64,
    pub access: AccessLevel,
    /// Requests this daemon sent to the client, by id, with their method
    pub pending: HashMap<RequestId, String>,
}

impl ClientSession {
    #[must_use]
    pub fn new(id: SessionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            verified: false,
            expiration: 0,
            access: AccessLevel::default(),
            pending: HashMap::new(),
        }
    }

    pub fn activate(&mut self, expiration: i64, access: AccessLevel) {
        self.verified = true;
        self.expiration = expiration;
        self.access = access;
    }

    #[must_use]
    pub fn is_loopback(&self) -> bool {
        self.peer.ip().is_loopback()
    }

    #[must_use]
    pub fn has_full_access(&self) -> bool {
        self.verified && self.access == AccessLevel::Full
    }

    /// Number of pending requests sent with `method`.
    #[must_use]
    pub fn unanswered(&self, method: &str) -> usize {
        self.pending.values().filter(|m| m.as_str() == method).count()
    }

    /// Remove a pending request by id, returning the method it was sent with.
    pub fn take_pending(&mut self, id: &RequestId) -> Option<String> {
        self.pending.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn test_session_id_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_new_session_unverified() {
        let session = ClientSession::new(SessionId::new(), peer("10.0.0.2:5000"));
        assert!(!session.verified);
        assert!(!session.has_full_access());
        assert!(!session.is_loopback());
    }

    #[test]
    fn test_activate_full() {
        let mut session = ClientSession::new(SessionId::new(), peer("127.0.0.1:5000"));
        session.activate(42, AccessLevel::Full);
        assert!(session.verified);
        assert_eq!(session.expiration, 42);
        assert!(session.has_full_access());
        assert!(session.is_loopback());
    }

    #[test]
    fn test_activate_verify_only() {
        let mut session = ClientSession::new(SessionId::new(), peer("[::1]:5000"));
        session.activate(42, AccessLevel::from_request(Some("verify")));
        assert!(session.verified);
        assert!(!session.has_full_access());
        assert!(session.is_loopback());
    }

    #[test]
    fn test_access_from_request() {
        assert_eq!(AccessLevel::from_request(None), AccessLevel::Full);
        assert_eq!(AccessLevel::from_request(Some("full")), AccessLevel::Full);
        assert_eq!(
            AccessLevel::from_request(Some("VERIFY")),
            AccessLevel::VerifyOnly
        );
    }

    #[test]
    fn test_pending_requests() {
        let mut session = ClientSession::new(SessionId::new(), peer("127.0.0.1:1"));
        session
            .pending
            .insert(RequestId::Number(7), "ping_client".to_string());
        assert_eq!(
            session.take_pending(&RequestId::Number(7)).as_deref(),
            Some("ping_client")
        );
        assert!(session.take_pending(&RequestId::Number(7)).is_none());
    }

    #[test]
    fn test_unanswered_counts_by_method() {
        let mut session = ClientSession::new(SessionId::new(), peer("127.0.0.1:1"));
        session
            .pending
            .insert(RequestId::Number(1), "ping_client".to_string());
        session
            .pending
            .insert(RequestId::Number(2), "ping_client".to_string());
        session.pending.insert(RequestId::Number(3), "other".to_string());
        assert_eq!(session.unanswered("ping_client"), 2);
        assert_eq!(session.unanswered("missing"), 0);
    }
}
