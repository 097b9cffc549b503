//! Session storage seam.
//!
//! The multiplexer reads sessions from, and records linked sessions and
//! received requests in, a [`SessionRepository`]. How sessions are persisted
//! is up to the host; [`InMemorySessionRepository`] keeps everything in
//! process.

// Rust guideline compliant 2026-02

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::WalletLinkError;
use crate::models::{HostRequest, HostRequestId, RelayUrl, Session};

/// Storage for sessions and the requests received on them.
#[async_trait]
pub trait SessionRepository: Send + Sync + std::fmt::Debug {
    /// Every stored session.
    async fn sessions(&self) -> Vec<Session>;

    /// Watch the session list. The receiver always holds the latest list.
    fn observe_sessions(&self) -> watch::Receiver<Vec<Session>>;

    /// Look up one session.
    async fn get_session(&self, session_id: &str, url: &RelayUrl) -> Option<Session>;

    /// Insert or replace a session.
    async fn save(&self, session: Session) -> Result<(), WalletLinkError>;

    /// Remove a session and its requests.
    async fn delete(&self, session_id: &str, url: &RelayUrl) -> Result<(), WalletLinkError>;

    /// Record a request delivered on a stored session.
    async fn add_pending_request(&self, request: HostRequest) -> Result<(), WalletLinkError>;

    /// Requests on a session that have not been marked as seen.
    async fn pending_requests(&self, session_id: &str, url: &RelayUrl) -> Vec<HostRequest>;

    /// Look up a recorded request, seen or not.
    async fn get_request(&self, id: &HostRequestId) -> Option<HostRequest>;

    /// Mark a request as seen.
    async fn mark_as_seen(&self, id: &HostRequestId) -> Result<(), WalletLinkError>;
}

type SessionKey = (RelayUrl, String);

#[derive(Debug, Default)]
struct RepositoryState {
    sessions: BTreeMap<SessionKey, Session>,
    requests: BTreeMap<SessionKey, Vec<HostRequest>>,
    seen: HashSet<HostRequestId>,
}

/// [`SessionRepository`] held in memory.
#[derive(Debug)]
pub struct InMemorySessionRepository {
    state: RwLock<RepositoryState>,
    sessions_tx: watch::Sender<Vec<Session>>,
    fail_writes: AtomicBool,
}

impl Default for InMemorySessionRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySessionRepository {
    /// Empty repository.
    #[must_use]
    pub fn new() -> Self {
        let (sessions_tx, _) = watch::channel(Vec::new());
        Self {
            state: RwLock::new(RepositoryState::default()),
            sessions_tx,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Repository pre-filled with `sessions`.
    #[must_use]
    pub fn with_sessions(sessions: impl IntoIterator<Item = Session>) -> Self {
        let repo = Self::new();
        if let Ok(mut state) = repo.state.write() {
            for session in sessions {
                state
                    .sessions
                    .insert((session.url.clone(), session.id.clone()), session);
            }
            repo.sessions_tx
                .send_replace(state.sessions.values().cloned().collect());
        }
        repo
    }

    /// Make every later write fail with [`WalletLinkError::Repository`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), WalletLinkError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(WalletLinkError::Repository("writes disabled".to_string()));
        }
        Ok(())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, RepositoryState>, WalletLinkError> {
        self.check_writable()?;
        self.state
            .write()
            .map_err(|e| WalletLinkError::Repository(e.to_string()))
    }

    fn publish(&self, state: &RepositoryState) {
        self.sessions_tx
            .send_replace(state.sessions.values().cloned().collect());
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn sessions(&self) -> Vec<Session> {
        self.state
            .read()
            .map(|state| state.sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    fn observe_sessions(&self) -> watch::Receiver<Vec<Session>> {
        self.sessions_tx.subscribe()
    }

    async fn get_session(&self, session_id: &str, url: &RelayUrl) -> Option<Session> {
        let state = self.state.read().ok()?;
        state
            .sessions
            .get(&(url.clone(), session_id.to_string()))
            .cloned()
    }

    async fn save(&self, session: Session) -> Result<(), WalletLinkError> {
        let mut state = self.write()?;
        state
            .sessions
            .insert((session.url.clone(), session.id.clone()), session);
        self.publish(&state);
        Ok(())
    }

    async fn delete(&self, session_id: &str, url: &RelayUrl) -> Result<(), WalletLinkError> {
        let mut state = self.write()?;
        let key = (url.clone(), session_id.to_string());
        if state.sessions.remove(&key).is_none() {
            return Err(WalletLinkError::SessionNotFound);
        }
        if let Some(requests) = state.requests.remove(&key) {
            for request in requests {
                state.seen.remove(&request.id);
            }
        }
        self.publish(&state);
        Ok(())
    }

    async fn add_pending_request(&self, request: HostRequest) -> Result<(), WalletLinkError> {
        let mut state = self.write()?;
        let key = (request.id.url.clone(), request.id.session_id.clone());
        if !state.sessions.contains_key(&key) {
            return Err(WalletLinkError::SessionNotFound);
        }
        let requests = state.requests.entry(key).or_default();
        if !requests.iter().any(|r| r.id == request.id) {
            requests.push(request);
        }
        Ok(())
    }

    async fn pending_requests(&self, session_id: &str, url: &RelayUrl) -> Vec<HostRequest> {
        let Ok(state) = self.state.read() else {
            return Vec::new();
        };
        state
            .requests
            .get(&(url.clone(), session_id.to_string()))
            .map(|requests| {
                requests
                    .iter()
                    .filter(|r| !state.seen.contains(&r.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn get_request(&self, id: &HostRequestId) -> Option<HostRequest> {
        let state = self.state.read().ok()?;
        state
            .requests
            .get(&(id.url.clone(), id.session_id.clone()))?
            .iter()
            .find(|r| r.id == *id)
            .cloned()
    }

    async fn mark_as_seen(&self, id: &HostRequestId) -> Result<(), WalletLinkError> {
        let mut state = self.write()?;
        let known = state
            .requests
            .get(&(id.url.clone(), id.session_id.clone()))
            .is_some_and(|requests| requests.iter().any(|r| r.id == *id));
        if !known {
            return Err(WalletLinkError::EventNotFound);
        }
        state.seen.insert(id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "wss://relay.test/rpc";

    fn request(event_id: &str, session_id: &str) -> HostRequest {
        HostRequest {
            id: HostRequestId::new(event_id, session_id, URL),
            method: "signEthereumMessage".into(),
            decrypted_payload: serde_json::json!({"id": event_id}),
            received_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_get_delete() {
        let repo = InMemorySessionRepository::new();
        let url = RelayUrl::from(URL);
        repo.save(Session::new("s1", "abc", URL, "u1")).await.unwrap();

        assert_eq!(repo.get_session("s1", &url).await.unwrap().user_id, "u1");
        assert!(repo.get_session("s1", &RelayUrl::from("wss://other.test")).await.is_none());

        repo.delete("s1", &url).await.unwrap();
        assert!(repo.sessions().await.is_empty());
        assert_eq!(repo.delete("s1", &url).await, Err(WalletLinkError::SessionNotFound));
    }

    #[tokio::test]
    async fn test_observers_see_changes() {
        let repo = InMemorySessionRepository::new();
        let mut rx = repo.observe_sessions();
        assert!(rx.borrow().is_empty());

        repo.save(Session::new("s1", "abc", URL, "u1")).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_requests_and_seen_marks() {
        let repo = InMemorySessionRepository::with_sessions([Session::new("s1", "abc", URL, "u1")]);
        let url = RelayUrl::from(URL);

        repo.add_pending_request(request("e1", "s1")).await.unwrap();
        repo.add_pending_request(request("e2", "s1")).await.unwrap();
        repo.add_pending_request(request("e1", "s1")).await.unwrap();
        assert_eq!(repo.pending_requests("s1", &url).await.len(), 2);

        let seen = HostRequestId::new("e1", "s1", URL);
        repo.mark_as_seen(&seen).await.unwrap();
        let pending = repo.pending_requests("s1", &url).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id.event_id, "e2");

        // Seen requests can still be looked up.
        assert!(repo.get_request(&seen).await.is_some());
        assert_eq!(
            repo.mark_as_seen(&HostRequestId::new("nope", "s1", URL)).await,
            Err(WalletLinkError::EventNotFound)
        );
    }

    #[tokio::test]
    async fn test_request_for_unknown_session_is_rejected() {
        let repo = InMemorySessionRepository::new();
        assert_eq!(
            repo.add_pending_request(request("e1", "ghost")).await,
            Err(WalletLinkError::SessionNotFound)
        );
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let repo = InMemorySessionRepository::new();
        repo.set_fail_writes(true);
        assert!(matches!(
            repo.save(Session::new("s1", "abc", URL, "u1")).await,
            Err(WalletLinkError::Repository(_))
        ));
        repo.set_fail_writes(false);
        repo.save(Session::new("s1", "abc", URL, "u1")).await.unwrap();
    }
}
