//! In-process engine with a fixed user table.
//!
//! Sessions are plain records in a map. A session is killed by flagging its
//! record; the owning connection notices through its [`SessionProbe`].

use super::{DataContext, Engine, EngineError, NetworkSettings, SessionProbe};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tracing::debug;

/// Grants the front-end expects its internal account to hold.
pub const DEFAULT_ACCOUNT_GRANTS: &str = "GRANT SELECT, SUPER ON *.* TO";

/// Account entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub name: String,
    pub password: String,
    /// May kill sessions of other users
    pub privileged: bool,
}

impl LocalUser {
    #[must_use]
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self { name: name.into(), password: password.into(), privileged: false }
    }

    #[must_use]
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

#[derive(Debug)]
struct SessionRecord {
    id: u64,
    user: String,
    killed: AtomicBool,
}

impl SessionProbe for SessionRecord {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Shared {
    users: DashMap<String, LocalUser>,
    sessions: DashMap<u64, Arc<SessionRecord>>,
    grants: DashMap<String, Vec<String>>,
    next_session_id: AtomicU64,
    ready: AtomicBool,
    terminating: AtomicBool,
    settings: RwLock<NetworkSettings>,
}

/// Engine backed by in-memory maps. Clones share state.
#[derive(Debug, Clone)]
pub struct LocalEngine {
    shared: Arc<Shared>,
}

impl LocalEngine {
    /// Ready engine with no users.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                users: DashMap::new(),
                sessions: DashMap::new(),
                grants: DashMap::new(),
                next_session_id: AtomicU64::new(1),
                ready: AtomicBool::new(true),
                terminating: AtomicBool::new(false),
                settings: RwLock::new(NetworkSettings::default()),
            }),
        }
    }

    /// Add or replace a user.
    #[must_use]
    pub fn with_user(self, user: LocalUser) -> Self {
        self.shared.users.insert(user.name.clone(), user);
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.shared.ready.store(ready, Ordering::SeqCst);
    }

    /// Simulate a host shutdown.
    pub fn set_terminating(&self, terminating: bool) {
        self.shared.terminating.store(terminating, Ordering::SeqCst);
    }

    pub fn set_network_settings(&self, settings: NetworkSettings) {
        *self.shared.settings.write() = settings;
    }

    /// Replace the grant list of `account`.
    pub fn set_grants(&self, account: &str, grants: Vec<String>) {
        self.shared.grants.insert(account.to_string(), grants);
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for LocalEngine {
    fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    fn is_terminating(&self) -> bool {
        self.shared.terminating.load(Ordering::SeqCst)
    }

    fn network_settings(&self) -> Result<NetworkSettings, EngineError> {
        if !self.is_ready() {
            return Err(EngineError::NotReady);
        }
        Ok(self.shared.settings.read().clone())
    }

    fn show_grants(&self, account: &str) -> Result<Vec<String>, EngineError> {
        Ok(self.shared.grants.get(account).map_or_else(
            || vec![format!("{DEFAULT_ACCOUNT_GRANTS} {account}")],
            |grants| grants.clone(),
        ))
    }

    fn apply_default_grants(&self, account: &str) -> Result<(), EngineError> {
        self.set_grants(account, vec![format!("{DEFAULT_ACCOUNT_GRANTS} {account}")]);
        Ok(())
    }

    fn open_session(
        &self,
        user: &str,
        credential: &str,
    ) -> Result<Box<dyn DataContext>, EngineError> {
        if !self.is_ready() {
            return Err(EngineError::NotReady);
        }

        let account = match self.shared.users.get(user) {
            Some(entry) if entry.password == credential => entry.clone(),
            _ => return Err(EngineError::AccessDenied(user.to_string())),
        };

        let id = self.shared.next_session_id.fetch_add(1, Ordering::SeqCst);
        let record =
            Arc::new(SessionRecord { id, user: account.name.clone(), killed: AtomicBool::new(false) });
        self.shared.sessions.insert(id, Arc::clone(&record));
        debug!(session_id = id, user, "Opened engine session");

        Ok(Box::new(LocalContext { record, account, shared: Arc::clone(&self.shared) }))
    }
}

struct LocalContext {
    record: Arc<SessionRecord>,
    account: LocalUser,
    shared: Arc<Shared>,
}

impl DataContext for LocalContext {
    fn session_id(&self) -> u64 {
        self.record.id
    }

    fn user(&self) -> &str {
        &self.account.name
    }

    fn probe(&self) -> Arc<dyn SessionProbe> {
        Arc::clone(&self.record) as Arc<dyn SessionProbe>
    }

    fn execute_kill_session(&mut self, session_id: u64) -> Result<(), EngineError> {
        let target = self
            .shared
            .sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::UnknownSession(session_id))?;

        if !self.account.privileged && target.user != self.account.name {
            return Err(EngineError::KillDenied(session_id));
        }

        target.killed.store(true, Ordering::SeqCst);
        debug!(session_id, by = %self.account.name, "Engine session killed");
        Ok(())
    }
}

impl Drop for LocalContext {
    fn drop(&mut self) {
        self.shared.sessions.remove(&self.record.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> LocalEngine {
        LocalEngine::new()
            .with_user(LocalUser::new("alice", "a"))
            .with_user(LocalUser::new("bob", "b"))
            .with_user(LocalUser::new("root", "r").privileged())
    }

    #[test]
    fn test_open_session_checks_credentials() {
        let engine = engine();
        assert!(engine.open_session("alice", "a").is_ok());
        assert!(matches!(engine.open_session("alice", "x"), Err(EngineError::AccessDenied(_))));
        assert!(matches!(engine.open_session("nobody", ""), Err(EngineError::AccessDenied(_))));
    }

    #[test]
    fn test_kill_permissions() {
        let engine = engine();
        let mut alice = engine.open_session("alice", "a").unwrap();
        let bob = engine.open_session("bob", "b").unwrap();
        let mut root = engine.open_session("root", "r").unwrap();

        assert_eq!(
            alice.execute_kill_session(bob.session_id()),
            Err(EngineError::KillDenied(bob.session_id()))
        );
        assert!(!bob.probe().is_killed());

        root.execute_kill_session(bob.session_id()).unwrap();
        assert!(bob.probe().is_killed());
    }

    #[test]
    fn test_sessions_removed_on_drop() {
        let engine = engine();
        let session = engine.open_session("alice", "a").unwrap();
        assert_eq!(engine.session_count(), 1);
        drop(session);
        assert_eq!(engine.session_count(), 0);
    }

    #[test]
    fn test_not_ready_refuses_sessions() {
        let engine = engine();
        engine.set_ready(false);
        assert!(matches!(engine.open_session("alice", "a"), Err(EngineError::NotReady)));
        assert!(engine.network_settings().is_err());
    }
}
