//! Registry of live, killable calls.
//!
//! A call enters the bank when it gets its first kill listener and leaves
//! on its terminal outcome. The bank is what lets one connection kill or
//! watch a call started by another, including a background call whose
//! issuing connection is gone.
//!
//! Ids are client-chosen, so they are only unique within a [`Scope`]: the
//! owning user, or the issuing session for anonymous callers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::Call;
use crate::connection::Conn;
use crate::error::CallError;

/// Namespace a call id is unique within.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    User(String),
    /// An anonymous connection, by session id.
    Session(String),
}

impl Scope {
    pub fn user(username: impl Into<String>) -> Self {
        Scope::User(username.into())
    }

    /// The scope calls issued on `conn` are filed under.
    pub fn of(conn: &Conn) -> Self {
        match conn.identity() {
            Some(user) => Scope::User(user.username().to_string()),
            None => Scope::Session(conn.session_id().to_string()),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::User(name) => write!(f, "user {name}"),
            Scope::Session(id) => write!(f, "session {id}"),
        }
    }
}

type Key = (Scope, i32);

#[derive(Default)]
struct BankInner {
    by_key: HashMap<Key, Arc<Call>>,
    /// username -> ids, in registration order
    by_user: HashMap<String, Vec<i32>>,
}

impl BankInner {
    fn forget_user_entry(&mut self, call: &Call) {
        let Some(username) = call.owner() else {
            return;
        };
        if let Some(ids) = self.by_user.get_mut(username) {
            ids.retain(|id| *id != call.id());
            if ids.is_empty() {
                self.by_user.remove(username);
            }
        }
    }
}

/// Live calls by scoped id and by owning user, behind one lock.
///
/// No method calls into a [`Call`] while the lock is held beyond reading
/// its immutable fields.
#[derive(Default)]
pub struct Bank {
    inner: RwLock<BankInner>,
}

impl Bank {
    pub fn new() -> Self {
        Self::default()
    }

    /// File `call` under its scope and id. A different live call already
    /// holding that id is left alone and the registration is refused.
    pub fn register(&self, call: Arc<Call>) -> Result<(), CallError> {
        let id = call.id();
        let key = (call.scope().clone(), id);
        {
            let mut inner = self.inner.write();
            if let Some(current) = inner.by_key.get(&key) {
                if current.serial() == call.serial() {
                    return Ok(());
                }
                tracing::warn!(call_id = id, scope = %key.0, "call id already in use");
                return Err(CallError::IdInUse(id));
            }
            if let Some(username) = call.owner() {
                inner.by_user.entry(username.to_string()).or_default().push(id);
            }
            inner.by_key.insert(key, call.clone());
        }
        tracing::trace!(call_id = id, owner = ?call.owner(), "registered in bank");
        Ok(())
    }

    /// Remove whatever call is registered under `id` in `scope`.
    pub fn unregister(&self, scope: &Scope, id: i32) -> Option<Arc<Call>> {
        let mut inner = self.inner.write();
        let call = inner.by_key.remove(&(scope.clone(), id))?;
        inner.forget_user_entry(&call);
        Some(call)
    }

    /// Remove `call` only if it is the one registered under its id.
    pub fn unregister_call(&self, call: &Call) -> bool {
        let key = (call.scope().clone(), call.id());
        let mut inner = self.inner.write();
        match inner.by_key.get(&key) {
            Some(current) if current.serial() == call.serial() => {
                inner.by_key.remove(&key);
                inner.forget_user_entry(call);
                true
            }
            _ => false,
        }
    }

    /// A miss means the call already settled (or never became killable).
    pub fn get(&self, scope: &Scope, id: i32) -> Option<Arc<Call>> {
        self.inner.read().by_key.get(&(scope.clone(), id)).cloned()
    }

    pub fn contains(&self, scope: &Scope, id: i32) -> bool {
        self.inner.read().by_key.contains_key(&(scope.clone(), id))
    }

    pub fn list_by_user(&self, username: &str) -> Result<Vec<Arc<Call>>, CallError> {
        let inner = self.inner.read();
        let ids = inner
            .by_user
            .get(username)
            .ok_or_else(|| CallError::NoSuchUser(username.to_string()))?;
        let scope = Scope::user(username);
        Ok(ids
            .iter()
            .filter_map(|id| inner.by_key.get(&(scope.clone(), *id)).cloned())
            .collect())
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallRequest;
    use crate::connection::{LocalConnection, User};
    use std::sync::Weak;

    fn call_for(bank: &Arc<Bank>, id: i32, user: Option<&str>) -> Arc<Call> {
        let (conn, _rx) = LocalConnection::new(format!("s{id}"), user.map(User::new));
        let conn: Conn = conn;
        Call::new(CallRequest::new(id, "Tree.$t.Op"), conn, bank.clone(), Weak::new())
    }

    #[test]
    fn register_indexes_by_id_and_user() {
        let bank = Arc::new(Bank::new());
        let a = call_for(&bank, 1, Some("alice"));
        let b = call_for(&bank, 2, Some("alice"));
        let anon = call_for(&bank, 3, None);
        bank.register(a).unwrap();
        bank.register(b).unwrap();
        bank.register(anon).unwrap();

        assert_eq!(bank.len(), 3);
        let ids: Vec<i32> = bank
            .list_by_user("alice")
            .unwrap()
            .iter()
            .map(|c| c.id())
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(bank.get(&Scope::Session("s3".into()), 3).is_some());
        assert!(bank.get(&Scope::user("alice"), 3).is_none());
    }

    #[test]
    fn unregister_drops_empty_bucket() {
        let bank = Arc::new(Bank::new());
        let alice = Scope::user("alice");
        bank.register(call_for(&bank, 1, Some("alice"))).unwrap();
        bank.register(call_for(&bank, 2, Some("alice"))).unwrap();

        assert!(bank.unregister(&alice, 1).is_some());
        assert_eq!(bank.list_by_user("alice").unwrap().len(), 1);
        assert!(bank.unregister(&alice, 2).is_some());
        assert_eq!(
            bank.list_by_user("alice").unwrap_err(),
            CallError::NoSuchUser("alice".into())
        );
        assert!(bank.unregister(&alice, 2).is_none());
        assert!(bank.is_empty());
    }

    #[test]
    fn same_id_from_different_users_coexists() {
        let bank = Arc::new(Bank::new());
        let alice = call_for(&bank, 1, Some("alice"));
        let bob = call_for(&bank, 1, Some("bob"));
        bank.register(alice.clone()).unwrap();
        bank.register(bob.clone()).unwrap();

        assert_eq!(bank.len(), 2);
        assert_eq!(bank.list_by_user("alice").unwrap()[0].serial(), alice.serial());
        assert_eq!(bank.get(&Scope::user("bob"), 1).unwrap().serial(), bob.serial());

        assert!(bank.unregister_call(&bob));
        assert!(bank.contains(&Scope::user("alice"), 1));
    }

    #[test]
    fn live_collision_in_one_scope_is_refused() {
        let bank = Arc::new(Bank::new());
        let first = call_for(&bank, 5, Some("alice"));
        let second = call_for(&bank, 5, Some("alice"));
        bank.register(first.clone()).unwrap();
        assert_eq!(bank.register(first.clone()), Ok(()));
        assert_eq!(bank.register(second.clone()), Err(CallError::IdInUse(5)));

        assert!(!bank.unregister_call(&second));
        assert_eq!(bank.get(&Scope::user("alice"), 5).unwrap().serial(), first.serial());
        assert_eq!(bank.list_by_user("alice").unwrap().len(), 1);
    }
}
