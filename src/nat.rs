//! UDP session table.
//!
//! Maps the client address of a flow to the outbound packet connection
//! serving it. A companion lock registry makes the first dial of a flow
//! single-flight: the caller that creates the lock dials, everybody else
//! waits for it.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use crate::model::Error;
use crate::pkt_stream::PacketConn;

pub type SessionConn = Arc<dyn PacketConn>;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionConn>,
    locks: HashMap<String, Arc<DialLock>>,
}

#[derive(Default)]
pub struct NatTable {
    inner: Mutex<Inner>,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Result<Option<SessionConn>, Error> {
        Ok(self.inner.lock()?.sessions.get(key).cloned())
    }

    pub fn set(&self, key: &str, conn: SessionConn) -> Result<(), Error> {
        self.inner.lock()?.sessions.insert(key.to_owned(), conn);
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<Option<SessionConn>, Error> {
        Ok(self.inner.lock()?.sessions.remove(key))
    }

    /// Removes `key` only while it still maps to `conn`
    pub fn delete_if_same(&self, key: &str, conn: &SessionConn) -> Result<bool, Error> {
        let mut inner = self.inner.lock()?;
        match inner.sessions.get(key) {
            Some(cur) if Arc::ptr_eq(cur, conn) => {
                inner.sessions.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn len(&self) -> Result<usize, Error> {
        Ok(self.inner.lock()?.sessions.len())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Session for `key`, or else the dial lock under `lock_key`.
    ///
    /// Both checks happen under one critical section, so a caller either
    /// sees the established session or joins the dial in progress.
    pub fn lookup_or_lock(&self, key: &str, lock_key: &str) -> Result<SessionLookup, Error> {
        let mut inner = self.inner.lock()?;
        if let Some(conn) = inner.sessions.get(key) {
            return Ok(SessionLookup::Established(conn.clone()));
        }
        Ok(match Self::lock_entry(&mut inner, lock_key) {
            (lock, true) => SessionLookup::Dialing(lock),
            (lock, false) => SessionLookup::Vacant(lock),
        })
    }

    /// Lock registered under `lock_key`, created if absent.
    ///
    /// `loaded` is `true` when somebody else created it.
    pub fn get_or_create_lock(&self, lock_key: &str) -> Result<(Arc<DialLock>, bool), Error> {
        let mut inner = self.inner.lock()?;
        Ok(Self::lock_entry(&mut inner, lock_key))
    }

    fn lock_entry(inner: &mut Inner, lock_key: &str) -> (Arc<DialLock>, bool) {
        if let Some(lock) = inner.locks.get(lock_key) {
            return (lock.clone(), true);
        }
        let lock = Arc::new(DialLock::default());
        inner.locks.insert(lock_key.to_owned(), lock.clone());
        (lock, false)
    }

    fn delete_lock(&self, lock_key: &str) -> Result<(), Error> {
        self.inner.lock()?.locks.remove(lock_key);
        Ok(())
    }

    #[cfg(test)]
    pub fn lock_count(&self) -> usize {
        self.inner.lock().unwrap().locks.len()
    }

    /// Guard owned by the caller that won [`get_or_create_lock`](Self::get_or_create_lock)
    pub fn lock_guard(self: &Arc<Self>, lock_key: &str, lock: Arc<DialLock>) -> DialGuard {
        DialGuard {
            table: self.clone(),
            lock_key: lock_key.to_owned(),
            lock,
        }
    }
}

impl fmt::Debug for NatTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.lock() {
            Ok(inner) => f
                .debug_struct("NatTable")
                .field("sessions", &inner.sessions.len())
                .field("locks", &inner.locks.len())
                .finish(),
            Err(_) => write!(f, "NatTable(<poisoned>)"),
        }
    }
}

pub enum SessionLookup {
    Established(SessionConn),
    /// another caller is dialing, wait on the lock
    Dialing(Arc<DialLock>),
    /// the caller owns the dial
    Vacant(Arc<DialLock>),
}

/// Completion flag that late arrivals block on
#[derive(Debug, Default)]
pub struct DialLock {
    done: Mutex<bool>,
    cond: Condvar,
}

impl DialLock {
    pub fn wait(&self) -> Result<(), Error> {
        let done = self.done.lock()?;
        let _done = self.cond.wait_while(done, |done| !*done)?;
        Ok(())
    }

    pub fn complete(&self) {
        let mut done = match self.done.lock() {
            Ok(done) => done,
            Err(poisoned) => poisoned.into_inner(),
        };
        *done = true;
        self.cond.notify_all();
    }

    pub fn is_completed(&self) -> bool {
        self.done.lock().map(|done| *done).unwrap_or(true)
    }
}

/// Unregisters and completes the dial lock when dropped
pub struct DialGuard {
    table: Arc<NatTable>,
    lock_key: String,
    lock: Arc<DialLock>,
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        if let Err(err) = self.table.delete_lock(&self.lock_key) {
            log::error!("[UDP] remove dial lock {}: {}", self.lock_key, err);
        }
        self.lock.complete();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pkt_stream::test::MockPacketConn;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn sessions() {
        let table = NatTable::new();
        assert!(table.get("127.0.0.1:1000").unwrap().is_none());
        table
            .set("127.0.0.1:1000", Arc::new(MockPacketConn::default()))
            .unwrap();
        assert!(table.get("127.0.0.1:1000").unwrap().is_some());
        assert_eq!(table.len().unwrap(), 1);
        assert!(table.delete("127.0.0.1:1000").unwrap().is_some());
        assert!(table.is_empty().unwrap());
    }

    #[test]
    fn delete_keeps_newer_session() {
        let table = NatTable::new();
        let old: SessionConn = Arc::new(MockPacketConn::default());
        let new: SessionConn = Arc::new(MockPacketConn::default());
        table.set("k", old.clone()).unwrap();
        table.set("k", new.clone()).unwrap();
        assert!(!table.delete_if_same("k", &old).unwrap());
        assert_eq!(table.len().unwrap(), 1);
        assert!(table.delete_if_same("k", &new).unwrap());
        assert!(table.is_empty().unwrap());
        assert!(!table.delete_if_same("k", &new).unwrap());
    }

    #[test]
    fn lock_created_once() {
        let table = Arc::new(NatTable::new());
        let (first, loaded) = table.get_or_create_lock("k-lock").unwrap();
        assert!(!loaded);
        let (second, loaded) = table.get_or_create_lock("k-lock").unwrap();
        assert!(loaded);
        assert!(Arc::ptr_eq(&first, &second));

        drop(table.lock_guard("k-lock", first));
        assert_eq!(table.lock_count(), 0);
        assert!(second.is_completed());
        // already completed, returns at once
        second.wait().unwrap();
    }

    #[test]
    fn lookup_sees_session_or_lock() {
        let table = Arc::new(NatTable::new());
        let lock = match table.lookup_or_lock("k", "k-lock").unwrap() {
            SessionLookup::Vacant(lock) => lock,
            _ => panic!("expected vacant"),
        };
        assert!(matches!(
            table.lookup_or_lock("k", "k-lock").unwrap(),
            SessionLookup::Dialing(_)
        ));
        table.set("k", Arc::new(MockPacketConn::default())).unwrap();
        drop(table.lock_guard("k-lock", lock));
        assert!(matches!(
            table.lookup_or_lock("k", "k-lock").unwrap(),
            SessionLookup::Established(_)
        ));
        assert_eq!(table.lock_count(), 0);
    }

    #[test]
    fn waiters_wake_up_when_guard_dropped() {
        let table = Arc::new(NatTable::new());
        let (lock, _) = table.get_or_create_lock("k-lock").unwrap();
        let barrier = Arc::new(Barrier::new(5));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let (lock, loaded) = table.get_or_create_lock("k-lock").unwrap();
                    assert!(loaded);
                    barrier.wait();
                    lock.wait().unwrap();
                })
            })
            .collect();
        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        drop(table.lock_guard("k-lock", lock));
        for w in waiters {
            w.join().unwrap();
        }
        assert_eq!(table.lock_count(), 0);
    }

    #[test]
    fn guard_completes_on_panic() {
        let table = Arc::new(NatTable::new());
        let (lock, _) = table.get_or_create_lock("k-lock").unwrap();
        let waiter = lock.clone();
        let th = {
            let table = table.clone();
            thread::spawn(move || {
                let _guard = table.lock_guard("k-lock", lock);
                panic!("dial exploded");
            })
        };
        assert!(th.join().is_err());
        waiter.wait().unwrap();
        assert_eq!(table.lock_count(), 0);
    }
}
