//! Recording connections with failure injection, shared by unit tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::{Connection, ConnectionSource, DatabaseId, DriverError, DriverResult};
use crate::transaction::IsolationLevel;

/// Something a recording connection or source observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Acquire(usize),
    Release(usize),
    AutoCommit(usize, bool),
    Isolation(usize, IsolationLevel),
    Commit(usize),
    Rollback(usize),
}

#[derive(Default)]
struct Faults {
    acquire: bool,
    commit: bool,
    rollback: bool,
    isolation: bool,
    auto_commit: bool,
}

struct Live {
    auto_commit: bool,
    isolation: IsolationLevel,
}

#[derive(Default)]
struct Inner {
    next_id: usize,
    events: Vec<Event>,
    faults: Faults,
    live: HashMap<usize, Live>,
}

/// Shared log of everything the recording connections did.
#[derive(Clone, Default)]
pub struct Script {
    inner: Arc<Mutex<Inner>>,
}

fn injected(what: &str) -> DriverError {
    format!("injected {what} failure").into()
}

impl Script {
    pub fn fail_acquire(&self, on: bool) {
        self.inner.lock().faults.acquire = on;
    }

    pub fn fail_commit(&self, on: bool) {
        self.inner.lock().faults.commit = on;
    }

    pub fn fail_rollback(&self, on: bool) {
        self.inner.lock().faults.rollback = on;
    }

    pub fn fail_isolation(&self, on: bool) {
        self.inner.lock().faults.isolation = on;
    }

    pub fn fail_auto_commit(&self, on: bool) {
        self.inner.lock().faults.auto_commit = on;
    }

    pub fn check_acquire(&self, _db: &DatabaseId) -> DriverResult<()> {
        if self.inner.lock().faults.acquire {
            return Err(injected("acquire"));
        }
        Ok(())
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().events.clone()
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.inner.lock().events.iter().filter(|e| pred(e)).count()
    }

    pub fn commits(&self) -> usize {
        self.count(|e| matches!(e, Event::Commit(_)))
    }

    pub fn rollbacks(&self) -> usize {
        self.count(|e| matches!(e, Event::Rollback(_)))
    }

    pub fn acquires(&self) -> usize {
        self.count(|e| matches!(e, Event::Acquire(_)))
    }

    pub fn releases(&self) -> usize {
        self.count(|e| matches!(e, Event::Release(_)))
    }

    /// Live isolation level of connection `id`.
    pub fn isolation_of(&self, id: usize) -> IsolationLevel {
        self.inner.lock().live[&id].isolation
    }

    /// Live auto-commit flag of connection `id`.
    pub fn auto_commit_of(&self, id: usize) -> bool {
        self.inner.lock().live[&id].auto_commit
    }

    fn open(&self, auto_commit: bool) -> usize {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.live.insert(
            id,
            Live {
                auto_commit,
                isolation: IsolationLevel::ReadCommitted,
            },
        );
        id
    }

    fn record(&self, event: Event) {
        self.inner.lock().events.push(event);
    }
}

/// Connection that records every transactional call into a [`Script`].
pub struct RecordingConnection {
    id: usize,
    script: Script,
}

impl RecordingConnection {
    pub fn new(script: Script) -> Self {
        Self::with_auto_commit(script, true)
    }

    pub fn with_auto_commit(script: Script, auto_commit: bool) -> Self {
        let id = script.open(auto_commit);
        Self { id, script }
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

impl Connection for RecordingConnection {
    fn auto_commit(&self) -> DriverResult<bool> {
        Ok(self.script.auto_commit_of(self.id))
    }

    fn set_auto_commit(&mut self, enabled: bool) -> DriverResult<()> {
        let mut inner = self.script.inner.lock();
        if inner.faults.auto_commit {
            return Err(injected("auto-commit"));
        }
        inner.events.push(Event::AutoCommit(self.id, enabled));
        if let Some(live) = inner.live.get_mut(&self.id) {
            live.auto_commit = enabled;
        }
        Ok(())
    }

    fn isolation(&self) -> DriverResult<IsolationLevel> {
        Ok(self.script.isolation_of(self.id))
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> DriverResult<()> {
        let mut inner = self.script.inner.lock();
        if inner.faults.isolation {
            return Err(injected("isolation"));
        }
        inner.events.push(Event::Isolation(self.id, level));
        if let Some(live) = inner.live.get_mut(&self.id) {
            live.isolation = level;
        }
        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        if self.script.inner.lock().faults.commit {
            return Err(injected("commit"));
        }
        self.script.record(Event::Commit(self.id));
        Ok(())
    }

    fn rollback(&mut self) -> DriverResult<()> {
        if self.script.inner.lock().faults.rollback {
            return Err(injected("rollback"));
        }
        self.script.record(Event::Rollback(self.id));
        Ok(())
    }
}

/// Source that opens a new recording connection on every acquire.
#[derive(Clone, Default)]
pub struct RecordingSource {
    pub script: Script,
}

impl ConnectionSource for RecordingSource {
    type Connection = RecordingConnection;

    fn acquire(&self, db: &DatabaseId) -> DriverResult<RecordingConnection> {
        self.script.check_acquire(db)?;
        let conn = RecordingConnection::new(self.script.clone());
        self.script.record(Event::Acquire(conn.id()));
        Ok(conn)
    }

    fn release(&self, conn: RecordingConnection, _db: &DatabaseId) -> DriverResult<()> {
        self.script.record(Event::Release(conn.id()));
        Ok(())
    }
}
