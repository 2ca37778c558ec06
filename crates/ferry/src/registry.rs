//! Process-wide table of live transfer sessions.
//!
//! The id→session map is the only cross-session shared mutable state in
//! the crate. Ids are assigned monotonically under the registry lock and
//! never recycled, so an abort request can never reach the wrong transfer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;

use crate::session::SessionShared;

/// Opaque session identifier, unique for the life of the process.
pub type SessionId = u64;

struct RegistryInner {
    next_id: SessionId,
    sessions: HashMap<SessionId, Arc<SessionShared>>,
}

static REGISTRY: Lazy<Mutex<RegistryInner>> = Lazy::new(|| {
    Mutex::new(RegistryInner {
        next_id: 1,
        sessions: HashMap::new(),
    })
});

fn lock() -> MutexGuard<'static, RegistryInner> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Assigns the next session id and publishes the session under it.
pub(crate) fn register(shared: &Arc<SessionShared>) -> SessionId {
    let mut registry = lock();
    let id = registry.next_id;
    registry.next_id += 1;
    registry.sessions.insert(id, Arc::clone(shared));
    id
}

pub(crate) fn find(id: SessionId) -> Option<Arc<SessionShared>> {
    lock().sessions.get(&id).cloned()
}

pub(crate) fn unregister(id: SessionId) {
    lock().sessions.remove(&id);
}

/// Requests cooperative cancellation of an in-flight session.
///
/// Lenient by contract: unknown ids, idle sessions, and sessions that have
/// already reached a terminal state are all no-ops.
pub fn abort(id: SessionId) {
    if let Some(shared) = find(id) {
        shared.request_abort();
    }
}
