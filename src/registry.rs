use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, info};

use crate::error::UpdaterError;

/// A registered client session. Handles are exclusively owned by the
/// registry; every other component refers to sessions by `handle_id`.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    pub handle_id: u64,
    pub process_name: String,
    pub lib_version: String,
    /// Opaque bus peer id; ownership checks compare it verbatim.
    pub caller: String,
    pub registered_at: SystemTime,
}

/// Client-registration registry with re-registration semantics.
///
/// Invariant: at most one handle per `(process_name, caller)` pair, and at
/// most one caller per `process_name`.
pub struct Registry {
    handles: Mutex<HashMap<u64, ClientHandle>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            handles: Mutex::new(HashMap::new()),
            // 0 is reserved as the invalid handle.
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a client process.
    ///
    /// Re-registration by the same caller with the same process name is
    /// idempotent and returns the existing handle. The same process name
    /// from a different caller is rejected.
    pub fn register(
        &self,
        process_name: &str,
        lib_version: &str,
        caller: &str,
    ) -> Result<u64, UpdaterError> {
        if process_name.is_empty() {
            return Err(UpdaterError::invalid_args("process name must not be empty"));
        }
        if lib_version.is_empty() {
            return Err(UpdaterError::invalid_args(
                "library version must not be empty",
            ));
        }

        let mut handles = self.handles.lock();
        if let Some(existing) = handles.values().find(|h| h.process_name == process_name) {
            if existing.caller == caller {
                debug!(
                    handle_id = existing.handle_id,
                    process_name, "re-registration, returning existing handle"
                );
                return Ok(existing.handle_id);
            }
            return Err(UpdaterError::AlreadyRegistered {
                process_name: process_name.to_string(),
            });
        }

        let handle_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        handles.insert(
            handle_id,
            ClientHandle {
                handle_id,
                process_name: process_name.to_string(),
                lib_version: lib_version.to_string(),
                caller: caller.to_string(),
                registered_at: SystemTime::now(),
            },
        );
        info!(handle_id, process_name, lib_version, "client registered");
        metrics::gauge!("fwupdater_registered_clients").set(handles.len() as f64);
        Ok(handle_id)
    }

    /// Removes a handle. Returns false when the handle is unknown.
    ///
    /// Cancelling the handle's in-flight jobs is composed by the bus
    /// adapter, which owns the job table reference.
    pub fn unregister(&self, handle_id: u64) -> bool {
        let mut handles = self.handles.lock();
        let removed = handles.remove(&handle_id);
        if let Some(handle) = &removed {
            info!(handle_id, process_name = %handle.process_name, "client unregistered");
            metrics::gauge!("fwupdater_registered_clients").set(handles.len() as f64);
        }
        removed.is_some()
    }

    pub fn lookup(&self, handle_id: u64) -> Option<ClientHandle> {
        self.handles.lock().get(&handle_id).cloned()
    }

    /// Resolves a handle and checks it belongs to `caller`.
    pub fn authorize(&self, handle_id: u64, caller: &str) -> Result<ClientHandle, UpdaterError> {
        match self.lookup(handle_id) {
            Some(handle) if handle.caller == caller => Ok(handle),
            _ => Err(UpdaterError::NotRegistered(handle_id)),
        }
    }

    pub fn lookup_by_caller(&self, caller: &str) -> Vec<ClientHandle> {
        self.handles
            .lock()
            .values()
            .filter(|h| h.caller == caller)
            .cloned()
            .collect()
    }

    /// Removes every handle owned by a disconnected peer; returns the
    /// removed handle ids so the adapter can cancel their jobs.
    pub fn on_peer_disconnect(&self, caller: &str) -> Vec<u64> {
        let mut handles = self.handles.lock();
        let gone: Vec<u64> = handles
            .values()
            .filter(|h| h.caller == caller)
            .map(|h| h.handle_id)
            .collect();
        for id in &gone {
            handles.remove(id);
        }
        if !gone.is_empty() {
            info!(
                caller,
                handles = gone.len(),
                "peer disconnected, handles swept"
            );
            metrics::gauge!("fwupdater_registered_clients").set(handles.len() as f64);
        }
        gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_nonzero_and_unique() {
        let registry = Registry::new();
        let a = registry.register("appA", "1.0.0", ":1.101").unwrap();
        let b = registry.register("appB", "1.0.0", ":1.102").unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn re_registration_is_idempotent() {
        let registry = Registry::new();
        let first = registry.register("appA", "1.0.0", ":1.101").unwrap();
        let second = registry.register("appA", "1.0.1", ":1.101").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn duplicate_process_name_from_other_caller_is_rejected() {
        let registry = Registry::new();
        registry.register("appA", "1.0.0", ":1.101").unwrap();
        let err = registry.register("appA", "1.0.0", ":1.202").unwrap_err();
        assert!(matches!(err, UpdaterError::AlreadyRegistered { .. }));
    }

    #[test]
    fn empty_fields_are_invalid() {
        let registry = Registry::new();
        assert!(matches!(
            registry.register("", "1.0.0", ":1.101"),
            Err(UpdaterError::InvalidArgs(_))
        ));
        assert!(matches!(
            registry.register("appA", "", ":1.101"),
            Err(UpdaterError::InvalidArgs(_))
        ));
    }

    #[test]
    fn unregister_then_lookup_fails() {
        let registry = Registry::new();
        let id = registry.register("appA", "1.0.0", ":1.101").unwrap();
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.lookup(id).is_none());
        assert!(matches!(
            registry.authorize(id, ":1.101"),
            Err(UpdaterError::NotRegistered(_))
        ));
    }

    #[test]
    fn authorize_rejects_foreign_caller() {
        let registry = Registry::new();
        let id = registry.register("appA", "1.0.0", ":1.101").unwrap();
        assert!(registry.authorize(id, ":1.101").is_ok());
        assert!(registry.authorize(id, ":1.999").is_err());
    }

    #[test]
    fn peer_disconnect_sweeps_all_handles_of_that_peer() {
        let registry = Registry::new();
        let a = registry.register("appA", "1.0.0", ":1.101").unwrap();
        let b = registry.register("appB", "1.0.0", ":1.101").unwrap();
        let c = registry.register("appC", "1.0.0", ":1.202").unwrap();

        let mut gone = registry.on_peer_disconnect(":1.101");
        gone.sort_unstable();
        let mut expected = vec![a, b];
        expected.sort_unstable();
        assert_eq!(gone, expected);
        assert!(registry.lookup(c).is_some());
    }
}
