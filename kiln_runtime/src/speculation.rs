//! Speculation logs.
//!
//! A speculation log remembers which speculative assumptions a method's
//! compiled code made and which of them later failed. The compiler consults
//! the log before speculating again, so a failed assumption is not retried
//! in the next compilation.
//!
//! Logs are owned by a [`SpeculationLogRegistry`] passed down from the
//! compilation context. The registry keys logs by (declaring type, method)
//! and guards each type's map with its own lock, so compilations of
//! unrelated types never contend.

use dashmap::DashMap;
use kiln_core::{KilnError, KilnResult, MethodRef, SpeculationHandle, SpeculationReason, TypeRef};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

// =============================================================================
// Speculation Log
// =============================================================================

#[derive(Debug, Default)]
struct LogState {
    /// Failures visible to `may_speculate`.
    failed: FxHashSet<SpeculationReason>,
    /// Failures reported by the runtime since the last collection.
    pending: FxHashSet<SpeculationReason>,
    speculations: FxHashMap<SpeculationReason, SpeculationHandle>,
    reasons: FxHashMap<SpeculationHandle, SpeculationReason>,
    next_id: u64,
}

/// Per-method record of speculations taken and failed.
#[derive(Debug, Default)]
pub struct SpeculationLog {
    state: Mutex<LogState>,
}

impl SpeculationLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `reason` has not failed in a collected round.
    pub fn may_speculate(&self, reason: &SpeculationReason) -> bool {
        !self.state.lock().failed.contains(reason)
    }

    /// Take a speculation on `reason`. Taking the same reason twice yields
    /// the same handle. Speculating on a failed reason is an internal error.
    pub fn speculate(&self, reason: SpeculationReason) -> KilnResult<SpeculationHandle> {
        let mut state = self.state.lock();
        if state.failed.contains(&reason) {
            return Err(KilnError::internal(format!(
                "speculation {}@{} already failed",
                reason.group, reason.bci
            )));
        }
        if let Some(&handle) = state.speculations.get(&reason) {
            return Ok(handle);
        }
        state.next_id += 1;
        let handle = SpeculationHandle(state.next_id);
        state.speculations.insert(reason.clone(), handle);
        state.reasons.insert(handle, reason);
        Ok(handle)
    }

    /// Runtime callback: the speculation behind `handle` failed. Returns
    /// false for handles this log never issued.
    pub fn record_failure(&self, handle: SpeculationHandle) -> bool {
        let mut state = self.state.lock();
        match state.reasons.get(&handle).cloned() {
            Some(reason) => {
                log::debug!("speculation {}@{} failed", reason.group, reason.bci);
                state.pending.insert(reason);
                true
            }
            None => false,
        }
    }

    /// Make failures reported since the last call visible to
    /// [`may_speculate`](Self::may_speculate). Called at the start of a
    /// compilation so its view is stable.
    pub fn collect_failed_speculations(&self) {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut state.pending);
        state.failed.extend(pending);
    }

    /// Reason recorded for `handle`.
    pub fn reason(&self, handle: SpeculationHandle) -> Option<SpeculationReason> {
        self.state.lock().reasons.get(&handle).cloned()
    }

    /// Whether any speculation was taken.
    pub fn has_speculations(&self) -> bool {
        !self.state.lock().speculations.is_empty()
    }

    /// Number of collected failures.
    pub fn failed_count(&self) -> usize {
        self.state.lock().failed.len()
    }
}

// =============================================================================
// Registry
// =============================================================================

type MethodLogs = Arc<Mutex<FxHashMap<MethodRef, Arc<SpeculationLog>>>>;

/// Owner of every method's speculation log.
#[derive(Debug, Default)]
pub struct SpeculationLogRegistry {
    by_type: DashMap<TypeRef, MethodLogs>,
}

impl SpeculationLogRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Log for `method`, created on first use. Concurrent callers for the
    /// same method receive the same log.
    pub fn log_for(&self, method: &MethodRef) -> Arc<SpeculationLog> {
        let logs = self
            .by_type
            .entry(method.holder().clone())
            .or_default()
            .clone();
        let mut logs = logs.lock();
        logs.entry(method.clone())
            .or_insert_with(|| Arc::new(SpeculationLog::new()))
            .clone()
    }

    /// Existing log for `method`, if any.
    pub fn get(&self, method: &MethodRef) -> Option<Arc<SpeculationLog>> {
        let logs = self.by_type.get(method.holder())?.clone();
        let logs = logs.lock();
        logs.get(method).cloned()
    }

    /// Drop every log of `holder`, e.g. after the type is redefined.
    pub fn evict_type(&self, holder: &TypeRef) -> usize {
        self.by_type
            .remove(holder)
            .map(|(_, logs)| logs.lock().len())
            .unwrap_or(0)
    }

    /// Number of types with logs.
    pub fn type_count(&self) -> usize {
        self.by_type.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(bci: i32) -> SpeculationReason {
        SpeculationReason::new("null_check", bci, 0)
    }

    fn method(holder: &str, name: &str) -> MethodRef {
        MethodRef::new(TypeRef::new(holder), name, "()V")
    }

    #[test]
    fn test_speculate_is_stable() {
        let log = SpeculationLog::new();
        let a = log.speculate(reason(1)).unwrap();
        let b = log.speculate(reason(1)).unwrap();
        let c = log.speculate(reason(2)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is_speculative());
        assert_eq!(log.reason(c), Some(reason(2)));
    }

    #[test]
    fn test_failures_visible_after_collection() {
        let log = SpeculationLog::new();
        let handle = log.speculate(reason(4)).unwrap();
        assert!(log.record_failure(handle));
        assert!(log.may_speculate(&reason(4)));

        log.collect_failed_speculations();
        assert!(!log.may_speculate(&reason(4)));
        assert!(log.may_speculate(&reason(5)));
        assert!(log.speculate(reason(4)).is_err());
        assert_eq!(log.failed_count(), 1);
    }

    #[test]
    fn test_unknown_handle_failure_ignored() {
        let log = SpeculationLog::new();
        assert!(!log.record_failure(SpeculationHandle(77)));
        assert!(!log.record_failure(SpeculationHandle::NO_SPECULATION));
    }

    #[test]
    fn test_registry_keys_by_type_and_method() {
        let registry = SpeculationLogRegistry::new();
        let foo = method("Lapp/A;", "foo");
        let bar = method("Lapp/A;", "bar");
        let other = method("Lapp/B;", "foo");

        let log = registry.log_for(&foo);
        assert!(Arc::ptr_eq(&log, &registry.log_for(&foo)));
        assert!(!Arc::ptr_eq(&log, &registry.log_for(&bar)));
        assert!(!Arc::ptr_eq(&log, &registry.log_for(&other)));
        assert_eq!(registry.type_count(), 2);

        assert_eq!(registry.evict_type(foo.holder()), 2);
        assert!(registry.get(&foo).is_none());
    }

    #[test]
    fn test_registry_concurrent_creation_converges() {
        let registry = Arc::new(SpeculationLogRegistry::new());
        let target = method("Lapp/C;", "run");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let target = target.clone();
                std::thread::spawn(move || registry.log_for(&target))
            })
            .collect();
        let logs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(logs.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
