//! Meta-context (spec.md §3, §5): bookkeeping shared between a parent
//! interception and its mirror children, under a single mutex.
//!
//! The original ties parent/children together with raw pointers and frees
//! the struct by hand once released. Here the arena slot is simply the
//! `Arc<Meta>` itself (per spec.md §9's "model as an arena... indexed by a
//! handle" note): children and the parent each hold a clone, `MetaState`
//! plays the role of the mutex-guarded bookkeeping, and the struct is
//! reclaimed by ordinary `Drop` once the last clone goes away. The
//! correctness-critical part the original calls out — destroy/free only
//! after unlocking — is preserved: `release_parent`/`release_child` return
//! whether this was the last reference *after* dropping the lock guard, and
//! callers only act on the mirror listener once they see that signal.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

struct MetaState {
    parent_active: bool,
    child_count: usize,
    released: bool,
    parent_src_eof: bool,
    parent_e2src_eof: bool,
    /// Monotonic false → true once a mirror child has ever attached
    /// (spec.md §3 "initialized"); gates the parent teardown predicate's
    /// "no children will ever attach" branch.
    initialized: bool,
}

pub struct Meta {
    state: Mutex<MetaState>,
    pub mirror_addr: SocketAddr,
    mirror_shutdown: Notify,
    /// Sticky companion to `mirror_shutdown`: `notify_waiters()` wakes only
    /// whoever is parked *right now*, so a signal that lands between a
    /// `select!` iteration's wait calls would otherwise vanish. Set before
    /// notifying, and checked after registering interest in a notification
    /// (not before), so a shutdown can never be missed.
    mirror_shutdown_requested: AtomicBool,
}

impl Meta {
    pub fn new(mirror_addr: SocketAddr) -> Self {
        Self {
            state: Mutex::new(MetaState {
                parent_active: true,
                child_count: 0,
                released: false,
                parent_src_eof: false,
                parent_e2src_eof: false,
                initialized: false,
            }),
            mirror_addr,
            mirror_shutdown: Notify::new(),
            mirror_shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn register_child(&self) {
        let mut state = self.state.lock().unwrap();
        state.child_count += 1;
        state.initialized = true;
    }

    /// Parent has released `src`/`dst`/`e2src`. Returns true exactly once,
    /// when this was the reference that made the meta-context releasable
    /// (spec.md §4.6 "Parent release").
    pub fn release_parent(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.parent_active = false;
        Self::maybe_release(&mut state)
    }

    /// A child has released `dst`/`e2dst`. Returns true exactly once, under
    /// the same rule as `release_parent` (spec.md §4.6 "Child release").
    pub fn release_child(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.child_count -= 1;
        Self::maybe_release(&mut state)
    }

    fn maybe_release(state: &mut MetaState) -> bool {
        if !state.released && !state.parent_active && state.child_count == 0 {
            state.released = true;
            true
        } else {
            false
        }
    }

    pub fn has_children(&self) -> bool {
        self.state.lock().unwrap().child_count > 0
    }

    /// True once at least one mirror child has ever attached (spec.md §3
    /// "initialized"). Never resets to false even after all children
    /// release.
    pub fn initialized(&self) -> bool {
        self.state.lock().unwrap().initialized
    }

    /// Record the parent's current half-close state, so a child's teardown
    /// predicate can consult it without holding a reference to the parent
    /// connection struct itself (spec.md §4.6 "Child predicate").
    pub fn set_parent_eof(&self, src_eof: bool, e2src_eof: bool) {
        let mut state = self.state.lock().unwrap();
        state.parent_src_eof = src_eof;
        state.parent_e2src_eof = e2src_eof;
    }

    /// `None` once the parent has released (spec.md §4.6 "also ready when
    /// parent is null").
    pub fn parent_eof(&self) -> Option<(bool, bool)> {
        let state = self.state.lock().unwrap();
        if state.parent_active {
            Some((state.parent_src_eof, state.parent_e2src_eof))
        } else {
            None
        }
    }

    /// Signal the mirror listener's accept loop to stop; only call after a
    /// `release_*` call above returned `true`.
    pub fn shut_down_mirror_listener(&self) {
        self.mirror_shutdown_requested.store(true, Ordering::SeqCst);
        self.mirror_shutdown.notify_one();
    }

    /// Register interest in a notification *before* checking the sticky
    /// flag, per `Notify`'s documented wait pattern: if the flag flips true
    /// between the check and a plain `.notified().await`, the wakeup would
    /// be lost and the caller would park forever.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.mirror_shutdown.notified();
        if self.mirror_shutdown_requested.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_only_when_parent_and_children_both_gone() {
        let meta = Meta::new("127.0.0.1:0".parse().unwrap());
        meta.register_child();
        assert!(!meta.release_parent());
        assert!(meta.release_child());
    }

    #[test]
    fn test_no_children_releases_on_parent_alone() {
        let meta = Meta::new("127.0.0.1:0".parse().unwrap());
        assert!(meta.release_parent());
    }

    #[test]
    fn test_initialized_is_monotonic() {
        let meta = Meta::new("127.0.0.1:0".parse().unwrap());
        assert!(!meta.initialized());
        meta.register_child();
        assert!(meta.initialized());
        meta.release_child();
        // A child attaching and then releasing must not un-initialize the
        // parent's teardown predicate (spec.md §3: "initialized is
        // monotonic").
        assert!(meta.initialized());
    }

    #[tokio::test]
    async fn test_shutdown_signal_not_lost_if_sent_before_wait() {
        let meta = Meta::new("127.0.0.1:0".parse().unwrap());
        // notify_waiters() would drop this signal since nothing is parked
        // yet; the sticky flag must let a later wait_for_shutdown return
        // immediately instead of hanging.
        meta.shut_down_mirror_listener();
        tokio::time::timeout(std::time::Duration::from_secs(1), meta.wait_for_shutdown())
            .await
            .expect("shutdown signal sent before waiting must not be lost");
    }

    #[test]
    fn test_release_signal_fires_once() {
        let meta = Meta::new("127.0.0.1:0".parse().unwrap());
        meta.register_child();
        assert!(!meta.release_child());
        assert!(meta.release_parent());
        // A hypothetical second child departing after release must never
        // re-trigger release.
    }
}
