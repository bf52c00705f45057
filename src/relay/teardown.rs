//! Teardown predicates (spec.md §4.6). Kept as pure functions over an
//! explicit snapshot of endpoint state so the "ready to free" logic can be
//! unit-tested independently of the actual socket/task plumbing in
//! `relay::mod`.

/// Snapshot of one direction's half-close/drain state, as seen by the
/// teardown coordinator.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointState {
    pub eof: bool,
    pub input_empty: bool,
}

/// Parent predicate (`src`/`e2src`). Mirrors spec.md §4.6 literally: the
/// four bullet conditions are evaluated in order, matching the source's
/// early-return structure rather than collapsing into one expression.
pub fn parent_ready_to_free(src: EndpointState, e2src: EndpointState, initialized: bool, has_children: bool) -> bool {
    if !src.eof && !e2src.eof {
        return false;
    }
    if src.eof && !src.input_empty && !e2src.eof {
        return false;
    }
    if e2src.eof && !e2src.input_empty && !src.eof {
        return false;
    }
    if (src.eof || e2src.eof) && !initialized {
        return true;
    }
    if src.eof && e2src.eof {
        return true;
    }
    if src.eof && e2src.input_empty {
        return true;
    }
    if e2src.eof && src.input_empty {
        return true;
    }
    if initialized && !has_children {
        return true;
    }
    false
}

/// Child predicate (`e2dst`/`dst`), consulting the parent's half-close
/// state if still attached (spec.md §4.6 "Child predicate").
pub fn child_ready_to_free(
    e2dst: EndpointState,
    dst: EndpointState,
    parent: Option<(EndpointState, EndpointState)>,
) -> bool {
    match parent {
        None => true,
        Some((parent_src, parent_e2src)) => {
            parent_ready_to_free(e2dst, dst, true, false) || (parent_src.eof && parent_e2src.eof)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live() -> EndpointState {
        EndpointState { eof: false, input_empty: true }
    }
    fn eof_empty() -> EndpointState {
        EndpointState { eof: true, input_empty: true }
    }
    fn eof_pending() -> EndpointState {
        EndpointState { eof: true, input_empty: false }
    }

    #[test]
    fn test_both_live_not_ready() {
        assert!(!parent_ready_to_free(live(), live(), false, false));
    }

    #[test]
    fn test_one_side_eof_no_children_ever_ready() {
        assert!(parent_ready_to_free(eof_empty(), live(), false, false));
    }

    #[test]
    fn test_pending_peer_data_blocks_teardown() {
        // src closed but still has buffered bytes the peer hasn't drained,
        // and e2src is still live: not ready yet.
        assert!(!parent_ready_to_free(eof_pending(), live(), true, false));
    }

    #[test]
    fn test_both_eof_ready() {
        assert!(parent_ready_to_free(eof_empty(), eof_empty(), true, true));
    }

    #[test]
    fn test_initialized_no_children_ready() {
        assert!(parent_ready_to_free(eof_empty(), live(), true, false));
    }

    #[test]
    fn test_child_ready_with_no_parent() {
        assert!(child_ready_to_free(eof_empty(), eof_empty(), None));
    }

    #[test]
    fn test_child_waits_if_own_pipes_still_live() {
        assert!(!child_ready_to_free(live(), live(), Some((live(), live()))));
    }
}
