use std::cell::Cell;

/// What the last cache lookup on this thread found.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Outcome {
    /// Nothing was cached; the caller computes.
    Miss,
    /// A settled entry was found.
    Hit,
    /// A pending entry was found; the caller waits for it.
    Attached,
}

thread_local! {
    /// The outcome of the last lookup on this thread.
    static LAST: Cell<Option<Outcome>> = const { Cell::new(None) };
}

/// The outcome of the last lookup on this thread, if any happened.
pub fn last_lookup() -> Option<Outcome> {
    LAST.with(|cell| cell.get())
}

/// Whether the last lookup on this thread was a hit.
pub fn last_was_hit() -> bool {
    last_lookup() == Some(Outcome::Hit)
}

/// Records the outcome of a lookup.
pub(crate) fn register(outcome: Outcome) {
    LAST.with(|cell| cell.set(Some(outcome)))
}
