//! Command unique identifiers.

/// Monotone integer tagging a resumable work unit (a `Command`).
pub type Cuid = u64;

/// Hands out the next CUID. Owned by the engine; never reset.
#[derive(Debug, Default)]
pub struct CuidCounter {
    next: Cuid,
}

impl CuidCounter {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn next(&mut self) -> Cuid {
        self.next += 1;
        self.next
    }
}
