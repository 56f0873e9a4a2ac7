//! Unique name generation for synthesized variables.

use serde::{Deserialize, Serialize};

/// Counter-backed source of fresh identifiers. One generator is threaded
/// through a whole compilation run so rewrites and codegen never collide;
/// separate runs start from zero and produce identical names for identical
/// input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NameGen {
    next: u64,
}

impl NameGen {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Return `"{base}{n}"` for a run-unique `n`.
    pub fn fresh(&mut self, base: &str) -> String {
        let n = self.next;
        self.next += 1;
        format!("{base}{n}")
    }
}
