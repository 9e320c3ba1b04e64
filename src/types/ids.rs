//! Strongly-typed identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric backend identifier, unique within one server instance.
///
/// Assigned in configuration order starting at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackendId(usize);

impl BackendId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "be#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_id_display() {
        assert_eq!(BackendId::new(3).to_string(), "be#3");
        assert_eq!(BackendId::new(3).as_usize(), 3);
    }
}
