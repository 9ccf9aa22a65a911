//! Newtype wrappers for engine identifiers and round modes.

use std::fmt;

/// Logical thread identifier.
///
/// Ids are assigned by the context factory starting at 1. The maestro
/// context, which is not a logical thread, reports [`ActorId::MAESTRO`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(pub u64);

impl ActorId {
    pub const MAESTRO: ActorId = ActorId(0);

    pub fn is_maestro(self) -> bool {
        self == Self::MAESTRO
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_maestro() {
            f.write_str("maestro")
        } else {
            write!(f, "A{}", self.0)
        }
    }
}

/// Dispatch protocol used for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Serial,
    Parallel,
}

impl Mode {
    pub(crate) fn index(self) -> usize {
        match self {
            Mode::Serial => 0,
            Mode::Parallel => 1,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Serial => f.write_str("serial"),
            Mode::Parallel => f.write_str("parallel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_id_display() {
        assert_eq!(ActorId::MAESTRO.to_string(), "maestro");
        assert_eq!(ActorId(42).to_string(), "A42");
        assert!(!ActorId(1).is_maestro());
    }
}
