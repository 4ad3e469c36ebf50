//! Random identifiers for servers, relocations, and durable data moves.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A 128-bit identifier. The nil id (all zero bits) means "not assigned";
/// durable data moves that predate metadata encoding run under the nil id.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(u64, u64);

impl Uid {
    pub const fn nil() -> Self {
        Uid(0, 0)
    }

    pub const fn from_parts(first: u64, second: u64) -> Self {
        Uid(first, second)
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Uid(rng.gen(), rng.gen())
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0 || self.1 != 0
    }

    pub fn first(&self) -> u64 {
        self.0
    }

    pub fn second(&self) -> u64 {
        self.1
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.0, self.1)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form, enough to correlate log lines.
        write!(f, "{:016x}", self.0)
    }
}
