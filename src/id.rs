// src/id.rs — KernelId: opaque 128-bit identifier (spec §3)

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelId(Uuid);

impl KernelId {
    /// Cryptographically random 128-bit id (spec §4.3 step 2). Built from
    /// `OsRng` bytes rather than `Uuid::new_v4` so the randomness source is
    /// the OS CSPRNG rather than whatever generator `uuid`'s v4 feature picks.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(Uuid::from_bytes(bytes))
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl std::str::FromStr for KernelId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display() {
        let id = KernelId::generate();
        let text = id.to_string();
        assert_eq!(KernelId::parse(&text), Some(id));
    }

    #[test]
    fn generate_is_not_trivially_colliding() {
        let a = KernelId::generate();
        let b = KernelId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(KernelId::parse("not-a-uuid").is_none());
    }
}
