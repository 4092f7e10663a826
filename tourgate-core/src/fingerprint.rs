//! Conversation fingerprints used as response cache keys.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::admission::CallerKey;
use crate::conversation::{Conversation, Turn};

/// SHA-256 digest of the caller identity and the last K conversation turns.
///
/// Logically identical recent contexts from the same caller collide to one
/// fingerprint; anything earlier than the last K turns is ignored.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint the last `k` turns of `conversation` for `caller`.
    ///
    /// Fields are fed to the hasher in a fixed order, each length-prefixed so
    /// that no two distinct inputs share an encoding:
    /// caller, turn count, then `(role, content)` per turn.
    pub fn compute(caller: &CallerKey, conversation: &Conversation, k: usize) -> Self {
        Self::from_turns(caller, conversation.tail(k))
    }

    pub fn from_turns(caller: &CallerKey, turns: &[Turn]) -> Self {
        let mut hasher = Sha256::new();
        update_field(&mut hasher, caller.as_str().as_bytes());
        hasher.update((turns.len() as u64).to_be_bytes());
        for turn in turns {
            update_field(&mut hasher, turn.role.as_str().as_bytes());
            update_field(&mut hasher, turn.content.as_bytes());
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to tell entries apart in logs
        write!(
            f,
            "Fingerprint({:02x}{:02x}{:02x}{:02x}…)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}
