//! Prefix XOR obfuscation.
//!
//! XORs the first `size` bytes of every forwarded payload with a single key
//! byte. The same filter runs in both directions, and applying it twice
//! restores the input. This changes the look of the traffic on the wire; it
//! is not encryption.

use serde::{Deserialize, Serialize};

/// XOR key and prefix length. `size == 0` disables the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObfuscationFilter {
    pub key: u8,
    pub size: usize,
}

impl ObfuscationFilter {
    pub fn new(key: u8, size: usize) -> Self {
        Self { key, size }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.size > 0
    }

    /// Transform `payload` in place.
    pub fn apply(&self, payload: &mut [u8]) {
        let len = payload.len().min(self.size);
        for byte in &mut payload[..len] {
            *byte ^= self.key;
        }
    }
}
