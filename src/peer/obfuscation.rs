/**
 * peer/obfuscation.rs
 *
 * Pluggable byte transform applied to every record on the link
 */

use std::fmt;

use crate::error::Result;

/// Rewrites link records after encryption and before they hit the socket
///
/// Implementations must be exact inverses: `deobfuscate(obfuscate(x)) == x`.
pub trait Obfuscator: Send + Sync + fmt::Debug {
    fn obfuscate(&self, record: &mut Vec<u8>);

    fn deobfuscate(&self, record: &mut Vec<u8>) -> Result<()>;
}

/// Adds a fixed value to every byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caesar {
    pub shift: u8,
}

impl Caesar {
    pub fn new(shift: u8) -> Self {
        Self { shift }
    }
}

impl Obfuscator for Caesar {
    fn obfuscate(&self, record: &mut Vec<u8>) {
        for byte in record.iter_mut() {
            *byte = byte.wrapping_add(self.shift);
        }
    }

    fn deobfuscate(&self, record: &mut Vec<u8>) -> Result<()> {
        for byte in record.iter_mut() {
            *byte = byte.wrapping_sub(self.shift);
        }
        Ok(())
    }
}
