//! Byte-level tokenizer
//!
//! One token per UTF-8 byte plus four specials. Byte offsets in formatted
//! text map one-to-one onto token positions, which lets the causal objective
//! locate the answer span exactly.

pub const PAD_ID: u32 = 0;
pub const BOS_ID: u32 = 1;
pub const EOS_ID: u32 = 2;
pub const MASK_ID: u32 = 3;

const BYTE_OFFSET: u32 = 4;

/// Total vocabulary: 4 specials + 256 byte values
pub const VOCAB_SIZE: usize = 260;

#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub fn new() -> Self {
        Self
    }

    pub fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    /// Encode text without special tokens
    pub fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(|b| b as u32 + BYTE_OFFSET).collect()
    }

    /// Decode ids back to text; specials are skipped, invalid UTF-8 is replaced
    pub fn decode(&self, ids: &[u32]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| !Self::is_special(id))
            .map(|&id| (id - BYTE_OFFSET) as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn is_special(id: u32) -> bool {
        id < BYTE_OFFSET
    }
}
