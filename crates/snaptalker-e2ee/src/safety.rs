//! Human-comparable fingerprints of a pair of identity keys.

use sha2::{Digest, Sha512};

const SAFETY_NUMBER_VERSION: u16 = 0;
const BLOCKS: usize = 12;
const BYTES_PER_BLOCK: usize = 5;

/// 60 digits in 12 space-separated blocks of five.
///
/// The keys are put in canonical order before hashing, so both parties get
/// the same number no matter who computes it.
pub fn generate(our_key: &[u8], their_key: &[u8]) -> String {
    let (low, high) = if our_key <= their_key {
        (our_key, their_key)
    } else {
        (their_key, our_key)
    };

    let mut hasher = Sha512::new();
    hasher.update(SAFETY_NUMBER_VERSION.to_be_bytes());
    hasher.update(low);
    hasher.update(high);
    let digest = hasher.finalize();

    digest
        .chunks_exact(BYTES_PER_BLOCK)
        .take(BLOCKS)
        .map(|chunk| {
            let value = chunk.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            format!("{:05}", value % 100_000)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compare two renderings, ignoring whitespace.
pub fn matches(expected: &str, actual: &str) -> bool {
    let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
    let expected = strip(expected);
    !expected.is_empty() && expected == strip(actual)
}
