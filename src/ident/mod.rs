//! Compact printable identifiers for pool and dataset GUIDs.
//!
//! A GUID is rendered as 11 symbols of a 64-symbol alphabet plus one padding
//! symbol. The alphabet is base64 with `/` swapped for `#`, because `/`
//! separates host and metric path in the collectd identifier and `_` is
//! avoided by collectd type names. The encoding is pure, so a GUID maps to
//! the same token across sessions and restarts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Token reserved for GUID 0, which never names a real object.
pub const SENTINEL_TOKEN: &str = "0";

/// Number of alphabet symbols in an encoded GUID (excluding padding).
pub const ENCODED_SYMBOLS: usize = 11;

/// Appended after the 11 symbols.
pub const PADDING: u8 = b'=';

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+#";

/// Encodes a GUID into its printable token.
///
/// The value is taken as 8 big-endian bytes. Ten full 6-bit groups cover the
/// top 60 bits; the eleventh group holds the remaining 4 bits shifted left by
/// 2, which is the standard base64 layout for an 8-byte input.
pub fn encode(guid: u64) -> String {
    if guid == 0 {
        return SENTINEL_TOKEN.to_string();
    }

    let mut out = String::with_capacity(ENCODED_SYMBOLS + 1);
    for group in 0..ENCODED_SYMBOLS - 1 {
        let shift = 58 - 6 * group;
        let idx = ((guid >> shift) & 0x3f) as usize;
        out.push(ALPHABET[idx] as char);
    }
    let tail = ((guid & 0x0f) << 2) as usize;
    out.push(ALPHABET[tail] as char);
    out.push(PADDING as char);
    out
}

/// Per-session memo of GUID encodings.
///
/// Shared by reference between the capture path and anything that needs the
/// tokens; entries live until the owning session is dropped.
#[derive(Debug, Default)]
pub struct IdentifierEncoder {
    cache: DashMap<u64, Arc<str>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl IdentifierEncoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token for `guid`, computing it on first use.
    pub fn encode(&self, guid: u64) -> Arc<str> {
        if let Some(token) = self.cache.get(&guid) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(token.value());
        }

        self.cache
            .entry(guid)
            .or_insert_with(|| {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Arc::from(encode(guid))
            })
            .value()
            .clone()
    }

    /// Number of distinct GUIDs encoded so far.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether no GUID has been encoded yet.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Lookups served from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that computed a fresh encoding.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
