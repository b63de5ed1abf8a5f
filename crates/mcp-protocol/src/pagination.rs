//! Opaque, signed cursor tokens for list endpoints.
//!
//! `cursor = base64url(offset_varint || HMAC-SHA256(key, offset_varint)[:16])`.
//! Decoding failure of any kind (bad base64, truncated tag, bad signature)
//! is a single `ProtocolError::InvalidCursor`, which the dispatcher maps to
//! `-32602`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use subtle::ConstantTimeEq;

use crate::error::ProtocolError;

const TAG_LEN: usize = 16;

/// Default page size for list methods.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// A session's cursor-signing key, derived from a process secret and
/// used to HMAC-sign pagination cursors.
#[derive(Clone)]
pub struct CursorKey(hmac::Key);

impl CursorKey {
    /// Wrap raw key bytes (e.g. a configured `cursor_signing_key`).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hmac::Key::new(hmac::HMAC_SHA256, bytes))
    }

    /// Generate a fresh random key, used as the fallback when no signing
    /// key is configured explicitly at startup.
    pub fn generate() -> Self {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes)
            .expect("system RNG must be available to mint a cursor key");
        Self::from_bytes(&bytes)
    }

    /// Encode a page offset into an opaque cursor string.
    pub fn encode(&self, offset: u64) -> String {
        let mut buf = encode_varint(offset);
        let tag = hmac::sign(&self.0, &buf);
        buf.extend_from_slice(&tag.as_ref()[..TAG_LEN]);
        URL_SAFE_NO_PAD.encode(buf)
    }

    /// Derive a per-session key from this process-level key and a session
    /// id, so a cursor minted under one session never verifies against
    /// another's.
    pub fn derive_for_session(&self, session_id: &str) -> Self {
        let tag = hmac::sign(&self.0, session_id.as_bytes());
        Self::from_bytes(tag.as_ref())
    }

    /// Decode and verify a cursor, yielding the offset it encodes.
    pub fn decode(&self, cursor: &str) -> Result<u64, ProtocolError> {
        let raw = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|_| ProtocolError::InvalidCursor)?;
        if raw.len() <= TAG_LEN {
            return Err(ProtocolError::InvalidCursor);
        }
        let (offset_bytes, tag) = raw.split_at(raw.len() - TAG_LEN);
        let expected = hmac::sign(&self.0, offset_bytes);
        if expected.as_ref()[..TAG_LEN].ct_eq(tag).unwrap_u8() != 1 {
            return Err(ProtocolError::InvalidCursor);
        }
        let (offset, consumed) = decode_varint(offset_bytes).ok_or(ProtocolError::InvalidCursor)?;
        if consumed != offset_bytes.len() {
            return Err(ProtocolError::InvalidCursor);
        }
        Ok(offset)
    }
}

/// Decode an optional cursor into an offset: `None`/absent means "start of
/// list" (offset 0).
pub fn decode_cursor_or_start(
    key: &CursorKey,
    cursor: Option<&str>,
) -> Result<u64, ProtocolError> {
    match cursor {
        None => Ok(0),
        Some(c) => key.decode(c),
    }
}

fn encode_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
    out
}

fn decode_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_offsets() {
        let key = CursorKey::from_bytes(b"test-key-0123456789abcdef");
        for offset in [0u64, 1, 100, 65535, u32::MAX as u64, u64::MAX] {
            let cursor = key.encode(offset);
            assert_eq!(key.decode(&cursor).unwrap(), offset);
        }
    }

    #[test]
    fn rejects_cursor_from_a_different_key() {
        let key_a = CursorKey::from_bytes(b"key-a-0000000000000000000000");
        let key_b = CursorKey::from_bytes(b"key-b-1111111111111111111111");
        let cursor = key_a.encode(42);
        assert_eq!(key_b.decode(&cursor), Err(ProtocolError::InvalidCursor));
    }

    #[test]
    fn rejects_garbage_cursor() {
        let key = CursorKey::from_bytes(b"test-key-0123456789abcdef");
        assert_eq!(key.decode("not-a-cursor!!"), Err(ProtocolError::InvalidCursor));
        assert_eq!(key.decode(""), Err(ProtocolError::InvalidCursor));
    }

    #[test]
    fn rejects_truncated_tag() {
        let key = CursorKey::from_bytes(b"test-key-0123456789abcdef");
        let cursor = key.encode(7);
        let mut raw = URL_SAFE_NO_PAD.decode(&cursor).unwrap();
        raw.truncate(1);
        let short = URL_SAFE_NO_PAD.encode(raw);
        assert_eq!(key.decode(&short), Err(ProtocolError::InvalidCursor));
    }

    #[test]
    fn derived_session_keys_reject_each_others_cursors() {
        let process_key = CursorKey::from_bytes(b"process-secret-0123456789abcdef");
        let key_a = process_key.derive_for_session("mcp-aaaa");
        let key_b = process_key.derive_for_session("mcp-bbbb");
        let cursor = key_a.encode(7);
        assert_eq!(key_b.decode(&cursor), Err(ProtocolError::InvalidCursor));
        assert_eq!(key_a.decode(&cursor), Ok(7));
    }

    #[test]
    fn absent_cursor_starts_at_zero() {
        let key = CursorKey::from_bytes(b"test-key-0123456789abcdef");
        assert_eq!(decode_cursor_or_start(&key, None).unwrap(), 0);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn encode_decode_round_trips_any_offset(offset in any::<u64>()) {
            let key = CursorKey::from_bytes(b"proptest-key-0123456789abcdef01");
            let cursor = key.encode(offset);
            prop_assert_eq!(key.decode(&cursor), Ok(offset));
        }

        #[test]
        fn tampering_with_any_cursor_byte_is_rejected(
            offset in any::<u64>(),
            flip_index in 0usize..10,
        ) {
            let key = CursorKey::from_bytes(b"proptest-key-0123456789abcdef01");
            let cursor = key.encode(offset);
            let mut raw = URL_SAFE_NO_PAD.decode(&cursor).unwrap();
            let idx = flip_index % raw.len();
            raw[idx] ^= 0xff;
            let tampered = URL_SAFE_NO_PAD.encode(raw);
            // Flipping a byte either breaks base64 decoding or the HMAC tag;
            // either way the cursor must never verify as the original offset.
            prop_assert_ne!(key.decode(&tampered), Ok(offset));
        }
    }
}
