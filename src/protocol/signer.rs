//! HMAC-SHA256 command signing.
//!
//! Signing flow for the REST command path:
//!
//! 1. Serialize metadata as TLV (epoch, expires_at, counter, optional flags).
//! 2. Derive the signing key: `K' = HMAC-SHA256(K, "authenticated command")`.
//! 3. Tag = `HMAC-SHA256(K', metadata || 0xFF || payload)`.
//!
//! The separator is a bare TAG_END byte (0xFF) with no length prefix.
//! Replay protection comes from the session-scoped counter (strictly
//! increasing, never reused) and the near-future `expires_at`.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::time::Instant;

type HmacSha256 = Hmac<Sha256>;

/// Key derivation labels.
const LABEL_AUTHENTICATED_COMMAND: &[u8] = b"authenticated command";
const LABEL_SESSION_INFO: &[u8] = b"session info";

/// Metadata TLV tags. Order in the stream is fixed:
/// epoch, expires_at, counter, then flags when non-zero.
const TAG_EPOCH: u8 = 3;
const TAG_EXPIRES_AT: u8 = 4;
const TAG_COUNTER: u8 = 5;
const TAG_FLAGS: u8 = 6;
const TAG_END: u8 = 0xFF;

/// Default command validity window in seconds.
const COMMAND_TTL_SECS: u32 = 30;

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC-SHA256 accepts keys of any length.
    #[allow(clippy::expect_used)]
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Derive the command signing key: `HMAC-SHA256(K, "authenticated command")`.
pub fn derive_signing_key(session_key: &[u8]) -> [u8; 32] {
    hmac_sha256(session_key, LABEL_AUTHENTICATED_COMMAND)
}

/// Derive the session-info verification key: `HMAC-SHA256(K, "session info")`.
pub fn derive_session_info_key(session_key: &[u8]) -> [u8; 32] {
    hmac_sha256(session_key, LABEL_SESSION_INFO)
}

/// Compute the authentication tag over `metadata || 0xFF || payload`.
pub fn compute_hmac_tag(signing_key: &[u8], metadata: &[u8], payload: &[u8]) -> [u8; 32] {
    #[allow(clippy::expect_used)]
    let mut mac = HmacSha256::new_from_slice(signing_key).expect("hmac accepts any key length");
    mac.update(metadata);
    mac.update(&[TAG_END]);
    mac.update(payload);
    mac.finalize().into_bytes().into()
}

/// HMAC-SHA256 signature over a serialized configuration document,
/// keyed by the partner secret (used for the telemetry-config JWS).
pub fn compute_config_signature(secret: &[u8], signing_input: &[u8]) -> [u8; 32] {
    hmac_sha256(secret, signing_input)
}

/// Verify the HMAC tag on a session-info response in constant time.
pub fn verify_session_info_tag(
    session_info_key: &[u8],
    session_info: &[u8],
    expected_tag: &[u8],
) -> bool {
    #[allow(clippy::expect_used)]
    let mut mac = HmacSha256::new_from_slice(session_info_key).expect("hmac accepts any key length");
    mac.update(session_info);
    mac.verify_slice(expected_tag).is_ok()
}

/// TLV-encoded signing metadata.
///
/// Field order in the stream is fixed: epoch, expires_at, counter, flags.
#[derive(Debug, Clone)]
pub struct SigningMetadata {
    pub epoch: [u8; 16],
    pub expires_at: u32,
    pub counter: u32,
    pub flags: u32,
}

impl SigningMetadata {
    /// Serialize to the TLV byte stream (without the trailing TAG_END —
    /// the tag computation inserts it as the separator).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 16 + 3 * 6);
        push_tlv(&mut out, TAG_EPOCH, &self.epoch);
        push_tlv(&mut out, TAG_EXPIRES_AT, &self.expires_at.to_be_bytes());
        push_tlv(&mut out, TAG_COUNTER, &self.counter.to_be_bytes());
        if self.flags != 0 {
            push_tlv(&mut out, TAG_FLAGS, &self.flags.to_be_bytes());
        }
        out
    }
}

fn push_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}

/// A signing session: a random epoch, a derived signing key, and a
/// strictly increasing counter.
///
/// Sessions are ephemeral — a process restart creates a fresh epoch, which
/// is why the counter may restart at one.
pub struct CommandSession {
    epoch: [u8; 16],
    signing_key: [u8; 32],
    counter: u32,
    started: Instant,
    clock_offset_secs: u32,
}

impl CommandSession {
    /// Create a session from a shared session key.
    pub fn new(session_key: &[u8]) -> Self {
        let mut epoch = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut epoch);
        Self {
            epoch,
            signing_key: derive_signing_key(session_key),
            counter: 0,
            started: Instant::now(),
            clock_offset_secs: 0,
        }
    }

    /// Adopt a clock offset reported by the peer so `expires_at` lands in
    /// the peer's near future.
    pub fn set_clock_offset(&mut self, offset_secs: u32) {
        self.clock_offset_secs = offset_secs;
    }

    /// Current counter value (the last one issued).
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Sign a command payload. Increments the counter and returns the
    /// encoded metadata plus the 32-byte tag.
    pub fn sign(&mut self, payload: &[u8]) -> (Vec<u8>, [u8; 32]) {
        self.counter += 1;
        let elapsed = self.started.elapsed().as_secs() as u32;
        let metadata = SigningMetadata {
            epoch: self.epoch,
            expires_at: self.clock_offset_secs + elapsed + COMMAND_TTL_SECS,
            counter: self.counter,
            flags: 0,
        };
        let encoded = metadata.encode();
        let tag = compute_hmac_tag(&self.signing_key, &encoded, payload);
        (encoded, tag)
    }

    /// The session epoch bytes.
    pub fn epoch(&self) -> &[u8; 16] {
        &self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_labels_differ() {
        let key = [7u8; 32];
        assert_ne!(derive_signing_key(&key), derive_session_info_key(&key));
    }

    #[test]
    fn test_tag_matches_manual_computation() {
        let session_key = b"0123456789abcdef0123456789abcdef";
        let signing_key = derive_signing_key(session_key);
        let metadata = b"\x03\x02ab";
        let payload = b"lock-doors";

        let tag = compute_hmac_tag(&signing_key, metadata, payload);

        // Manual: HMAC over metadata || 0xFF || payload as one buffer.
        let mut buf = metadata.to_vec();
        buf.push(0xFF);
        buf.extend_from_slice(payload);
        assert_eq!(tag, hmac_sha256(&signing_key, &buf));
    }

    #[test]
    fn test_separator_is_bare_0xff() {
        // A tag computed with a length-prefixed separator must differ.
        let signing_key = derive_signing_key(b"key");
        let tag = compute_hmac_tag(&signing_key, b"meta", b"payload");

        let mut wrong = b"meta".to_vec();
        wrong.extend_from_slice(&[0xFF, 0x07]); // 0xFF plus a length byte
        wrong.extend_from_slice(b"payload");
        assert_ne!(tag.to_vec(), hmac_sha256(&signing_key, &wrong).to_vec());
    }

    #[test]
    fn test_session_info_verify_roundtrip() {
        let key = derive_session_info_key(b"shared");
        let info = b"session-info-bytes";
        let tag = hmac_sha256(&key, info);

        assert!(verify_session_info_tag(&key, info, &tag));

        let mut bad = tag;
        bad[0] ^= 1;
        assert!(!verify_session_info_tag(&key, info, &bad));
    }

    #[test]
    fn test_metadata_tlv_order() {
        let meta = SigningMetadata {
            epoch: [0xAA; 16],
            expires_at: 0x0102_0304,
            counter: 7,
            flags: 0,
        };
        let encoded = meta.encode();

        // epoch first
        assert_eq!(encoded[0], 3);
        assert_eq!(encoded[1], 16);
        // expires_at follows the epoch value
        assert_eq!(encoded[18], 4);
        assert_eq!(&encoded[20..24], &[1, 2, 3, 4]);
        // counter last (flags omitted when zero)
        assert_eq!(encoded[24], 5);
        assert_eq!(encoded.len(), 24 + 6);
    }

    #[test]
    fn test_counter_strictly_increases() {
        let mut session = CommandSession::new(b"session-key");
        let mut last = 0;
        for _ in 0..10 {
            session.sign(b"payload");
            assert!(session.counter() > last);
            last = session.counter();
        }
    }
}
