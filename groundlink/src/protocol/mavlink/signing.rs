//! MAVLink 2 packet signing.
//!
//! ```text
//! +---------+----------------+--------------------------------------------------+
//! | link id | timestamp      | SHA-256(key | frame | link id | timestamp)[0..6]  |
//! +---------+----------------+--------------------------------------------------+
//! |    1    | 6 LE, 10us     |                      6                           |
//! +---------+----------------+--------------------------------------------------+
//! ```
//!
//! `frame` is the header, payload and CRC of the signed packet. Timestamps
//! count 10 microsecond ticks since 2015-01-01T00:00:00Z.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::trace;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Secret key length.
pub const SECRET_KEY_LEN: usize = 32;

/// Signature block length (link id, timestamp, tag).
pub const SIGNATURE_LEN: usize = 13;

/// Truncated SHA-256 tag length.
pub const TAG_LEN: usize = 6;

/// Signing epoch as Unix seconds (2015-01-01T00:00:00Z).
pub const SIGNING_EPOCH_UNIX_SECS: u64 = 1_420_070_400;

/// Default freshness window.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60);

const TIMESTAMP_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Signing timestamp for a point in time.
///
/// Times before the signing epoch map to zero.
#[allow(clippy::cast_possible_truncation)]
pub fn timestamp_from_system_time(time: SystemTime) -> u64 {
    let epoch = UNIX_EPOCH + Duration::from_secs(SIGNING_EPOCH_UNIX_SECS);
    time.duration_since(epoch)
        .map_or(0, |d| (d.as_micros() / 10) as u64 & TIMESTAMP_MASK)
}

/// Signing timestamp for now.
pub fn current_timestamp() -> u64 {
    timestamp_from_system_time(SystemTime::now())
}

/// Convert a duration to signing ticks.
#[allow(clippy::cast_possible_truncation)]
pub fn duration_to_ticks(duration: Duration) -> u64 {
    (duration.as_micros() / 10) as u64
}

/// Freshness policy for [`verify_signature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureVerifyOptions {
    /// Reject signatures whose timestamp differs from now by more than this.
    /// `None` disables the check.
    pub max_age: Option<Duration>,
}

impl Default for SignatureVerifyOptions {
    fn default() -> Self {
        Self {
            max_age: Some(DEFAULT_MAX_AGE),
        }
    }
}

impl SignatureVerifyOptions {
    /// Options with the freshness check turned off.
    pub fn without_freshness() -> Self {
        Self { max_age: None }
    }

    /// Set the freshness window.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() == SECRET_KEY_LEN {
        Ok(())
    } else {
        Err(Error::InvalidSigningInput(format!(
            "secret key must be {SECRET_KEY_LEN} bytes, got {}",
            key.len()
        )))
    }
}

fn compute_tag(key: &[u8], data: &[u8], link_id: u8, timestamp: &[u8]) -> [u8; TAG_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(data);
    hasher.update([link_id]);
    hasher.update(timestamp);
    let digest = hasher.finalize();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    tag
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Build the 13-byte signature block for `data` (header, payload and CRC).
pub fn create_signature(
    key: &[u8],
    data: &[u8],
    link_id: u8,
    timestamp: u64,
) -> Result<[u8; SIGNATURE_LEN]> {
    check_key(key)?;
    let ts = (timestamp & TIMESTAMP_MASK).to_le_bytes();
    let tag = compute_tag(key, data, link_id, &ts[..6]);

    let mut sig = [0u8; SIGNATURE_LEN];
    sig[0] = link_id;
    sig[1..7].copy_from_slice(&ts[..6]);
    sig[7..].copy_from_slice(&tag);
    Ok(sig)
}

/// Timestamp carried in a signature block.
pub fn signature_timestamp(signature: &[u8; SIGNATURE_LEN]) -> u64 {
    let mut ts = [0u8; 8];
    ts[..6].copy_from_slice(&signature[1..7]);
    u64::from_le_bytes(ts)
}

/// Verify a signature block against the current time.
///
/// Wrong key or signature lengths are errors. A tag mismatch or stale
/// timestamp yields `Ok(false)`.
pub fn verify_signature(
    key: &[u8],
    data: &[u8],
    signature: &[u8],
    options: &SignatureVerifyOptions,
) -> Result<bool> {
    verify_signature_at(key, data, signature, options, current_timestamp())
}

/// Verify a signature block against an explicit `now` timestamp.
pub fn verify_signature_at(
    key: &[u8],
    data: &[u8],
    signature: &[u8],
    options: &SignatureVerifyOptions,
    now: u64,
) -> Result<bool> {
    check_key(key)?;
    let signature: &[u8; SIGNATURE_LEN] = signature.try_into().map_err(|_| {
        Error::InvalidSigningInput(format!(
            "signature must be {SIGNATURE_LEN} bytes, got {}",
            signature.len()
        ))
    })?;

    let expected = compute_tag(key, data, signature[0], &signature[1..7]);
    if !constant_time_eq(&expected, &signature[7..]) {
        trace!("Signature tag mismatch on link {}", signature[0]);
        return Ok(false);
    }

    if let Some(max_age) = options.max_age {
        let timestamp = signature_timestamp(signature);
        if now.abs_diff(timestamp) > duration_to_ticks(max_age) {
            trace!("Signature timestamp {timestamp} outside window (now {now})");
            return Ok(false);
        }
    }

    Ok(true)
}

/// Signs outgoing frames on one link.
///
/// Timestamps strictly increase across calls, even when the clock does not.
#[derive(Clone)]
pub struct Signer {
    key: [u8; SECRET_KEY_LEN],
    link_id: u8,
    last_timestamp: u64,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("link_id", &self.link_id)
            .field("last_timestamp", &self.last_timestamp)
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Create a signer from a 32-byte secret key.
    pub fn new(key: &[u8], link_id: u8) -> Result<Self> {
        check_key(key)?;
        let mut owned = [0u8; SECRET_KEY_LEN];
        owned.copy_from_slice(key);
        Ok(Self {
            key: owned,
            link_id,
            last_timestamp: 0,
        })
    }

    /// Link id placed in every signature.
    pub fn link_id(&self) -> u8 {
        self.link_id
    }

    /// Secret key.
    pub fn key(&self) -> &[u8; SECRET_KEY_LEN] {
        &self.key
    }

    /// Next timestamp: the current time, or one tick past the last one.
    pub fn next_timestamp(&mut self) -> u64 {
        let ts = current_timestamp().max(self.last_timestamp + 1);
        self.last_timestamp = ts;
        ts
    }

    /// Sign `data` (header, payload and CRC) with the next timestamp.
    pub fn sign(&mut self, data: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        let ts = self.next_timestamp();
        create_signature(&self.key, data, self.link_id, ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];
    const DATA: &[u8] = &[0xFD, 0x09, 0x01, 0x00, 0x10, 0x01, 0x01, 0x00, 0x00, 0x00, 0xAA, 0xBB];

    #[test]
    fn test_create_then_verify() {
        let now = 1_000_000;
        let sig = create_signature(&KEY, DATA, 5, now).unwrap();
        assert_eq!(sig[0], 5);
        assert_eq!(signature_timestamp(&sig), now);

        let opts = SignatureVerifyOptions::default();
        assert!(verify_signature_at(&KEY, DATA, &sig, &opts, now).unwrap());
    }

    #[test]
    fn test_verify_fails_on_altered_data_or_key() {
        let sig = create_signature(&KEY, DATA, 0, 10).unwrap();
        let opts = SignatureVerifyOptions::without_freshness();

        for i in 0..DATA.len() {
            let mut altered = DATA.to_vec();
            altered[i] ^= 0x01;
            assert!(!verify_signature_at(&KEY, &altered, &sig, &opts, 10).unwrap());
        }

        let mut other_key = KEY;
        other_key[31] ^= 0x80;
        assert!(!verify_signature_at(&other_key, DATA, &sig, &opts, 10).unwrap());
    }

    #[test]
    fn test_verify_fails_on_altered_link_id() {
        let mut sig = create_signature(&KEY, DATA, 1, 10).unwrap();
        sig[0] = 2;
        let opts = SignatureVerifyOptions::without_freshness();
        assert!(!verify_signature_at(&KEY, DATA, &sig, &opts, 10).unwrap());
    }

    #[test]
    fn test_freshness_window() {
        let ts = 50_000_000;
        let sig = create_signature(&KEY, DATA, 0, ts).unwrap();
        let opts = SignatureVerifyOptions::default();
        let window = duration_to_ticks(DEFAULT_MAX_AGE);

        assert!(verify_signature_at(&KEY, DATA, &sig, &opts, ts + window).unwrap());
        assert!(!verify_signature_at(&KEY, DATA, &sig, &opts, ts + window + 1).unwrap());
        assert!(!verify_signature_at(&KEY, DATA, &sig, &opts, ts - window - 1).unwrap());

        let no_check = SignatureVerifyOptions::without_freshness();
        assert!(verify_signature_at(&KEY, DATA, &sig, &no_check, ts * 4).unwrap());
    }

    #[test]
    fn test_bad_lengths_are_errors() {
        assert!(matches!(
            create_signature(&[0u8; 16], DATA, 0, 0),
            Err(Error::InvalidSigningInput(_))
        ));
        let opts = SignatureVerifyOptions::default();
        assert!(matches!(
            verify_signature(&KEY, DATA, &[0u8; 12], &opts),
            Err(Error::InvalidSigningInput(_))
        ));
        assert!(Signer::new(&[0u8; 31], 0).is_err());
    }

    #[test]
    fn test_fresh_signature_verifies_against_clock() {
        let mut signer = Signer::new(&KEY, 9).unwrap();
        let sig = signer.sign(DATA).unwrap();
        assert!(verify_signature(&KEY, DATA, &sig, &SignatureVerifyOptions::default()).unwrap());
    }

    #[test]
    fn test_signer_timestamps_increase() {
        let mut signer = Signer::new(&KEY, 0).unwrap();
        let a = signer.next_timestamp();
        let b = signer.next_timestamp();
        let c = signer.next_timestamp();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_timestamp_epoch() {
        let epoch = UNIX_EPOCH + Duration::from_secs(SIGNING_EPOCH_UNIX_SECS);
        assert_eq!(timestamp_from_system_time(epoch), 0);
        assert_eq!(timestamp_from_system_time(epoch + Duration::from_millis(1)), 100);
        assert_eq!(timestamp_from_system_time(UNIX_EPOCH), 0);
    }

    #[test]
    fn test_signer_debug_hides_key() {
        let signer = Signer::new(&KEY, 1).unwrap();
        let dbg = format!("{signer:?}");
        assert!(!dbg.contains("66"));
        assert!(dbg.contains("link_id"));
    }
}
