//! Forward-secure pseudo-random key (FSPRG) used by journal sealing.
//!
//! The key state for epoch `e + 1` is the state for epoch `e` squared modulo a
//! Blum integer `n = p·q`.  Whoever holds the state for some epoch can compute
//! every later state, but not an earlier one.  The holder of the factors can
//! jump to any epoch directly:
//!
//! ```text
//! state(e) = x^(2^e mod φ(n)) mod n          (secret key, O(log e))
//! state(e) = state(e₀)^(2^(e-e₀)) mod n      (any key,    O(e - e₀))
//! ```
//!
//! Both paths are required to agree bit-for-bit for every epoch at or after
//! the checkpoint epoch.
//!
//! # MAC key derivation
//! The per-epoch HMAC-SHA-256 key is the 32-byte expansion (index 0) of
//! `n_be ‖ state_be ‖ epoch_be64`, the two bignums left-padded to `secpar/8`.

mod checkpoint;
mod prime;

use chrono::DateTime;
use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use num_traits::One;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::seal::SealError;
use crate::view::ViewError;

pub use checkpoint::{CHECKPOINT_HEADER_SIZE, CHECKPOINT_MAGIC};

pub type HmacSha256 = Hmac<Sha256>;

/// Security parameter in bits (size of `n`).
pub const SECPAR: u16 = 1536;
/// Length of the textual seed in bytes.
pub const SEED_LEN: usize = 12;
/// Length of a seal MAC.
pub const MAC_LEN: usize = 32;

// Expansion indices (domain separation).
const RND_GEN_MAC: u32 = 0;
const RND_GEN_P: u32 = 1;
const RND_GEN_Q: u32 = 2;
const RND_GEN_X: u32 = 3;

/// Default sealing interval: 15 minutes.
pub const DEFAULT_INTERVAL_USEC: u64 = 15 * 60 * 1_000_000;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("cannot evolve key backwards: epoch {requested} < checkpoint epoch {min_epoch}")]
    EpochRegression { requested: u64, min_epoch: u64 },
    #[error("fast evaluation needs the secret factorisation; this key is a checkpoint")]
    NoTotient,
    #[error("invalid seed: {0}")]
    InvalidSeed(String),
    #[error("bad key-checkpoint signature")]
    BadCheckpointMagic,
    #[error("unsupported key checkpoint: {0}")]
    UnsupportedCheckpoint(String),
    #[error("key checkpoint declares {declared} bytes, file has {actual}")]
    CheckpointSizeMismatch { declared: u64, actual: u64 },
    #[error("cannot key the seal MAC for epoch {epoch}")]
    MacKey { epoch: u64 },
    #[error("key checkpoint truncated: {0}")]
    Truncated(#[from] ViewError),
}

/// What the holder of a key is able to do.
#[derive(Debug, Clone)]
pub enum Capability {
    /// Knows the seed and thereby `φ(n)`; can evaluate any epoch directly.
    Secret { seed: [u8; SEED_LEN], totient: BigUint },
    /// Knows `n` and one state; can only square forward from it.
    Checkpoint,
}

#[derive(Debug, Clone)]
pub struct FsKey {
    modulus:       BigUint,
    /// State at `epoch`.
    state:         BigUint,
    epoch:         u64,
    secpar:        u16,
    start_usec:    u64,
    interval_usec: u64,
    capability:    Capability,
}

impl FsKey {
    // ── Construction ─────────────────────────────────────────────────────────

    /// Parse the textual verification key `HH-HH…/EPOCH-INTERVAL` and derive
    /// the full secret key from it.
    pub fn from_seed(text: &str) -> Result<Self, KeyError> {
        let (seed_part, window) = text
            .trim()
            .split_once('/')
            .ok_or_else(|| KeyError::InvalidSeed("missing '/'".into()))?;
        let hex_digits: String = seed_part.chars().filter(|&c| c != '-').collect();
        let raw = hex::decode(&hex_digits).map_err(|e| KeyError::InvalidSeed(e.to_string()))?;
        if raw.len() != SEED_LEN {
            return Err(KeyError::InvalidSeed(format!(
                "seed has {} bytes, expected {SEED_LEN}",
                raw.len()
            )));
        }
        let mut seed = [0u8; SEED_LEN];
        seed.copy_from_slice(&raw);

        let (start_part, interval_part) = window
            .split_once('-')
            .ok_or_else(|| KeyError::InvalidSeed("missing '-' in epoch window".into()))?;
        let start_epoch = u64::from_str_radix(start_part, 16)
            .map_err(|e| KeyError::InvalidSeed(e.to_string()))?;
        let interval_usec = u64::from_str_radix(interval_part, 16)
            .map_err(|e| KeyError::InvalidSeed(e.to_string()))?;
        if interval_usec == 0 {
            return Err(KeyError::InvalidSeed("zero interval".into()));
        }
        let start_usec = start_epoch
            .checked_mul(interval_usec)
            .ok_or_else(|| KeyError::InvalidSeed("epoch window overflows".into()))?;

        Ok(Self::from_seed_bytes(seed, start_usec, interval_usec))
    }

    /// Derive the secret key from raw seed bytes.
    pub fn from_seed_bytes(seed: [u8; SEED_LEN], start_usec: u64, interval_usec: u64) -> Self {
        let half = (SECPAR / 2) as usize;
        let p = gen_prime_3mod4(&seed, half, RND_GEN_P);
        let q = gen_prime_3mod4(&seed, half, RND_GEN_Q);
        let modulus = &p * &q;
        let totient = (&p - BigUint::one()) * (&q - BigUint::one());
        let state = gen_square(&seed, &modulus, SECPAR as usize, RND_GEN_X);
        Self {
            modulus,
            state,
            epoch: 0,
            secpar: SECPAR,
            start_usec,
            interval_usec,
            capability: Capability::Secret { seed, totient },
        }
    }

    /// Fresh random key whose epoch 0 starts at the interval boundary at or
    /// before `now_usec`.
    pub fn generate(interval_usec: u64, now_usec: u64) -> Self {
        let mut seed = [0u8; SEED_LEN];
        rand::thread_rng().fill_bytes(&mut seed);
        let interval_usec = interval_usec.max(1);
        let start_usec = now_usec / interval_usec * interval_usec;
        Self::from_seed_bytes(seed, start_usec, interval_usec)
    }

    /// The textual verification key for a secret key (`None` for checkpoints).
    pub fn verification_key(&self) -> Option<String> {
        match &self.capability {
            Capability::Secret { seed, .. } => {
                let mut out = String::new();
                for (i, b) in seed.iter().enumerate() {
                    out.push_str(&format!("{b:02x}"));
                    if i % 3 == 2 && i + 1 != seed.len() {
                        out.push('-');
                    }
                }
                out.push_str(&format!(
                    "/{:x}-{:x}",
                    self.start_usec / self.interval_usec,
                    self.interval_usec
                ));
                Some(out)
            }
            Capability::Checkpoint => None,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    /// First epoch this key can evaluate.
    pub fn min_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn secpar(&self) -> u16 {
        self.secpar
    }

    pub fn start_usec(&self) -> u64 {
        self.start_usec
    }

    pub fn interval_usec(&self) -> u64 {
        self.interval_usec
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn is_secret(&self) -> bool {
        matches!(self.capability, Capability::Secret { .. })
    }

    pub fn seed(&self) -> Option<&[u8; SEED_LEN]> {
        match &self.capability {
            Capability::Secret { seed, .. } => Some(seed),
            Capability::Checkpoint => None,
        }
    }

    // ── State evolution ──────────────────────────────────────────────────────

    /// State at `epoch`, via the fastest path this key supports.
    pub fn state(&self, epoch: u64) -> Result<BigUint, KeyError> {
        match self.capability {
            Capability::Secret { .. } if self.epoch == 0 => self.state_fast(epoch),
            _ => self.state_linear(epoch),
        }
    }

    /// Square the checkpoint state `epoch - min_epoch` times.
    pub fn state_linear(&self, epoch: u64) -> Result<BigUint, KeyError> {
        if epoch < self.epoch {
            return Err(KeyError::EpochRegression { requested: epoch, min_epoch: self.epoch });
        }
        let mut r = self.state.clone();
        for _ in self.epoch..epoch {
            r = (&r * &r) % &self.modulus;
        }
        Ok(r)
    }

    /// `x^(2^epoch mod φ(n)) mod n`, secret keys only.
    pub fn state_fast(&self, epoch: u64) -> Result<BigUint, KeyError> {
        match &self.capability {
            Capability::Secret { totient, .. } => {
                if epoch < self.epoch {
                    return Err(KeyError::EpochRegression { requested: epoch, min_epoch: self.epoch });
                }
                let exponent = BigUint::from(2u32).modpow(&BigUint::from(epoch - self.epoch), totient);
                Ok(self.state.modpow(&exponent, &self.modulus))
            }
            Capability::Checkpoint => Err(KeyError::NoTotient),
        }
    }

    /// A checkpoint-only copy of this key, evolved to `epoch`.  This is what
    /// the daemon leaves on disk after sealing epoch `epoch - 1`.
    pub fn checkpoint_at(&self, epoch: u64) -> Result<FsKey, KeyError> {
        Ok(FsKey {
            modulus:       self.modulus.clone(),
            state:         self.state(epoch)?,
            epoch,
            secpar:        self.secpar,
            start_usec:    self.start_usec,
            interval_usec: self.interval_usec,
            capability:    Capability::Checkpoint,
        })
    }

    // ── MAC derivation ───────────────────────────────────────────────────────

    /// 32-byte HMAC key for `epoch`, given that epoch's state.
    pub fn mac_key(&self, state: &BigUint, epoch: u64) -> [u8; MAC_LEN] {
        let width = (self.secpar / 8) as usize;
        let mut seed = Vec::with_capacity(width * 2 + 8);
        seed.extend(fixed_be(&self.modulus, width));
        seed.extend(fixed_be(state, width));
        seed.extend_from_slice(&epoch.to_be_bytes());
        let mut key = [0u8; MAC_LEN];
        key.copy_from_slice(&expand(&seed, RND_GEN_MAC, MAC_LEN));
        key
    }

    /// Keyed-hash context that seals epoch `epoch`.
    pub fn seal_hasher(&self, state: &BigUint, epoch: u64) -> Result<HmacSha256, KeyError> {
        let key = self.mac_key(state, epoch);
        HmacSha256::new_from_slice(&key).map_err(|_| KeyError::MacKey { epoch })
    }

    // ── Epoch windows ────────────────────────────────────────────────────────

    /// Realtime window `[start, end)` of `epoch`, in microseconds.
    pub fn epoch_window(&self, epoch: u64) -> (u64, u64) {
        let start = epoch.saturating_mul(self.interval_usec).saturating_add(self.start_usec);
        (start, start.saturating_add(self.interval_usec))
    }

    /// Epoch that realtime `usec` falls in (0 before the key's start).
    pub fn epoch_at(&self, usec: u64) -> u64 {
        usec.saturating_sub(self.start_usec) / self.interval_usec
    }

    /// Check that entries with realtimes in `[min_ts, max_ts]` may be sealed
    /// by a tag of `epoch`.
    pub fn validate_epoch(&self, min_ts: u64, max_ts: u64, epoch: u64) -> Result<(), SealError> {
        let (start, end) = self.epoch_window(epoch);
        if min_ts < start || max_ts >= end {
            return Err(SealError::EpochWindowViolation {
                epoch,
                window_start: start,
                window_end: end,
                min_realtime: min_ts,
                max_realtime: max_ts,
            });
        }
        Ok(())
    }

    /// `"<start> -- <end>"` for log lines.
    pub fn describe_epoch(&self, epoch: u64) -> String {
        let (start, end) = self.epoch_window(epoch);
        format!("{} -- {}", format_usec(start), format_usec(end))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Render a realtime in microseconds as an RFC 3339 UTC timestamp.
pub fn format_usec(usec: u64) -> String {
    let secs = (usec / 1_000_000) as i64;
    let nanos = ((usec % 1_000_000) * 1000) as u32;
    match DateTime::from_timestamp(secs, nanos) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S%.6f UTC").to_string(),
        None => format!("@{usec}"),
    }
}

/// Deterministic expansion of `seed` into `len` bytes:
/// `SHA256(seed ‖ idx_be32 ‖ ctr_be32)` for `ctr = 0, 1, …`, concatenated.
pub fn expand(seed: &[u8], idx: u32, len: usize) -> Vec<u8> {
    let mut prefix = Sha256::new();
    prefix.update(seed);
    prefix.update(idx.to_be_bytes());

    let mut out = Vec::with_capacity(len);
    let mut ctr: u32 = 0;
    while out.len() < len {
        let mut block = prefix.clone();
        block.update(ctr.to_be_bytes());
        let digest = block.finalize();
        let take = (len - out.len()).min(digest.len());
        out.extend_from_slice(&digest[..take]);
        ctr += 1;
    }
    out
}

/// Big-endian bytes of `value`, left-padded (or truncated from the left)
/// to exactly `width` bytes.
pub(crate) fn fixed_be(value: &BigUint, width: usize) -> Vec<u8> {
    let raw = value.to_bytes_be();
    if raw.len() >= width {
        return raw[raw.len() - width..].to_vec();
    }
    let mut out = vec![0u8; width - raw.len()];
    out.extend(raw);
    out
}

/// Prime of `bits` bits, `≡ 3 (mod 4)`, with its top two bits set so that
/// the product of two such primes has full length.
fn gen_prime_3mod4(seed: &[u8], bits: usize, idx: u32) -> BigUint {
    let len = bits / 8;
    let mut buf = expand(seed, idx, len);
    buf[0] |= 0xc0;
    buf[len - 1] |= 0x03;
    prime::next_prime_step4(BigUint::from_bytes_be(&buf))
}

/// Square of a pseudo-random value below `n`.
fn gen_square(seed: &[u8], modulus: &BigUint, bits: usize, idx: u32) -> BigUint {
    let mut buf = expand(seed, idx, bits / 8);
    buf[0] &= 0x7f;
    let x = BigUint::from_bytes_be(&buf);
    (&x * &x) % modulus
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    const SEED: &str = "bf10b7-475683-760414-8cbe5e/1c3fa1-35a4e900";

    fn key() -> &'static FsKey {
        static KEY: OnceLock<FsKey> = OnceLock::new();
        KEY.get_or_init(|| FsKey::from_seed(SEED).unwrap())
    }

    #[test]
    fn parses_textual_seed() {
        let k = key();
        assert_eq!(hex::encode(k.seed().unwrap()), "bf10b74756837604148cbe5e");
        assert_eq!(k.interval_usec(), 0x35a4e900);
        assert_eq!(k.start_usec(), 0x1c3fa1 * 0x35a4e900);
        assert_eq!(k.verification_key().as_deref(), Some(SEED));
    }

    #[test]
    fn rejects_malformed_seeds() {
        for bad in ["bf10b7-475683", "bf10b7-475683-760414-8cbe/1-2", "zz10b7-475683-760414-8cbe5e/1-2",
                    "bf10b7-475683-760414-8cbe5e/1", "bf10b7-475683-760414-8cbe5e/1-0"] {
            assert!(matches!(FsKey::from_seed(bad), Err(KeyError::InvalidSeed(_))), "{bad}");
        }
    }

    #[test]
    fn modulus_has_full_length_and_blum_factors() {
        let k = key();
        assert_eq!(k.modulus().bits(), SECPAR as u64);
        // n = p·q with p ≡ q ≡ 3 (mod 4) gives n ≡ 1 (mod 4).
        assert_eq!(k.modulus() % 4u32, BigUint::from(1u32));
    }

    #[test]
    fn linear_and_fast_paths_agree() {
        let k = key();
        assert_eq!(k.state_linear(0x19f2).unwrap(), k.state_fast(0x19f2).unwrap());
        assert_eq!(k.state_linear(0).unwrap(), k.state_fast(0).unwrap());
        assert_eq!(k.state_linear(1).unwrap(), k.state_fast(1).unwrap());
    }

    #[test]
    fn seed_derives_the_reference_modulus_and_states() {
        let k = key();
        let digest = |v: &BigUint| hex::encode(Sha256::digest(fixed_be(v, 192)));
        assert_eq!(digest(k.modulus()), "1a1dc6fc49febe19c3c828481a8924e1cfe0249e12d617820a7b67834460f78c");
        assert_eq!(k.modulus() % (BigUint::one() << 64u32), BigUint::from(0x9b6b_aa13_4c2a_a705u64));

        let s0 = k.state(0).unwrap();
        assert_eq!(digest(&s0), "2bd25cc35494dc1c02e65ce7388b0d752a929d31d611dd94c6b61d079a362c1a");
        assert_eq!(
            digest(&k.state(1).unwrap()),
            "1878fd0fa041bd7f7380b6b0d82a8812cc3040f6a418b7017deb0039bf4719f3"
        );
        assert_eq!(
            hex::encode(k.mac_key(&s0, 0)),
            "c193591793b6fbc1258d42ec09bea471553e35ec7d849384f3fff4bb1435c5cd"
        );

        let mut mac = k.seal_hasher(&s0, 0).unwrap();
        mac.update(b"MESSAGE=hello");
        assert_eq!(
            hex::encode(mac.finalize().into_bytes()),
            "99298612db4df89768352fc4a6051d3b820517692b22b58cafed57fa21b621dc"
        );
    }

    #[test]
    fn state_zero_is_the_initial_square() {
        let k = key();
        let seed = k.seed().unwrap();
        assert_eq!(k.state(0).unwrap(), gen_square(seed, k.modulus(), SECPAR as usize, RND_GEN_X));
    }

    #[test]
    fn checkpoint_cannot_go_backwards() {
        let cp = key().checkpoint_at(10).unwrap();
        assert_eq!(cp.min_epoch(), 10);
        assert!(matches!(
            cp.state(9),
            Err(KeyError::EpochRegression { requested: 9, min_epoch: 10 })
        ));
        assert!(matches!(cp.state_fast(12), Err(KeyError::NoTotient)));
        assert_eq!(cp.state(12).unwrap(), key().state(12).unwrap());
    }

    #[test]
    fn expand_is_counter_mode_sha256() {
        let out = expand(b"seed", 7, 40);
        let mut first = Sha256::new();
        first.update(b"seed");
        first.update(7u32.to_be_bytes());
        first.update(0u32.to_be_bytes());
        assert_eq!(&out[..32], first.finalize().as_slice());
        let mut second = Sha256::new();
        second.update(b"seed");
        second.update(7u32.to_be_bytes());
        second.update(1u32.to_be_bytes());
        assert_eq!(&out[32..], &second.finalize()[..8]);
    }

    #[test]
    fn mac_key_depends_on_epoch_and_state() {
        let k = key();
        let s = k.state(3).unwrap();
        assert_ne!(k.mac_key(&s, 3), k.mac_key(&s, 4));
        assert_ne!(k.mac_key(&s, 3), k.mac_key(&k.state(4).unwrap(), 3));
        assert_eq!(k.mac_key(&s, 3), k.checkpoint_at(2).unwrap().mac_key(&s, 3));
    }

    #[test]
    fn epoch_windows() {
        let k = FsKey {
            modulus: BigUint::from(77u32),
            state: BigUint::from(4u32),
            epoch: 0,
            secpar: 16,
            start_usec: 1_000,
            interval_usec: 100,
            capability: Capability::Checkpoint,
        };
        assert_eq!(k.epoch_window(2), (1_200, 1_300));
        assert_eq!(k.epoch_at(1_299), 2);
        assert!(k.validate_epoch(1_200, 1_299, 2).is_ok());
        assert!(matches!(k.validate_epoch(1_199, 1_250, 2), Err(SealError::EpochWindowViolation { .. })));
        assert!(matches!(k.validate_epoch(1_200, 1_300, 2), Err(SealError::EpochWindowViolation { .. })));
    }

    #[test]
    fn fixed_be_pads_and_truncates() {
        assert_eq!(fixed_be(&BigUint::from(0x0102u32), 4), vec![0, 0, 1, 2]);
        assert_eq!(fixed_be(&BigUint::from(0x010203u32), 2), vec![2, 3]);
    }
}
