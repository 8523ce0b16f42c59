//! Golomb-Coded Set: a compact probabilistic set codec for the gossip
//! filter. Sorted hashed values are encoded as Golomb-Rice-coded deltas.

use bitvec::prelude::*;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{GossipError, Result};

/// Derive the Golomb-Rice parameter `P` from a target false-positive rate,
/// clamped to at least 1.
pub fn parameter_for_fpr(fpr: f64) -> u8 {
    let p = (1.0 / fpr).log2().ceil();
    if p.is_finite() {
        (p as i64).max(1).min(63) as u8
    } else {
        1
    }
}

/// Map a 128-bit packet key to its Golomb-Coded Set domain value: hash with
/// SHA-256, take the first 8 bytes as an unsigned 64-bit integer with the
/// sign bit masked off, and reduce modulo `M = N * 2^p`.
///
/// Shifted into `[1, M]` rather than `[0, M-1]` so that delta-of-deltas are
/// always `>= 1`, keeping the `(delta - 1)` Golomb-Rice encoding below
/// well-defined even for the very first (smallest) value in the set.
fn map_key(key: &[u8; 16], modulus: u128) -> u64 {
    let digest = Sha256::digest(key);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    let value = u64::from_be_bytes(raw) & 0x7FFF_FFFF_FFFF_FFFF;
    (value as u128 % modulus) as u64 + 1
}

/// A decoded/built GCS filter: the sorted mapped values and the parameters
/// used to build it, sufficient for membership queries.
#[derive(Debug, Clone)]
pub struct GcsFilter {
    pub p: u8,
    pub n: u32,
    values: Vec<u64>,
}

impl GcsFilter {
    /// Build a filter over `keys` targeting false-positive rate `fpr`.
    pub fn build(keys: &[[u8; 16]], fpr: f64) -> Self {
        let p = parameter_for_fpr(fpr);
        let n = keys.len() as u32;
        let modulus = (n.max(1) as u128) << p;
        let mut values: Vec<u64> = keys.iter().map(|k| map_key(k, modulus)).collect();
        values.sort_unstable();
        values.dedup();
        Self { p, n, values }
    }

    /// Encode as Golomb-Rice-coded deltas, MSB-first bit packing.
    pub fn encode(&self) -> Vec<u8> {
        let mut bits: BitVec<u8, Msb0> = BitVec::new();
        let mut previous = 0u64;
        for &value in &self.values {
            let delta = value - previous;
            encode_golomb_rice(&mut bits, delta, self.p);
            previous = value;
        }
        bits.into_vec()
    }

    /// Decode a filter from its wire bytes. `max_bytes` bounds how much of
    /// `data` is read, and `expected_n`/`p` come from the REQUEST_SYNC TLV.
    pub fn decode(data: &[u8], p: u8, expected_n: u32, max_bytes: usize) -> Result<Self> {
        if data.len() > max_bytes {
            return Err(GossipError::FilterTooLarge {
                len: data.len(),
                max: max_bytes,
            }
            .into());
        }
        if p == 0 || p > 63 {
            return Err(GossipError::InvalidParameter.into());
        }

        // `expected_n` comes straight off the wire and is otherwise unbounded;
        // a Golomb-Rice-coded value costs at least one bit, so no filter can
        // legitimately claim more elements than `data` has bits. Cap it before
        // using it to size anything, or a peer can claim `n = u32::MAX` over a
        // tiny `data` and drive an ~34GB `Vec<u64>` preallocation.
        let max_n = data.len().saturating_mul(8) as u64;
        let n = (expected_n as u64).min(max_n) as u32;
        if n != expected_n {
            warn!(expected_n, capped_n = n, len = data.len(), "capping oversized GCS element count");
        }

        let bits = BitSlice::<u8, Msb0>::from_slice(data);
        let mut values = Vec::with_capacity(n as usize);
        let mut cursor = 0usize;
        let mut previous = 0u64;

        while values.len() < n as usize {
            match decode_golomb_rice(bits, &mut cursor, p) {
                Some(delta) => {
                    previous += delta;
                    values.push(previous);
                }
                None => return Err(GossipError::MalformedTlv.into()),
            }
        }

        Ok(Self { p, n, values })
    }

    /// Membership test over a key mapped with this filter's own `(n, p)`.
    pub fn contains(&self, key: &[u8; 16]) -> bool {
        let modulus = (self.n.max(1) as u128) << self.p;
        let mapped = map_key(key, modulus);
        self.values.binary_search(&mapped).is_ok()
    }
}

/// Golomb-Rice encode a delta `d >= 1` with parameter `p`: unary quotient
/// `(d - 1) >> p` ones terminated by a zero, then the low `p` bits of `d - 1`.
fn encode_golomb_rice(bits: &mut BitVec<u8, Msb0>, delta: u64, p: u8) {
    let reduced = delta - 1;
    let quotient = reduced >> p;
    for _ in 0..quotient {
        bits.push(true);
    }
    bits.push(false);
    for i in (0..p).rev() {
        bits.push((reduced >> i) & 1 == 1);
    }
}

fn decode_golomb_rice(bits: &BitSlice<u8, Msb0>, cursor: &mut usize, p: u8) -> Option<u64> {
    let mut quotient = 0u64;
    loop {
        let bit = *bits.get(*cursor)?;
        *cursor += 1;
        if !bit {
            break;
        }
        quotient += 1;
    }
    let mut remainder = 0u64;
    for _ in 0..p {
        let bit = *bits.get(*cursor)?;
        *cursor += 1;
        remainder = (remainder << 1) | bit as u64;
    }
    Some(((quotient << p) | remainder) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> [u8; 16] {
        let mut k = [0u8; 16];
        k[15] = n;
        k
    }

    #[test]
    fn p_for_one_percent_fpr_is_seven() {
        assert_eq!(parameter_for_fpr(0.01), 7);
    }

    #[test]
    fn three_element_filter_contains_all_and_rejects_absent() {
        let keys = [key(0), key(1), key(2)];
        let filter = GcsFilter::build(&keys, 0.01);
        let encoded = filter.encode();
        let decoded = GcsFilter::decode(&encoded, filter.p, filter.n, 1024).unwrap();

        for k in &keys {
            assert!(decoded.contains(k));
        }
        assert!(!decoded.contains(&[0xFFu8; 16]));
    }

    #[test]
    fn false_positive_rate_is_bounded_for_larger_sets() {
        let keys: Vec<[u8; 16]> = (0..128u16)
            .map(|i| {
                let mut k = [0u8; 16];
                k[14..16].copy_from_slice(&i.to_be_bytes());
                k
            })
            .collect();
        let filter = GcsFilter::build(&keys, 0.01);

        let mut false_positives = 0;
        let trials = 2000;
        for i in 0..trials {
            let mut probe = [0xAAu8; 16];
            probe[0..2].copy_from_slice(&(i as u16).to_be_bytes());
            if !keys.contains(&probe) && filter.contains(&probe) {
                false_positives += 1;
            }
        }
        let rate = false_positives as f64 / trials as f64;
        assert!(rate < 0.05, "observed fpr {rate} too high");
    }

    #[test]
    fn oversized_filter_is_rejected() {
        let data = vec![0u8; 2048];
        assert!(GcsFilter::decode(&data, 7, 10, 1024).is_err());
    }

    #[test]
    fn oversized_element_count_is_capped_to_what_the_data_can_hold() {
        // Tiny filter body, but a claimed element count that would ask for a
        // multi-gigabyte `Vec<u64>` if taken at face value.
        let data = vec![0u8; 4];
        let decoded = GcsFilter::decode(&data, 7, u32::MAX, 1024).unwrap();
        assert!(decoded.n <= (data.len() as u32) * 8);
    }
}
