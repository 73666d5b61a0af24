//! DC-net pad derivation and the fixed-size cell codec.
//!
//! A pad is keyed by the Diffie-Hellman point between a peer's round DH key
//! and a slot key: the slot owner (who holds the slot secret) can derive
//! every peer's pad, while each peer can derive only its own. XORing all
//! peers' per-slot contributions therefore cancels every pad and leaves the
//! owner's cell.

use ark_ec::CurveGroup;
use ark_serialize::CanonicalSerialize;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::keys::{KeyReusePolicy, RoundNonce};
use crate::transcript::TranscriptBuilder;

/// Length prefix plus checksum tail.
pub const CELL_OVERHEAD: usize = 10;

const PAD_DOMAIN: &str = "bulk/pad/v1";
const CHECKSUM_DOMAIN: &[u8] = b"veilround/bulk/cell/v1";

/// Derive the pad one peer contributes for one slot in one subphase.
///
/// `FreshPerSubphase` salts the seed with the subphase index;
/// `ReuseStream` seeds once per (peer, slot) and consumes consecutive
/// stretches of a single XOF stream across subphases.
pub fn derive_pad<C: CurveGroup>(
    shared: &C,
    nonce: &RoundNonce,
    slot: u32,
    subphase: u32,
    policy: KeyReusePolicy,
    cell_size: usize,
) -> Vec<u8> {
    let mut seed = Zeroizing::new(Vec::new());
    shared
        .serialize_compressed(&mut *seed)
        .expect("shared point serialization");

    let mut builder = TranscriptBuilder::new(PAD_DOMAIN);
    builder.append_bytes(&seed);
    builder.append_bytes(nonce);
    builder.append_u32(slot);
    if policy == KeyReusePolicy::FreshPerSubphase {
        builder.append_u32(subphase);
    }
    let mut xof = builder.into_xof();

    if policy == KeyReusePolicy::ReuseStream {
        // Skip the stretches consumed by earlier subphases.
        let mut scratch = vec![0u8; cell_size];
        for _ in 0..subphase {
            xof.fill_bytes(&mut scratch);
        }
    }

    let mut pad = vec![0u8; cell_size];
    xof.fill_bytes(&mut pad);
    pad
}

pub fn xor_into(accumulator: &mut [u8], other: &[u8]) {
    debug_assert_eq!(accumulator.len(), other.len());
    for (a, b) in accumulator.iter_mut().zip(other) {
        *a ^= b;
    }
}

pub fn cell_capacity(cell_size: usize) -> usize {
    cell_size.saturating_sub(CELL_OVERHEAD)
}

fn checksum(nonce: &RoundNonce, slot: u32, subphase: u32, payload: &[u8]) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(CHECKSUM_DOMAIN);
    hasher.update(nonce);
    hasher.update(slot.to_be_bytes());
    hasher.update(subphase.to_be_bytes());
    hasher.update((payload.len() as u32).to_be_bytes());
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&digest[..8]);
    tail
}

/// Encode a payload into a fixed-size cell: length prefix, payload, zero
/// padding, checksum tail. Returns `None` when the payload exceeds the
/// cell's capacity.
pub fn encode_cell(
    payload: &[u8],
    cell_size: usize,
    nonce: &RoundNonce,
    slot: u32,
    subphase: u32,
) -> Option<Vec<u8>> {
    if payload.len() > cell_capacity(cell_size) || payload.len() > u16::MAX as usize {
        return None;
    }
    let mut cell = vec![0u8; cell_size];
    cell[..2].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    cell[2..2 + payload.len()].copy_from_slice(payload);
    let tail = checksum(nonce, slot, subphase, payload);
    let tail_at = cell_size - 8;
    cell[tail_at..].copy_from_slice(&tail);
    Some(cell)
}

/// Decode a combined cell. `None` marks a corrupted slot: some
/// contribution did not cancel and the checksum no longer matches.
pub fn decode_cell(
    cell: &[u8],
    nonce: &RoundNonce,
    slot: u32,
    subphase: u32,
) -> Option<Vec<u8>> {
    if cell.len() < CELL_OVERHEAD {
        return None;
    }
    let length = u16::from_be_bytes([cell[0], cell[1]]) as usize;
    if length > cell.len() - CELL_OVERHEAD {
        return None;
    }
    let payload = &cell[2..2 + length];
    let tail_at = cell.len() - 8;
    if cell[tail_at..] != checksum(nonce, slot, subphase, payload) {
        return None;
    }
    // Padding must be zero, or a tampered-but-checksum-preserving region
    // would go unnoticed.
    if cell[2 + length..tail_at].iter().any(|&b| b != 0) {
        return None;
    }
    Some(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ff::UniformRand;
    use ark_grumpkin::Projective as GrumpkinProjective;
    use ark_std::test_rng;

    const NONCE: RoundNonce = [11u8; 32];

    #[test]
    fn pad_is_deterministic_per_policy() {
        let mut rng = test_rng();
        let shared = GrumpkinProjective::rand(&mut rng);
        for policy in [KeyReusePolicy::FreshPerSubphase, KeyReusePolicy::ReuseStream] {
            let a = derive_pad(&shared, &NONCE, 2, 1, policy, 64);
            let b = derive_pad(&shared, &NONCE, 2, 1, policy, 64);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn subphases_never_reuse_pad_bytes() {
        let mut rng = test_rng();
        let shared = GrumpkinProjective::rand(&mut rng);
        for policy in [KeyReusePolicy::FreshPerSubphase, KeyReusePolicy::ReuseStream] {
            let first = derive_pad(&shared, &NONCE, 0, 0, policy, 64);
            let second = derive_pad(&shared, &NONCE, 0, 1, policy, 64);
            assert_ne!(first, second, "{policy:?}");
        }
    }

    #[test]
    fn cell_round_trips() {
        let payload = b"anonymous payload".to_vec();
        let cell = encode_cell(&payload, 64, &NONCE, 3, 0).unwrap();
        assert_eq!(cell.len(), 64);
        assert_eq!(decode_cell(&cell, &NONCE, 3, 0), Some(payload));
    }

    #[test]
    fn empty_payload_is_a_valid_cell() {
        let cell = encode_cell(b"", 32, &NONCE, 0, 0).unwrap();
        assert_eq!(decode_cell(&cell, &NONCE, 0, 0), Some(Vec::new()));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert!(encode_cell(&[0u8; 60], 64, &NONCE, 0, 0).is_none());
    }

    #[test]
    fn corruption_and_context_mismatch_are_detected() {
        let cell = encode_cell(b"msg", 64, &NONCE, 3, 0).unwrap();

        let mut flipped = cell.clone();
        flipped[5] ^= 0x40;
        assert_eq!(decode_cell(&flipped, &NONCE, 3, 0), None);

        // A cell replayed into another slot or subphase must not decode.
        assert_eq!(decode_cell(&cell, &NONCE, 4, 0), None);
        assert_eq!(decode_cell(&cell, &NONCE, 3, 1), None);
    }

    #[test]
    fn pads_cancel_under_xor() {
        let mut rng = test_rng();
        let shared = GrumpkinProjective::rand(&mut rng);
        let pad = derive_pad(&shared, &NONCE, 1, 0, KeyReusePolicy::FreshPerSubphase, 48);

        let payload = b"covered".to_vec();
        let mut cell = encode_cell(&payload, 48, &NONCE, 1, 0).unwrap();
        xor_into(&mut cell, &pad);
        assert_eq!(decode_cell(&cell, &NONCE, 1, 0), None, "padded cell is opaque");
        xor_into(&mut cell, &pad);
        assert_eq!(decode_cell(&cell, &NONCE, 1, 0), Some(payload));
    }
}
