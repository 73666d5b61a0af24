//! Hash-chained entry logs.
//!
//! Every protocol message a peer sends or receives is appended to its entry
//! log before being acted upon. Entries form a singly linked hash chain
//! anchored at the round descriptor, so any entry's hash commits to the
//! entire prior history; the chain exposes `append` and read accessors only.
//! Logs are an accountability artifact, not a confidentiality one: all
//! verification runs on public material.

mod manager;

pub use manager::{BlameEvidence, PeerReviewManager};

use std::sync::Arc;

use ark_ec::CurveGroup;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::keys::{KeyPair, PeerId, RoundDescriptor};
use crate::signing::{self, Signature};

const DOMAIN_ANCHOR: &[u8] = b"veilround/log/anchor/v1";
const DOMAIN_ENTRY: &[u8] = b"veilround/log/entry/v1";
const DOMAIN_CHAIN: &[u8] = b"veilround/log/chain/v1";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, CanonicalSerialize,
    CanonicalDeserialize,
)]
pub struct StateHash(#[serde(with = "hex::serde")] [u8; 32]);

impl StateHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<[u8; 32]> for StateHash {
    fn from(bytes: [u8; 32]) -> Self {
        StateHash::new(bytes)
    }
}

impl std::fmt::Display for StateHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

fn finalize_hash(hasher: Sha256) -> StateHash {
    let digest = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    StateHash::from(bytes)
}

fn write_len(hasher: &mut Sha256, len: usize) {
    let len_u32 = u32::try_from(len).expect("length exceeds u32");
    hasher.update(len_u32.to_be_bytes());
}

fn write_u8(hasher: &mut Sha256, value: u8) {
    hasher.update([value]);
}

fn write_u64(hasher: &mut Sha256, value: u64) {
    hasher.update(value.to_be_bytes());
}

fn write_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    write_len(hasher, bytes.len());
    hasher.update(bytes);
}

fn write_curve<C: CurveGroup>(hasher: &mut Sha256, value: &C) {
    let mut buf = Vec::new();
    value
        .serialize_compressed(&mut buf)
        .expect("curve serialization");
    write_bytes(hasher, &buf);
}

/// Chain anchor: commits to the full round descriptor and the owning peer,
/// so chains from different rounds or peers can never be spliced.
pub fn anchor_hash<C: CurveGroup>(descriptor: &RoundDescriptor<C>, peer: PeerId) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_ANCHOR);
    write_u64(&mut hasher, descriptor.round_id);
    write_bytes(&mut hasher, &descriptor.nonce);
    write_len(&mut hasher, descriptor.roster.len());
    for identity in descriptor.roster.iter() {
        write_u64(&mut hasher, identity.id);
        write_curve(&mut hasher, &identity.signing_key);
        write_curve(&mut hasher, &identity.dh_key);
    }
    write_len(&mut hasher, descriptor.element_count);
    write_u8(&mut hasher, descriptor.proof_system.tag());
    write_u64(&mut hasher, descriptor.proof_system.repetitions() as u64);
    write_u64(&mut hasher, peer);
    finalize_hash(hasher)
}

fn entry_payload_hash(outbound: bool, counterpart: PeerId, payload: &[u8]) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_ENTRY);
    write_u8(&mut hasher, outbound as u8);
    write_u64(&mut hasher, counterpart);
    write_bytes(&mut hasher, payload);
    finalize_hash(hasher)
}

/// Direction-independent content hash, used when matching two peers' views
/// of the same message.
pub fn payload_content_hash(payload: &[u8]) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_ENTRY);
    write_bytes(&mut hasher, payload);
    finalize_hash(hasher)
}

pub fn chain_hash(previous: StateHash, payload_hash: StateHash) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_CHAIN);
    hasher.update(previous.as_bytes());
    hasher.update(payload_hash.as_bytes());
    finalize_hash(hasher)
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LogError {
    #[error("malformed log encoding: {0}")]
    Malformed(String),
    #[error("sequence break at entry {0}")]
    SequenceBreak(u64),
    #[error("hash chain break at entry {0}")]
    ChainBreak(u64),
    #[error("payload hash mismatch at entry {0}")]
    PayloadMismatch(u64),
    #[error("bad signature at entry {0}")]
    BadSignature(u64),
    #[error("log tip does not match announced tip")]
    TipMismatch,
    #[error("peer {0} is not in the round roster")]
    UnknownPeer(PeerId),
}

#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
pub struct LogEntry<C: CurveGroup> {
    /// Monotonic per-peer sequence id, starting at zero.
    pub sequence: u64,
    pub outbound: bool,
    /// The remote end of this message; [`crate::keys::BROADCAST_PEER`] for
    /// broadcasts.
    pub counterpart: PeerId,
    /// Chain value before this entry.
    pub previous: StateHash,
    pub payload_hash: StateHash,
    pub payload: Vec<u8>,
    /// Signature over the chain value after this entry.
    pub signature: Signature<C>,
}

/// Append-only, hash-chained record of one peer's protocol messages in one
/// round.
#[derive(Clone, Debug)]
pub struct EntryLog<C: CurveGroup> {
    descriptor: Arc<RoundDescriptor<C>>,
    peer: PeerId,
    entries: Vec<LogEntry<C>>,
    tip: StateHash,
}

impl<C: CurveGroup> EntryLog<C> {
    pub fn new(descriptor: Arc<RoundDescriptor<C>>, peer: PeerId) -> Self {
        let tip = anchor_hash(&descriptor, peer);
        Self {
            descriptor,
            peer,
            entries: Vec::new(),
            tip,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn descriptor(&self) -> &Arc<RoundDescriptor<C>> {
        &self.descriptor
    }

    /// Record one message. The chain tip after this entry is signed with
    /// the peer's signing key, committing the signer to the entire history.
    pub fn append(
        &mut self,
        outbound: bool,
        counterpart: PeerId,
        payload: Vec<u8>,
        signing_key: &KeyPair<C>,
    ) -> &LogEntry<C> {
        let payload_hash = entry_payload_hash(outbound, counterpart, &payload);
        let chained = chain_hash(self.tip, payload_hash);
        let signature = signing::sign(&signing_key.secret, &signing_key.public, chained.as_bytes());

        self.entries.push(LogEntry {
            sequence: self.entries.len() as u64,
            outbound,
            counterpart,
            previous: self.tip,
            payload_hash,
            payload,
            signature,
        });
        self.tip = chained;
        self.entries.last().expect("just pushed")
    }

    pub fn entries(&self) -> &[LogEntry<C>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Chain value committing to the full history so far.
    pub fn tip(&self) -> StateHash {
        self.tip
    }

    /// Previous-entry hash of the latest entry (the anchor when empty).
    pub fn previous_hash(&self) -> StateHash {
        self.entries
            .last()
            .map(|e| e.previous)
            .unwrap_or_else(|| anchor_hash(&self.descriptor, self.peer))
    }

    /// Sequence id of the latest entry.
    pub fn previous_sequence(&self) -> Option<u64> {
        self.entries.last().map(|e| e.sequence)
    }

    /// Re-verify every hash, sequence, and signature link against the
    /// peer's roster signing key.
    pub fn verify(&self) -> Result<(), LogError> {
        let signing_key = self
            .descriptor
            .roster
            .signing_key(self.peer)
            .copied()
            .ok_or(LogError::UnknownPeer(self.peer))?;

        let mut running = anchor_hash(&self.descriptor, self.peer);
        for (index, entry) in self.entries.iter().enumerate() {
            let index = index as u64;
            if entry.sequence != index {
                return Err(LogError::SequenceBreak(index));
            }
            if entry.previous != running {
                return Err(LogError::ChainBreak(index));
            }
            if entry.payload_hash
                != entry_payload_hash(entry.outbound, entry.counterpart, &entry.payload)
            {
                return Err(LogError::PayloadMismatch(index));
            }
            let chained = chain_hash(running, entry.payload_hash);
            if !signing::verify(&signing_key, chained.as_bytes(), &entry.signature) {
                return Err(LogError::BadSignature(index));
            }
            running = chained;
        }

        if running != self.tip {
            return Err(LogError::TipMismatch);
        }
        Ok(())
    }

    /// Verify the chain and check it ends at an externally announced tip.
    /// Detects truncation, which an internally consistent prefix would not.
    pub fn verify_against_tip(&self, announced: StateHash) -> Result<(), LogError> {
        self.verify()?;
        if self.tip != announced {
            return Err(LogError::TipMismatch);
        }
        Ok(())
    }

    /// Serialize the chain for transfer to an auditor.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.entries
            .serialize_compressed(&mut bytes)
            .expect("log serialization");
        bytes
    }
}

/// Reconstruct a peer's claimed message history from a serialized chain,
/// failing if any hash, sequence, or signature link is broken.
pub fn parse_log<C: CurveGroup>(
    descriptor: Arc<RoundDescriptor<C>>,
    peer: PeerId,
    bytes: &[u8],
) -> Result<EntryLog<C>, LogError> {
    let entries = Vec::<LogEntry<C>>::deserialize_compressed(&mut &bytes[..])
        .map_err(|e| LogError::Malformed(e.to_string()))?;

    let mut tip = anchor_hash(&descriptor, peer);
    for entry in &entries {
        tip = chain_hash(tip, entry.payload_hash);
    }

    let log = EntryLog {
        descriptor,
        peer,
        entries,
        tip,
    };
    log.verify()?;
    Ok(log)
}
