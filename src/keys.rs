//! Round parameters, key pairs, and aggregated public-key sets.

use std::time::Duration;

use ark_ec::{CurveGroup, PrimeGroup};
use ark_ff::UniformRand;
use ark_std::rand::Rng;
use ark_std::Zero;
use serde::{Deserialize, Serialize};

pub type PeerId = u64;
pub type RoundId = u64;
pub type RoundNonce = [u8; 32];

/// Counterpart id recorded for broadcast log entries.
pub const BROADCAST_PEER: PeerId = PeerId::MAX;

/// One authenticated roster member: identity plus the key bindings supplied
/// by the external authentication subsystem.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct PeerIdentity<C: CurveGroup> {
    pub id: PeerId,
    /// Long-lived signing key used for entry-log signatures.
    #[serde(with = "crate::crypto_serde::curve")]
    pub signing_key: C,
    /// Round-scoped Diffie-Hellman key used for pad derivation.
    #[serde(with = "crate::crypto_serde::curve")]
    pub dh_key: C,
}

/// Ordered peer roster. Index order is protocol order and is immutable for
/// the lifetime of a round.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Roster<C: CurveGroup> {
    peers: Vec<PeerIdentity<C>>,
}

impl<C: CurveGroup> Roster<C> {
    pub fn new(peers: Vec<PeerIdentity<C>>) -> Self {
        Self { peers }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.index_of(id).is_some()
    }

    pub fn index_of(&self, id: PeerId) -> Option<usize> {
        self.peers.iter().position(|p| p.id == id)
    }

    pub fn get(&self, index: usize) -> Option<&PeerIdentity<C>> {
        self.peers.get(index)
    }

    pub fn by_id(&self, id: PeerId) -> Option<&PeerIdentity<C>> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.iter().map(|p| p.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerIdentity<C>> {
        self.peers.iter()
    }

    pub fn signing_key(&self, id: PeerId) -> Option<&C> {
        self.by_id(id).map(|p| &p.signing_key)
    }

    pub fn dh_key(&self, id: PeerId) -> Option<&C> {
        self.by_id(id).map(|p| &p.dh_key)
    }
}

/// Zero-knowledge proof system used by shuffle steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofSystem {
    /// Cut-and-choose re-encrypting-permutation argument with the given
    /// repetition count (soundness error `2^-repetitions`).
    CutAndChoose { repetitions: u32 },
}

impl Default for ProofSystem {
    fn default() -> Self {
        ProofSystem::CutAndChoose { repetitions: 40 }
    }
}

impl ProofSystem {
    pub fn tag(&self) -> u8 {
        match self {
            ProofSystem::CutAndChoose { .. } => 0,
        }
    }

    pub fn repetitions(&self) -> u32 {
        match self {
            ProofSystem::CutAndChoose { repetitions } => *repetitions,
        }
    }
}

/// Immutable parameters identifying one round. Shared by reference between
/// every message, proof, and log object the round produces.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct RoundDescriptor<C: CurveGroup> {
    pub round_id: RoundId,
    #[serde(with = "hex::serde")]
    pub nonce: RoundNonce,
    pub roster: Roster<C>,
    /// Number of group elements flowing through shuffle and bulk phases.
    pub element_count: usize,
    pub proof_system: ProofSystem,
}

/// Private/public key pair over the round's group parameters.
#[derive(Clone, Debug)]
pub struct KeyPair<C: CurveGroup> {
    pub secret: C::ScalarField,
    pub public: C,
}

impl<C: CurveGroup> KeyPair<C> {
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        Self::from_secret(C::ScalarField::rand(rng))
    }

    pub fn from_secret(secret: C::ScalarField) -> Self {
        let public = C::generator() * secret;
        Self { secret, public }
    }
}

/// Ordered aggregation of multiple peers' public keys. The combined element
/// is the group product of the members, usable as a single encryption or
/// verification target.
#[derive(Clone, Debug)]
pub struct PublicKeySet<C: CurveGroup> {
    keys: Vec<C>,
    combined: C,
}

impl<C: CurveGroup> PublicKeySet<C> {
    pub fn new(keys: Vec<C>) -> Self {
        let combined = keys.iter().fold(C::zero(), |acc, pk| acc + pk);
        Self { keys, combined }
    }

    pub fn keys(&self) -> &[C] {
        &self.keys
    }

    pub fn combined(&self) -> C {
        self.combined
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn index_of(&self, key: &C) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }
}

/// Which anonymity protocol a round runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundKind {
    Null,
    Shuffle,
    Bulk,
    Broadcast,
}

/// Reaction to peer churn while a round is running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RosterChangePolicy {
    /// Cryptographic parameters are roster-bound; churn faults the round.
    #[default]
    Fault,
    /// Tolerate churn. Only meaningful for rounds whose phases do not
    /// depend on the full roster (the null round).
    Ignore,
}

/// Bulk-round aggregation topology.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkTopology {
    /// Every peer broadcasts to every peer.
    Decentralized,
    /// Designated aggregators collect client contributions and broadcast
    /// combined shares, reducing fan-in from quadratic to linear.
    ClientServer { servers: Vec<PeerId> },
}

/// Whether bulk pad streams are re-derived per subphase or drawn from one
/// continuing stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyReusePolicy {
    #[default]
    FreshPerSubphase,
    ReuseStream,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BulkPolicy {
    pub topology: BulkTopology,
    /// Number of message slots transmitted over a single shuffled key set.
    pub subphases: u32,
    /// Fixed on-wire cell length in bytes, including codec overhead.
    pub cell_size: usize,
    pub key_reuse: KeyReusePolicy,
}

impl Default for BulkPolicy {
    fn default() -> Self {
        Self {
            topology: BulkTopology::Decentralized,
            subphases: 1,
            cell_size: 256,
            key_reuse: KeyReusePolicy::default(),
        }
    }
}

/// Immutable round configuration supplied at construction. There is no
/// runtime reconfiguration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct RoundConfig<C: CurveGroup> {
    pub round_id: RoundId,
    #[serde(with = "hex::serde")]
    pub nonce: RoundNonce,
    pub roster: Roster<C>,
    pub kind: RoundKind,
    pub proof_system: ProofSystem,
    pub phase_timeout: Duration,
    pub roster_change: RosterChangePolicy,
    pub bulk: Option<BulkPolicy>,
}

impl<C: CurveGroup> RoundConfig<C> {
    pub fn descriptor(&self) -> RoundDescriptor<C> {
        RoundDescriptor {
            round_id: self.round_id,
            nonce: self.nonce,
            roster: self.roster.clone(),
            element_count: self.roster.len(),
            proof_system: self.proof_system,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_grumpkin::Projective as GrumpkinProjective;
    use ark_std::test_rng;

    fn roster_of(n: usize) -> Roster<GrumpkinProjective> {
        let mut rng = test_rng();
        Roster::new(
            (0..n as u64)
                .map(|id| PeerIdentity {
                    id,
                    signing_key: KeyPair::<GrumpkinProjective>::generate(&mut rng).public,
                    dh_key: KeyPair::<GrumpkinProjective>::generate(&mut rng).public,
                })
                .collect(),
        )
    }

    #[test]
    fn roster_lookup_follows_insertion_order() {
        let roster = roster_of(4);
        assert_eq!(roster.len(), 4);
        assert_eq!(roster.index_of(2), Some(2));
        assert!(roster.contains(3));
        assert!(!roster.contains(17));
    }

    #[test]
    fn combined_key_is_sum_of_members() {
        let mut rng = test_rng();
        let pairs: Vec<KeyPair<GrumpkinProjective>> =
            (0..3).map(|_| KeyPair::generate(&mut rng)).collect();
        let set = PublicKeySet::new(pairs.iter().map(|p| p.public).collect());

        let combined_secret = pairs
            .iter()
            .fold(<GrumpkinProjective as PrimeGroup>::ScalarField::from(0u64), |acc, p| {
                acc + p.secret
            });
        assert_eq!(set.combined(), GrumpkinProjective::generator() * combined_secret);
        assert_eq!(set.index_of(&pairs[1].public), Some(1));
    }

    #[test]
    fn round_config_serde_round_trips() {
        let config = RoundConfig::<GrumpkinProjective> {
            round_id: 9,
            nonce: [7u8; 32],
            roster: roster_of(2),
            kind: RoundKind::Shuffle,
            proof_system: ProofSystem::default(),
            phase_timeout: Duration::from_secs(30),
            roster_change: RosterChangePolicy::Fault,
            bulk: Some(BulkPolicy::default()),
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: RoundConfig<GrumpkinProjective> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.round_id, 9);
        assert_eq!(back.nonce, [7u8; 32]);
        assert_eq!(back.roster.len(), 2);
        assert_eq!(back.kind, RoundKind::Shuffle);
    }
}
