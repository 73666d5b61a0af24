//! One-of-many Schnorr proof of key knowledge.
//!
//! Attests that the prover knows the private key behind *some* member of a
//! public-key set, without revealing which, via standard sigma-protocol OR
//! composition: simulated transcripts for every other member, one real
//! transcript, challenges constrained to sum to the Fiat-Shamir challenge.

use ark_ec::{CurveGroup, PrimeGroup};
use ark_ff::UniformRand;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::rand::Rng;
use ark_std::Zero;

use crate::keys::PublicKeySet;
use crate::transcript::TranscriptBuilder;

const CHALLENGE_DOMAIN: &str = "proofs/ring/challenge/v1";

#[derive(Clone, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct RingKnowledgeProof<C: CurveGroup> {
    /// Per-member challenge shares; they must sum to the transcript
    /// challenge.
    pub challenges: Vec<C::ScalarField>,
    /// Per-member responses.
    pub responses: Vec<C::ScalarField>,
}

impl<C: CurveGroup> RingKnowledgeProof<C> {
    /// Prove knowledge of the private key for `keys[known_index]`, bound to
    /// `message`.
    pub fn prove_knowledge<R: Rng>(
        keys: &PublicKeySet<C>,
        secret: &C::ScalarField,
        known_index: usize,
        message: &[u8],
        rng: &mut R,
    ) -> Self {
        let n = keys.len();
        debug_assert!(known_index < n);
        let g = C::generator();

        let mut challenges = vec![C::ScalarField::zero(); n];
        let mut responses = vec![C::ScalarField::zero(); n];
        let mut commitments = vec![C::zero(); n];

        // Simulate every other member's transcript.
        for i in (0..n).filter(|&i| i != known_index) {
            let z = C::ScalarField::rand(rng);
            let c = C::ScalarField::rand(rng);
            challenges[i] = c;
            responses[i] = z;
            commitments[i] = g * z - keys.keys()[i] * c;
        }

        // Real commitment for the known member.
        let k = C::ScalarField::rand(rng);
        commitments[known_index] = g * k;

        let total = Self::compute_challenge(keys, message, &commitments);
        let simulated: C::ScalarField = challenges.iter().sum();
        let c_known = total - simulated;

        challenges[known_index] = c_known;
        responses[known_index] = k + c_known * secret;

        RingKnowledgeProof {
            challenges,
            responses,
        }
    }

    pub fn verify(&self, keys: &PublicKeySet<C>, message: &[u8]) -> bool {
        let n = keys.len();
        if self.challenges.len() != n || self.responses.len() != n || n == 0 {
            return false;
        }
        let g = C::generator();

        let commitments: Vec<C> = (0..n)
            .map(|i| g * self.responses[i] - keys.keys()[i] * self.challenges[i])
            .collect();

        let total = Self::compute_challenge(keys, message, &commitments);
        self.challenges.iter().sum::<C::ScalarField>() == total
    }

    fn compute_challenge(
        keys: &PublicKeySet<C>,
        message: &[u8],
        commitments: &[C],
    ) -> C::ScalarField {
        let mut builder = TranscriptBuilder::new(CHALLENGE_DOMAIN);
        builder.append_u32(keys.len() as u32);
        for key in keys.keys() {
            builder.append_canonical(key);
        }
        builder.append_bytes(message);
        for commitment in commitments {
            builder.append_canonical(commitment);
        }
        builder.into_xof().challenge_scalar()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use ark_grumpkin::Projective as GrumpkinProjective;
    use ark_std::test_rng;

    fn key_set(n: usize) -> (Vec<KeyPair<GrumpkinProjective>>, PublicKeySet<GrumpkinProjective>) {
        let mut rng = test_rng();
        let pairs: Vec<KeyPair<GrumpkinProjective>> =
            (0..n).map(|_| KeyPair::generate(&mut rng)).collect();
        let set = PublicKeySet::new(pairs.iter().map(|p| p.public).collect());
        (pairs, set)
    }

    #[test]
    fn any_member_can_prove() {
        let mut rng = test_rng();
        let (pairs, set) = key_set(4);
        for (i, pair) in pairs.iter().enumerate() {
            let proof =
                RingKnowledgeProof::prove_knowledge(&set, &pair.secret, i, b"payload", &mut rng);
            assert!(proof.verify(&set, b"payload"), "member {i}");
        }
    }

    #[test]
    fn proof_is_bound_to_message() {
        let mut rng = test_rng();
        let (pairs, set) = key_set(3);
        let proof =
            RingKnowledgeProof::prove_knowledge(&set, &pairs[1].secret, 1, b"payload", &mut rng);
        assert!(!proof.verify(&set, b"other payload"));
    }

    #[test]
    fn outsider_key_cannot_prove() {
        let mut rng = test_rng();
        let (_, set) = key_set(3);
        let outsider = KeyPair::<GrumpkinProjective>::generate(&mut rng);
        // An outsider claiming slot 0 produces an unsatisfiable transcript.
        let proof =
            RingKnowledgeProof::prove_knowledge(&set, &outsider.secret, 0, b"payload", &mut rng);
        assert!(!proof.verify(&set, b"payload"));
    }

    #[test]
    fn proof_rejects_wrong_set() {
        let mut rng = test_rng();
        let (pairs, set) = key_set(3);
        let (_, other_set) = key_set(4);
        let proof =
            RingKnowledgeProof::prove_knowledge(&set, &pairs[0].secret, 0, b"payload", &mut rng);
        assert!(!proof.verify(&other_set, b"payload"));
    }
}
