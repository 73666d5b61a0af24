//! Publicly verifiable proof that one shuffle step is a re-encrypting
//! permutation of its input.
//!
//! Cut-and-choose argument: the prover publishes `k` independent
//! re-encrypted permutations of the input list; Fiat-Shamir challenge bits
//! over the full statement select, per repetition, which of the two
//! connecting witnesses (input to intermediate, or intermediate to output)
//! is revealed. Neither side alone determines the secret permutation, while
//! an invalid step survives all `k` challenges with probability `2^-k`.

use ark_ec::CurveGroup;
use ark_ff::UniformRand;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::rand::seq::SliceRandom;
use ark_std::rand::Rng;

use crate::arith::FixedBase;
use crate::elgamal::ElGamalCiphertext;
use crate::keys::RoundNonce;
use crate::transcript::TranscriptBuilder;

const CHALLENGE_DOMAIN: &str = "shuffle/step/challenge/v1";

/// A shuffle step's secret: `output[i] = rerandomize(input[permutation[i]],
/// randomizers[i])`.
#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
pub struct StepWitness<C: CurveGroup> {
    pub permutation: Vec<u32>,
    pub randomizers: Vec<C::ScalarField>,
}

impl<C: CurveGroup> StepWitness<C> {
    pub fn random<R: Rng>(len: usize, rng: &mut R) -> Self {
        let mut permutation: Vec<u32> = (0..len as u32).collect();
        permutation.shuffle(rng);
        let randomizers = (0..len).map(|_| C::ScalarField::rand(rng)).collect();
        Self {
            permutation,
            randomizers,
        }
    }

    pub fn is_valid_for(&self, len: usize) -> bool {
        if self.permutation.len() != len || self.randomizers.len() != len {
            return false;
        }
        let mut seen = vec![false; len];
        for &p in &self.permutation {
            let Some(slot) = seen.get_mut(p as usize) else {
                return false;
            };
            if *slot {
                return false;
            }
            *slot = true;
        }
        true
    }
}

/// Apply a witness: re-randomize every element and permute the list.
pub fn apply_step<C: CurveGroup>(
    input: &[ElGamalCiphertext<C>],
    witness: &StepWitness<C>,
    public_key: C,
    generator_table: &FixedBase<C>,
) -> Vec<ElGamalCiphertext<C>> {
    witness
        .permutation
        .iter()
        .zip(&witness.randomizers)
        .map(|(&from, r)| {
            input[from as usize].add_encryption_layer_with(generator_table, *r, public_key)
        })
        .collect()
}

#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
pub struct StepResponse<C: CurveGroup> {
    /// False: witness connects the input list to the intermediate.
    /// True: witness connects the intermediate to the output list.
    pub to_output: bool,
    pub permutation: Vec<u32>,
    pub randomizers: Vec<C::ScalarField>,
}

/// Non-interactive argument that `output` is a re-encrypting permutation of
/// `input` under the shuffle public key.
#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
pub struct ShuffleStepProof<C: CurveGroup> {
    pub intermediates: Vec<Vec<ElGamalCiphertext<C>>>,
    pub responses: Vec<StepResponse<C>>,
}

fn challenge_bits<C: CurveGroup>(
    nonce: &RoundNonce,
    step_index: u32,
    public_key: &C,
    input: &[ElGamalCiphertext<C>],
    output: &[ElGamalCiphertext<C>],
    intermediates: &[Vec<ElGamalCiphertext<C>>],
) -> Vec<bool> {
    let mut builder = TranscriptBuilder::new(CHALLENGE_DOMAIN);
    builder.append_bytes(nonce);
    builder.append_u32(step_index);
    builder.append_canonical(public_key);
    builder.append_u32(input.len() as u32);
    for ciphertext in input.iter().chain(output) {
        builder.append_canonical(ciphertext);
    }
    builder.append_u32(intermediates.len() as u32);
    for list in intermediates {
        for ciphertext in list {
            builder.append_canonical(ciphertext);
        }
    }
    builder.into_xof().challenge_bits(intermediates.len())
}

impl<C: CurveGroup> ShuffleStepProof<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn prove<R: Rng>(
        nonce: &RoundNonce,
        step_index: u32,
        public_key: C,
        input: &[ElGamalCiphertext<C>],
        output: &[ElGamalCiphertext<C>],
        witness: &StepWitness<C>,
        repetitions: u32,
        generator_table: &FixedBase<C>,
        rng: &mut R,
    ) -> Self {
        let n = input.len();

        let blinds: Vec<StepWitness<C>> = (0..repetitions)
            .map(|_| StepWitness::random(n, rng))
            .collect();
        let intermediates: Vec<Vec<ElGamalCiphertext<C>>> = blinds
            .iter()
            .map(|blind| apply_step(input, blind, public_key, generator_table))
            .collect();

        let bits = challenge_bits(
            nonce,
            step_index,
            &public_key,
            input,
            output,
            &intermediates,
        );

        let responses = blinds
            .iter()
            .zip(&bits)
            .map(|(blind, &open_output)| {
                if !open_output {
                    StepResponse {
                        to_output: false,
                        permutation: blind.permutation.clone(),
                        randomizers: blind.randomizers.clone(),
                    }
                } else {
                    // Connect intermediate to output: intermediate[a] holds
                    // input[blind.perm[a]], so position i of the output
                    // (which holds input[witness.perm[i]]) comes from
                    // a = blind.perm^-1[witness.perm[i]].
                    let mut inverse = vec![0u32; n];
                    for (a, &from) in blind.permutation.iter().enumerate() {
                        inverse[from as usize] = a as u32;
                    }
                    let permutation: Vec<u32> = witness
                        .permutation
                        .iter()
                        .map(|&from| inverse[from as usize])
                        .collect();
                    let randomizers: Vec<C::ScalarField> = permutation
                        .iter()
                        .zip(&witness.randomizers)
                        .map(|(&a, r)| *r - blind.randomizers[a as usize])
                        .collect();
                    StepResponse {
                        to_output: true,
                        permutation,
                        randomizers,
                    }
                }
            })
            .collect();

        Self {
            intermediates,
            responses,
        }
    }

    pub fn verify(
        &self,
        nonce: &RoundNonce,
        step_index: u32,
        public_key: C,
        input: &[ElGamalCiphertext<C>],
        output: &[ElGamalCiphertext<C>],
        repetitions: u32,
        generator_table: &FixedBase<C>,
    ) -> bool {
        let n = input.len();
        if output.len() != n
            || self.intermediates.len() != repetitions as usize
            || self.responses.len() != repetitions as usize
            || self.intermediates.iter().any(|list| list.len() != n)
        {
            return false;
        }

        let bits = challenge_bits(
            nonce,
            step_index,
            &public_key,
            input,
            output,
            &self.intermediates,
        );

        for ((response, intermediate), bit) in
            self.responses.iter().zip(&self.intermediates).zip(&bits)
        {
            if response.to_output != *bit {
                return false;
            }
            let witness = StepWitness::<C> {
                permutation: response.permutation.clone(),
                randomizers: response.randomizers.clone(),
            };
            if !witness.is_valid_for(n) {
                return false;
            }
            let (from, to): (&[ElGamalCiphertext<C>], &[ElGamalCiphertext<C>]) =
                if response.to_output {
                    (intermediate.as_slice(), output)
                } else {
                    (input, intermediate.as_slice())
                };
            if apply_step(from, &witness, public_key, generator_table) != to {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use ark_ec::PrimeGroup;
    use ark_grumpkin::Projective as GrumpkinProjective;
    use ark_std::test_rng;

    type Scalar = <GrumpkinProjective as PrimeGroup>::ScalarField;

    const REPS: u32 = 16;

    fn setup(
        n: usize,
    ) -> (
        GrumpkinProjective,
        Vec<ElGamalCiphertext<GrumpkinProjective>>,
        FixedBase<GrumpkinProjective>,
    ) {
        let mut rng = test_rng();
        let key = KeyPair::<GrumpkinProjective>::generate(&mut rng);
        let table = FixedBase::new(GrumpkinProjective::generator());
        let input: Vec<ElGamalCiphertext<GrumpkinProjective>> = (0..n)
            .map(|i| {
                let message = GrumpkinProjective::generator() * Scalar::from(i as u64 + 1);
                ElGamalCiphertext::encrypt(message, Scalar::rand(&mut rng), key.public)
            })
            .collect();
        (key.public, input, table)
    }

    #[test]
    fn honest_step_proof_verifies() {
        let mut rng = test_rng();
        let (pk, input, table) = setup(4);
        let witness = StepWitness::random(4, &mut rng);
        let output = apply_step(&input, &witness, pk, &table);

        let nonce = [5u8; 32];
        let proof = ShuffleStepProof::prove(
            &nonce, 0, pk, &input, &output, &witness, REPS, &table, &mut rng,
        );
        assert!(proof.verify(&nonce, 0, pk, &input, &output, REPS, &table));
    }

    #[test]
    fn proof_rejects_substituted_output() {
        let mut rng = test_rng();
        let (pk, input, table) = setup(4);
        let witness = StepWitness::random(4, &mut rng);
        let output = apply_step(&input, &witness, pk, &table);

        let nonce = [5u8; 32];
        let proof = ShuffleStepProof::prove(
            &nonce, 0, pk, &input, &output, &witness, REPS, &table, &mut rng,
        );

        // Swap in a ciphertext that is not a re-encryption of any input.
        let mut forged = output.clone();
        forged[2] = ElGamalCiphertext::encrypt(
            GrumpkinProjective::rand(&mut rng),
            Scalar::rand(&mut rng),
            pk,
        );
        assert!(!proof.verify(&nonce, 0, pk, &input, &forged, REPS, &table));
    }

    #[test]
    fn proof_is_bound_to_statement_context() {
        let mut rng = test_rng();
        let (pk, input, table) = setup(3);
        let witness = StepWitness::random(3, &mut rng);
        let output = apply_step(&input, &witness, pk, &table);

        let nonce = [5u8; 32];
        let proof = ShuffleStepProof::prove(
            &nonce, 2, pk, &input, &output, &witness, REPS, &table, &mut rng,
        );
        assert!(proof.verify(&nonce, 2, pk, &input, &output, REPS, &table));
        // Wrong step index or nonce invalidates the transcript.
        assert!(!proof.verify(&nonce, 3, pk, &input, &output, REPS, &table));
        assert!(!proof.verify(&[6u8; 32], 2, pk, &input, &output, REPS, &table));
    }

    #[test]
    fn tampered_intermediate_is_rejected() {
        let mut rng = test_rng();
        let (pk, input, table) = setup(3);
        let witness = StepWitness::random(3, &mut rng);
        let output = apply_step(&input, &witness, pk, &table);

        let nonce = [5u8; 32];
        let mut proof = ShuffleStepProof::prove(
            &nonce, 0, pk, &input, &output, &witness, REPS, &table, &mut rng,
        );
        proof.intermediates[1][0] = proof.intermediates[1][1];
        assert!(!proof.verify(&nonce, 0, pk, &input, &output, REPS, &table));
    }
}
