//! Shuffle blame diagnosis.
//!
//! After a step proof fails, every peer that performed a shuffle step
//! reveals its witness. Any party can then recompute each published step
//! from the revealed secrets and pinpoint the step whose output diverges.
//! The diagnosis is terminal: the round always ends in failure and the
//! containing session must restart with the faulty peer excluded.

use std::collections::BTreeMap;

use ark_ec::CurveGroup;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};

use crate::arith::FixedBase;
use crate::elgamal::ElGamalCiphertext;
use crate::rounds::shuffle::proof::{apply_step, StepWitness};

const LOG_TARGET: &str = "rounds::shuffle::blame";

/// One peer's revealed shuffle-step secret.
#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
pub struct BlameReveal<C: CurveGroup> {
    pub step_index: u32,
    pub witness: StepWitness<C>,
}

/// Recompute every published step from the revealed witnesses.
///
/// `lists[s]` is the element list before step `s`; `lists[s + 1]` the list
/// the step's performer published. Returns the step indices whose published
/// output cannot be reproduced (missing or malformed reveals included): a
/// peer whose published list admits no witness cannot produce one that
/// replays correctly.
pub fn replay_steps<C: CurveGroup>(
    lists: &[Vec<ElGamalCiphertext<C>>],
    reveals: &BTreeMap<u32, StepWitness<C>>,
    public_key: C,
    generator_table: &FixedBase<C>,
) -> Vec<u32> {
    let mut faulty = Vec::new();
    for step in 0..lists.len().saturating_sub(1) {
        let input = &lists[step];
        let published = &lists[step + 1];
        let step = step as u32;

        let Some(witness) = reveals.get(&step) else {
            tracing::warn!(target: LOG_TARGET, step, "no witness revealed for step");
            faulty.push(step);
            continue;
        };
        if !witness.is_valid_for(input.len()) {
            tracing::warn!(target: LOG_TARGET, step, "revealed witness is malformed");
            faulty.push(step);
            continue;
        }
        if &apply_step(input, witness, public_key, generator_table) != published {
            tracing::warn!(
                target: LOG_TARGET,
                step,
                "published output diverges from recomputation"
            );
            faulty.push(step);
        }
    }
    faulty
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use ark_ec::PrimeGroup;
    use ark_ff::UniformRand;
    use ark_grumpkin::Projective as GrumpkinProjective;
    use ark_std::test_rng;

    type Scalar = <GrumpkinProjective as PrimeGroup>::ScalarField;

    fn chain(
        steps: usize,
        corrupt_at: Option<usize>,
    ) -> (
        Vec<Vec<ElGamalCiphertext<GrumpkinProjective>>>,
        BTreeMap<u32, StepWitness<GrumpkinProjective>>,
        GrumpkinProjective,
        FixedBase<GrumpkinProjective>,
    ) {
        let mut rng = test_rng();
        let key = KeyPair::<GrumpkinProjective>::generate(&mut rng);
        let table = FixedBase::new(GrumpkinProjective::generator());

        let mut lists = vec![(0..4)
            .map(|i| {
                let message = GrumpkinProjective::generator() * Scalar::from(i as u64 + 1);
                ElGamalCiphertext::encrypt(message, Scalar::rand(&mut rng), key.public)
            })
            .collect::<Vec<_>>()];
        let mut reveals = BTreeMap::new();

        for step in 0..steps {
            let witness = StepWitness::random(4, &mut rng);
            let mut output = apply_step(lists.last().unwrap(), &witness, key.public, &table);
            if corrupt_at == Some(step) {
                output[0] = ElGamalCiphertext::encrypt(
                    GrumpkinProjective::rand(&mut rng),
                    Scalar::rand(&mut rng),
                    key.public,
                );
            }
            lists.push(output);
            reveals.insert(step as u32, witness);
        }
        (lists, reveals, key.public, table)
    }

    #[test]
    fn honest_chain_replays_clean() {
        let (lists, reveals, pk, table) = chain(3, None);
        assert!(replay_steps(&lists, &reveals, pk, &table).is_empty());
    }

    #[test]
    fn corrupted_step_is_pinpointed() {
        let (lists, reveals, pk, table) = chain(3, Some(1));
        assert_eq!(replay_steps(&lists, &reveals, pk, &table), vec![1]);
    }

    #[test]
    fn withheld_witness_is_blamed() {
        let (lists, mut reveals, pk, table) = chain(2, None);
        reveals.remove(&0);
        assert_eq!(replay_steps(&lists, &reveals, pk, &table), vec![0]);
    }
}
