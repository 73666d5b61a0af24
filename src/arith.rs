//! Group arithmetic over an abstract cyclic group.
//!
//! Exponentiation is scalar multiplication of a curve group element;
//! cascaded exponentiation computes the product of pairwise powers jointly
//! via multi-scalar multiplication, which every batched proof verification
//! in this crate relies on.

use ark_ec::{CurveGroup, VariableBaseMSM};
use ark_ff::{BigInteger, PrimeField};
use ark_std::Zero;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArithError {
    #[error("cascade length mismatch: {bases} bases, {exponents} exponents")]
    LengthMismatch { bases: usize, exponents: usize },
}

/// `base ^ exponent` in the group (written additively: `exponent * base`).
pub fn pow<C: CurveGroup>(base: &C, exponent: &C::ScalarField) -> C {
    *base * *exponent
}

/// Product of pairwise powers, computed as one multi-scalar multiplication.
///
/// Equal to folding individual [`pow`] results, at sub-linear cost relative
/// to independent exponentiations.
pub fn pow_cascade<C: CurveGroup>(
    bases: &[C],
    exponents: &[C::ScalarField],
) -> Result<C, ArithError> {
    if bases.len() != exponents.len() {
        return Err(ArithError::LengthMismatch {
            bases: bases.len(),
            exponents: exponents.len(),
        });
    }
    let affine = C::normalize_batch(bases);
    C::msm(&affine, exponents).map_err(|_| ArithError::LengthMismatch {
        bases: bases.len(),
        exponents: exponents.len(),
    })
}

/// Precomputed doubling table for repeated exponentiations of one base.
///
/// Re-randomization layers exponentiate the group generator once per element
/// per proof repetition; the table trades one-time doublings for
/// additions-only scalar multiplication afterwards.
#[derive(Clone, Debug)]
pub struct FixedBase<C: CurveGroup> {
    powers: Vec<C>,
}

impl<C: CurveGroup> FixedBase<C> {
    pub fn new(base: C) -> Self {
        let bits = C::ScalarField::MODULUS_BIT_SIZE as usize;
        let mut powers = Vec::with_capacity(bits);
        let mut current = base;
        for _ in 0..bits {
            powers.push(current);
            current.double_in_place();
        }
        Self { powers }
    }

    pub fn mul(&self, exponent: &C::ScalarField) -> C {
        let mut acc = C::zero();
        for (bit, power) in exponent
            .into_bigint()
            .to_bits_le()
            .into_iter()
            .zip(&self.powers)
        {
            if bit {
                acc += power;
            }
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ec::PrimeGroup;
    use ark_ff::UniformRand;
    use ark_grumpkin::Projective as GrumpkinProjective;
    use ark_std::test_rng;
    use ark_std::Zero;

    type Scalar = <GrumpkinProjective as PrimeGroup>::ScalarField;

    #[test]
    fn cascade_matches_naive_product() {
        let mut rng = test_rng();
        for size in [1usize, 2, 7, 32] {
            let bases: Vec<GrumpkinProjective> = (0..size)
                .map(|_| GrumpkinProjective::rand(&mut rng))
                .collect();
            let exponents: Vec<Scalar> = (0..size).map(|_| Scalar::rand(&mut rng)).collect();

            let naive = bases
                .iter()
                .zip(&exponents)
                .fold(GrumpkinProjective::zero(), |acc, (b, e)| acc + pow(b, e));
            let cascade = pow_cascade(&bases, &exponents).unwrap();
            assert_eq!(cascade, naive, "size {size}");
        }
    }

    #[test]
    fn cascade_rejects_length_mismatch() {
        let mut rng = test_rng();
        let bases = vec![GrumpkinProjective::rand(&mut rng)];
        let exponents = vec![Scalar::rand(&mut rng); 2];
        assert_eq!(
            pow_cascade(&bases, &exponents),
            Err(ArithError::LengthMismatch {
                bases: 1,
                exponents: 2
            })
        );
    }

    #[test]
    fn fixed_base_matches_direct_mul() {
        let mut rng = test_rng();
        let base = GrumpkinProjective::rand(&mut rng);
        let table = FixedBase::new(base);
        for _ in 0..8 {
            let e = Scalar::rand(&mut rng);
            assert_eq!(table.mul(&e), base * e);
        }
    }
}
