//! Chaum-Pedersen proof of discrete-log equality.
//!
//! Proves that the same secret was used to compute `alpha = g^secret` and
//! `beta = h^secret`, non-interactively via the Fiat-Shamir heuristic.
//! Decryption shares and bulk pad accusations both rest on this proof.

use ark_ec::CurveGroup;
use ark_ff::UniformRand;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::rand::Rng;
use ark_std::Zero;

use crate::arith::pow;
use crate::transcript::{derive_nonce, TranscriptBuilder};

const NONCE_DOMAIN: &str = "proofs/dleq/nonce/v1";
const CHALLENGE_DOMAIN: &str = "proofs/dleq/challenge/v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct ChaumPedersenProof<C: CurveGroup> {
    /// First commitment: `t_g = g^w`.
    pub t_g: C,
    /// Second commitment: `t_h = h^w`.
    pub t_h: C,
    /// Response: `z = w + c*secret`.
    pub z: C::ScalarField,
}

impl<C: CurveGroup> ChaumPedersenProof<C> {
    /// Generate a proof that `alpha = g^secret` and `beta = h^secret`.
    ///
    /// The witness is derived deterministically from the secret and the
    /// full statement, so proving is stateless.
    pub fn generate(secret: C::ScalarField, g: C, h: C, alpha: C, beta: C) -> Self {
        let statement = statement_bytes(&g, &h, &alpha, &beta);
        let w = derive_nonce::<C::ScalarField>(NONCE_DOMAIN, &secret, &statement);

        let t_g = pow(&g, &w);
        let t_h = pow(&h, &w);
        let c = Self::compute_challenge(&g, &h, &alpha, &beta, &t_g, &t_h);

        ChaumPedersenProof {
            t_g,
            t_h,
            z: w + c * secret,
        }
    }

    pub fn verify(&self, g: C, h: C, alpha: C, beta: C) -> bool {
        let c = Self::compute_challenge(&g, &h, &alpha, &beta, &self.t_g, &self.t_h);

        // g^z = t_g * alpha^c  and  h^z = t_h * beta^c
        pow(&g, &self.z) == self.t_g + pow(&alpha, &c)
            && pow(&h, &self.z) == self.t_h + pow(&beta, &c)
    }

    /// Fiat-Shamir challenge over the full statement and commitments.
    fn compute_challenge(g: &C, h: &C, alpha: &C, beta: &C, t_g: &C, t_h: &C) -> C::ScalarField {
        let mut builder = TranscriptBuilder::new(CHALLENGE_DOMAIN);
        for point in [g, h, alpha, beta, t_g, t_h] {
            builder.append_canonical(point);
        }
        builder.into_xof().challenge_scalar()
    }
}

fn statement_bytes<C: CurveGroup>(g: &C, h: &C, alpha: &C, beta: &C) -> Vec<u8> {
    let mut builder = TranscriptBuilder::new("proofs/dleq/statement/v1");
    for point in [g, h, alpha, beta] {
        builder.append_canonical(point);
    }
    builder.finish()
}

/// Batch verification for multiple proofs sharing the same bases, using
/// random linear combination.
pub fn batch_verify_chaum_pedersen<C, R>(
    proofs: &[ChaumPedersenProof<C>],
    g: C,
    h: C,
    alphas: &[C],
    betas: &[C],
    rng: &mut R,
) -> bool
where
    C: CurveGroup,
    R: Rng,
{
    if proofs.len() != alphas.len() || proofs.len() != betas.len() || proofs.is_empty() {
        return false;
    }

    let rhos: Vec<C::ScalarField> = (0..proofs.len())
        .map(|_| C::ScalarField::rand(rng))
        .collect();

    let mut acc_z = C::ScalarField::zero();
    let mut acc_tg = C::zero();
    let mut acc_th = C::zero();
    let mut acc_alpha = C::zero();
    let mut acc_beta = C::zero();

    for i in 0..proofs.len() {
        let rho = rhos[i];
        let c = ChaumPedersenProof::<C>::compute_challenge(
            &g,
            &h,
            &alphas[i],
            &betas[i],
            &proofs[i].t_g,
            &proofs[i].t_h,
        );

        acc_z += rho * proofs[i].z;
        acc_tg += proofs[i].t_g * rho;
        acc_th += proofs[i].t_h * rho;
        acc_alpha += alphas[i] * (rho * c);
        acc_beta += betas[i] * (rho * c);
    }

    pow(&g, &acc_z) == acc_tg + acc_alpha && pow(&h, &acc_z) == acc_th + acc_beta
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ec::PrimeGroup;
    use ark_grumpkin::Projective as GrumpkinProjective;
    use ark_std::test_rng;

    type ScalarField = <GrumpkinProjective as PrimeGroup>::ScalarField;

    #[test]
    fn valid_proof_verifies_and_is_deterministic() {
        let mut rng = test_rng();

        let g = GrumpkinProjective::generator();
        let h = g * ScalarField::rand(&mut rng);
        let secret = ScalarField::rand(&mut rng);
        let alpha = g * secret;
        let beta = h * secret;

        let proof = ChaumPedersenProof::generate(secret, g, h, alpha, beta);
        assert!(proof.verify(g, h, alpha, beta), "valid proof should verify");

        let proof2 = ChaumPedersenProof::generate(secret, g, h, alpha, beta);
        assert_eq!(proof, proof2, "proofs should be deterministic");

        let wrong_alpha = g * ScalarField::rand(&mut rng);
        assert!(
            !proof.verify(g, h, wrong_alpha, beta),
            "proof with wrong alpha should fail"
        );

        let wrong_beta = h * ScalarField::rand(&mut rng);
        assert!(
            !proof.verify(g, h, alpha, wrong_beta),
            "proof with wrong beta should fail"
        );
    }

    #[test]
    fn batch_verification_catches_tampering() {
        let mut rng = test_rng();

        let g = GrumpkinProjective::generator();
        let h = g * ScalarField::rand(&mut rng);

        let mut proofs = Vec::new();
        let mut alphas = Vec::new();
        let mut betas = Vec::new();
        for _ in 0..5 {
            let secret = ScalarField::rand(&mut rng);
            let alpha = g * secret;
            let beta = h * secret;
            proofs.push(ChaumPedersenProof::generate(secret, g, h, alpha, beta));
            alphas.push(alpha);
            betas.push(beta);
        }

        assert!(batch_verify_chaum_pedersen(
            &proofs, g, h, &alphas, &betas, &mut rng
        ));

        alphas[2] = g * ScalarField::rand(&mut rng);
        assert!(!batch_verify_chaum_pedersen(
            &proofs, g, h, &alphas, &betas, &mut rng
        ));
    }
}
