//! ElGamal ciphertexts over the round group.
//!
//! A shuffle stage re-randomizes ciphertexts by adding an encryption layer
//! with fresh randomness; decryption is threshold-style, combining one share
//! per key-share holder.

use ark_ec::{CurveGroup, PrimeGroup};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::Zero;
use serde::{Deserialize, Serialize};

use crate::arith::FixedBase;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, CanonicalSerialize,
    CanonicalDeserialize,
)]
#[serde(bound = "")]
pub struct ElGamalCiphertext<C: CurveGroup> {
    #[serde(with = "crate::crypto_serde::curve")]
    pub c1: C,
    #[serde(with = "crate::crypto_serde::curve")]
    pub c2: C,
}

impl<C: CurveGroup> ElGamalCiphertext<C> {
    pub fn new(c1: C, c2: C) -> Self {
        Self { c1, c2 }
    }

    /// Encrypt a group element: `(r*G, M + r*PK)`.
    pub fn encrypt(message: C, randomness: C::ScalarField, public_key: C) -> Self {
        Self::new(C::zero(), message).add_encryption_layer(randomness, public_key)
    }

    /// Add one re-randomization layer: `(c1 + r*G, c2 + r*PK)`.
    pub fn add_encryption_layer(&self, randomness: C::ScalarField, public_key: C) -> Self {
        let generator = C::generator();
        Self {
            c1: self.c1 + generator * randomness,
            c2: self.c2 + public_key * randomness,
        }
    }

    /// Same as [`add_encryption_layer`], with the generator multiplication
    /// served from a precomputed table.
    ///
    /// [`add_encryption_layer`]: Self::add_encryption_layer
    pub fn add_encryption_layer_with(
        &self,
        generator_table: &FixedBase<C>,
        randomness: C::ScalarField,
        public_key: C,
    ) -> Self {
        Self {
            c1: self.c1 + generator_table.mul(&randomness),
            c2: self.c2 + public_key * randomness,
        }
    }

    /// One holder's decryption share: `s_i * c1`.
    pub fn decryption_share(&self, secret_share: &C::ScalarField) -> C {
        self.c1 * *secret_share
    }

    /// Remove all encryption layers given every holder's share.
    pub fn combine_shares(&self, shares: &[C]) -> C {
        self.c2 - shares.iter().fold(C::zero(), |acc, s| acc + s)
    }
}
