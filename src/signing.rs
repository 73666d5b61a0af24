//! Schnorr signatures over the round curve.
//!
//! Entry-log chains are signed with the peer's long-lived signing key; the
//! nonce is derived deterministically from the secret and the message, so
//! signing is stateless and never reuses a nonce across messages.

use ark_ec::{CurveGroup, PrimeGroup};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};

use crate::transcript::{derive_nonce, TranscriptBuilder};

const NONCE_DOMAIN: &str = "signing/nonce/v1";
const CHALLENGE_DOMAIN: &str = "signing/challenge/v1";

/// Values that can be signed into a canonical transcript.
pub trait Signable {
    /// Logical kind string used for domain separation.
    fn domain_kind(&self) -> &'static str;

    /// Append this value's canonical representation into the builder.
    fn write_transcript(&self, builder: &mut TranscriptBuilder);

    fn to_signing_bytes(&self) -> Vec<u8> {
        let mut builder = TranscriptBuilder::new(self.domain_kind());
        self.write_transcript(&mut builder);
        builder.finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct Signature<C: CurveGroup> {
    /// Commitment `R = k*G`.
    pub commitment: C,
    /// Response `s = k + c*sk`.
    pub response: C::ScalarField,
}

fn challenge<C: CurveGroup>(public: &C, commitment: &C, message: &[u8]) -> C::ScalarField {
    let mut builder = TranscriptBuilder::new(CHALLENGE_DOMAIN);
    builder.append_canonical(public);
    builder.append_canonical(commitment);
    builder.append_bytes(message);
    builder.into_xof().challenge_scalar()
}

pub fn sign<C: CurveGroup>(secret: &C::ScalarField, public: &C, message: &[u8]) -> Signature<C> {
    let k = derive_nonce::<C::ScalarField>(NONCE_DOMAIN, secret, message);
    let commitment = C::generator() * k;
    let c = challenge(public, &commitment, message);
    Signature {
        commitment,
        response: k + c * secret,
    }
}

pub fn verify<C: CurveGroup>(public: &C, message: &[u8], signature: &Signature<C>) -> bool {
    let c = challenge(public, &signature.commitment, message);
    C::generator() * signature.response == signature.commitment + *public * c
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use ark_grumpkin::Projective as GrumpkinProjective;
    use ark_std::test_rng;

    #[test]
    fn sign_verify_round_trip() {
        let mut rng = test_rng();
        let key = KeyPair::<GrumpkinProjective>::generate(&mut rng);
        let sig = sign(&key.secret, &key.public, b"entry");
        assert!(verify(&key.public, b"entry", &sig));
    }

    #[test]
    fn verification_rejects_wrong_key_and_message() {
        let mut rng = test_rng();
        let key = KeyPair::<GrumpkinProjective>::generate(&mut rng);
        let other = KeyPair::<GrumpkinProjective>::generate(&mut rng);
        let sig = sign(&key.secret, &key.public, b"entry");
        assert!(!verify(&other.public, b"entry", &sig));
        assert!(!verify(&key.public, b"other entry", &sig));
    }

    #[test]
    fn signing_is_deterministic() {
        let mut rng = test_rng();
        let key = KeyPair::<GrumpkinProjective>::generate(&mut rng);
        assert_eq!(
            sign(&key.secret, &key.public, b"entry"),
            sign(&key.secret, &key.public, b"entry")
        );
    }
}
