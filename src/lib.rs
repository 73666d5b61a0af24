pub mod arith;
pub mod crypto_serde;
pub mod elgamal;
pub mod error;
pub mod keys;
pub mod proofs;
pub mod review;
pub mod rounds;
pub mod signing;
pub mod transcript;

pub use error::RoundError;
pub use keys::{
    BulkPolicy, BulkTopology, KeyPair, KeyReusePolicy, PeerId, PeerIdentity, ProofSystem,
    PublicKeySet, RosterChangePolicy, Roster, RoundConfig, RoundDescriptor, RoundId, RoundKind,
    RoundNonce,
};
pub use rounds::{
    AnyRound, BulkMaterial, Destination, Envelope, LocalPeer, Round, RoundFault, RoundInput,
    RoundState,
};
