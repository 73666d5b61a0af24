pub mod chaum_pedersen;
pub mod ring;

pub use chaum_pedersen::{batch_verify_chaum_pedersen, ChaumPedersenProof};
pub use ring::RingKnowledgeProof;
