//! Serde helpers for encoding algebraic values as 0x-prefixed hex strings.

use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use serde::de::Error as DeError;
use serde::ser::Error as SerError;
use serde::{Deserialize, Deserializer, Serializer};

pub fn canonical_serialize_hex<T: CanonicalSerialize>(value: &T) -> Result<String, String> {
    let mut bytes = Vec::new();
    value
        .serialize_compressed(&mut bytes)
        .map_err(|e| e.to_string())?;
    Ok(format!("0x{}", hex::encode(bytes)))
}

pub fn canonical_deserialize_hex<T: CanonicalDeserialize>(encoded: &str) -> Result<T, String> {
    let stripped = encoded.strip_prefix("0x").unwrap_or(encoded);
    let bytes = hex::decode(stripped).map_err(|e| e.to_string())?;
    T::deserialize_compressed(&mut &bytes[..]).map_err(|e| e.to_string())
}

/// Serde adapter for a single canonically serializable value (curve point,
/// field element).
pub mod curve {
    use super::*;

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: CanonicalSerialize,
        S: Serializer,
    {
        let hex = canonical_serialize_hex(value).map_err(SerError::custom)?;
        serializer.serialize_str(&hex)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: CanonicalDeserialize,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        canonical_deserialize_hex(&s).map_err(DeError::custom)
    }
}

/// Serde adapter for vectors of canonically serializable values.
pub mod curve_vec {
    use super::*;

    pub fn serialize<T, S>(values: &[T], serializer: S) -> Result<S::Ok, S::Error>
    where
        T: CanonicalSerialize,
        S: Serializer,
    {
        let encoded: Vec<String> = values
            .iter()
            .map(|v| canonical_serialize_hex(v).map_err(SerError::custom))
            .collect::<Result<_, _>>()?;
        serde::Serialize::serialize(&encoded, serializer)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        T: CanonicalDeserialize,
        D: Deserializer<'de>,
    {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|s| canonical_deserialize_hex(s).map_err(DeError::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ff::UniformRand;
    use ark_grumpkin::Projective as GrumpkinProjective;
    use ark_std::test_rng;

    #[test]
    fn hex_round_trips_curve_points() {
        let mut rng = test_rng();
        let point = GrumpkinProjective::rand(&mut rng);
        let hex = canonical_serialize_hex(&point).unwrap();
        assert!(hex.starts_with("0x"));
        let back: GrumpkinProjective = canonical_deserialize_hex(&hex).unwrap();
        assert_eq!(point, back);
    }

    #[test]
    fn hex_rejects_garbage() {
        assert!(canonical_deserialize_hex::<GrumpkinProjective>("0xzz").is_err());
    }
}
