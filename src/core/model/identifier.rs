use crate::core::model::IDENTIFIER_SIZE_BYTES;
use anyhow::anyhow;
use num_bigint::BigUint;
use rand::Rng;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};

pub const ZERO: Identifier = Identifier([0; IDENTIFIER_SIZE_BYTES]);
pub const MAX: Identifier = Identifier([255; IDENTIFIER_SIZE_BYTES]);

/// Identifier is a 32-byte key naming either a skip graph node or a peer hosting nodes.
/// Identifiers are ordered as big-endian unsigned integers, which makes them points on the
/// `2^256` ring the key-space substrate partitions among peers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier([u8; IDENTIFIER_SIZE_BYTES]);

impl Identifier {
    /// Converts the input byte slice into an Identifier. The input must be at most 32 bytes long.
    /// If the input is less than 32 bytes, it will be padded with zeros from the left.
    /// If the input is more than 32 bytes, an error will be returned.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Identifier> {
        if bytes.len() > IDENTIFIER_SIZE_BYTES {
            return Err(anyhow!(
                "identifier size is too large, expected {} bytes, got {} bytes",
                IDENTIFIER_SIZE_BYTES,
                bytes.len()
            ));
        }
        let mut identifier = [0; IDENTIFIER_SIZE_BYTES];
        let offset = IDENTIFIER_SIZE_BYTES - bytes.len();
        identifier[offset..].copy_from_slice(bytes);
        Ok(Identifier(identifier))
    }

    /// Converts the input hex string into an Identifier.
    pub fn from_string(s: &str) -> anyhow::Result<Identifier> {
        let decoded = hex::decode(s)?;
        Identifier::from_bytes(&decoded)
    }

    /// Small identifiers are handy for tests and bootstrap configuration.
    pub fn from_u64(v: u64) -> Identifier {
        let mut identifier = [0; IDENTIFIER_SIZE_BYTES];
        identifier[IDENTIFIER_SIZE_BYTES - 8..].copy_from_slice(&v.to_be_bytes());
        Identifier(identifier)
    }

    /// Draws a uniformly random identifier from the given generator.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Identifier {
        Identifier(rng.random::<[u8; IDENTIFIER_SIZE_BYTES]>())
    }

    /// Converts the Identifier into a byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Returns the identifier as an unsigned big integer.
    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    /// Clockwise distance from `self` to `other` on the `2^256` ring.
    pub fn ring_distance_to(&self, other: &Identifier) -> BigUint {
        let modulus = BigUint::from(1u8) << (IDENTIFIER_SIZE_BYTES * 8);
        let from = self.to_biguint();
        let to = other.to_biguint();
        if to >= from {
            to - from
        } else {
            modulus - from + to
        }
    }

    /// Returns true if the identifier is zero, i.e., all bytes are zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&byte| byte == 0)
    }

    /// Returns true if the identifier is the maximum value, i.e., all bytes are 255.
    pub fn is_max(&self) -> bool {
        self.0.iter().all(|&byte| byte == 255)
    }

    /// First four bytes in hex; enough to tell nodes apart in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// Debug prints the same hex string as Display.
impl Debug for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}
