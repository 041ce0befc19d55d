use crate::core::model::{IDENTIFIER_SIZE_BYTES, MAX_LEVELS};
use anyhow::anyhow;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};

/// LevelPrefix is the accumulated routing prefix of a contact table: bit `i` is the prefix bit
/// of level `i`, and `depth` is the number of levels the prefix covers.
/// Bits are stored most-significant first, so level `i` lives in byte `i / 8`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LevelPrefix {
    bits: [u8; IDENTIFIER_SIZE_BYTES],
    depth: usize,
}

impl Default for LevelPrefix {
    fn default() -> Self {
        LevelPrefix::new()
    }
}

impl LevelPrefix {
    /// The prefix of a table holding only level 0, whose bit is always 1.
    pub fn new() -> LevelPrefix {
        let mut bits = [0u8; IDENTIFIER_SIZE_BYTES];
        bits[0] = 0b1000_0000;
        LevelPrefix { bits, depth: 1 }
    }

    /// Builds a prefix from one bit per level; the first bit must be level 0's.
    pub fn from_bits(levels: &[bool]) -> anyhow::Result<LevelPrefix> {
        if levels.is_empty() || levels.len() > MAX_LEVELS {
            return Err(anyhow!(
                "prefix depth must be in 1..={}, got {}",
                MAX_LEVELS,
                levels.len()
            ));
        }
        if !levels[0] {
            return Err(anyhow!("level 0 prefix bit must be 1"));
        }
        let mut prefix = LevelPrefix {
            bits: [0u8; IDENTIFIER_SIZE_BYTES],
            depth: levels.len(),
        };
        for (level, bit) in levels.iter().enumerate() {
            prefix.set(level, *bit);
        }
        Ok(prefix)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The prefix bit of `level`, or `None` when the prefix does not reach that level.
    pub fn bit(&self, level: usize) -> Option<bool> {
        if level >= self.depth {
            return None;
        }
        Some(self.bits[level / 8] & (0x80 >> (level % 8)) != 0)
    }

    /// A copy with `level` set to `bit`; `level` may extend the prefix by exactly one.
    pub fn with_bit(&self, level: usize, bit: bool) -> anyhow::Result<LevelPrefix> {
        if level == 0 && !bit {
            return Err(anyhow!("level 0 prefix bit must be 1"));
        }
        if level > self.depth || level >= MAX_LEVELS {
            return Err(anyhow!(
                "cannot set prefix bit of level {} on a prefix of depth {}",
                level,
                self.depth
            ));
        }
        let mut prefix = *self;
        prefix.set(level, bit);
        prefix.depth = prefix.depth.max(level + 1);
        Ok(prefix)
    }

    /// A copy cut down to the first `depth` levels.
    pub fn truncated(&self, depth: usize) -> LevelPrefix {
        let depth = depth.clamp(1, self.depth);
        let mut prefix = LevelPrefix {
            bits: [0u8; IDENTIFIER_SIZE_BYTES],
            depth,
        };
        for level in 0..depth {
            prefix.set(level, self.bit(level).unwrap_or(false));
        }
        prefix
    }

    /// Number of leading levels on which both prefixes agree.
    pub fn common_prefix_len(&self, other: &LevelPrefix) -> usize {
        let depth = self.depth.min(other.depth);
        let mut common_bits = 0;
        for (byte_a, byte_b) in self.bits.iter().zip(other.bits.iter()) {
            let xor = byte_a ^ byte_b;
            if xor == 0 {
                common_bits += 8;
                if common_bits >= depth {
                    return depth;
                }
                continue;
            }
            // move along XOR from MSB to LSB; stop at the first differing bit
            for i in (0..8).rev() {
                if xor & (1 << i) != 0 {
                    return common_bits.min(depth);
                }
                common_bits += 1;
            }
        }
        common_bits.min(depth)
    }

    /// Renders the prefix one character per level, level 0 first.
    pub fn to_bit_string(&self) -> String {
        (0..self.depth)
            .map(|level| if self.bit(level) == Some(true) { '1' } else { '0' })
            .collect()
    }

    pub fn size_bytes(&self) -> usize {
        self.depth.div_ceil(8) + 2
    }

    fn set(&mut self, level: usize, bit: bool) {
        let mask = 0x80 >> (level % 8);
        if bit {
            self.bits[level / 8] |= mask;
        } else {
            self.bits[level / 8] &= !mask;
        }
    }
}

impl Display for LevelPrefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_bit_string())
    }
}

impl Debug for LevelPrefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_prefix_has_level_zero_set() {
        let prefix = LevelPrefix::new();
        assert_eq!(prefix.depth(), 1);
        assert_eq!(prefix.bit(0), Some(true));
        assert_eq!(prefix.bit(1), None);
        assert_eq!(prefix.to_bit_string(), "1");
    }

    #[test]
    fn test_with_bit_extends_by_one_level() {
        let prefix = LevelPrefix::new().with_bit(1, false).unwrap();
        let prefix = prefix.with_bit(2, true).unwrap();
        assert_eq!(prefix.to_bit_string(), "101");
        assert!(prefix.with_bit(5, true).is_err());
        assert!(prefix.with_bit(0, false).is_err());

        // overwriting an existing level keeps the depth
        let flipped = prefix.with_bit(1, true).unwrap();
        assert_eq!(flipped.to_bit_string(), "111");
    }

    #[test]
    fn test_common_prefix_len() {
        let a = LevelPrefix::from_bits(&[true, false, true, true]).unwrap();
        let b = LevelPrefix::from_bits(&[true, false, false]).unwrap();
        assert_eq!(a.common_prefix_len(&b), 2);
        assert_eq!(a.common_prefix_len(&a), 4);

        // agreement is capped by the shallower prefix
        let c = LevelPrefix::from_bits(&[true, false]).unwrap();
        assert_eq!(a.common_prefix_len(&c), 2);
    }

    #[test]
    fn test_common_prefix_len_across_byte_boundary() {
        let mut bits = vec![true; 12];
        let a = LevelPrefix::from_bits(&bits).unwrap();
        bits[10] = false;
        let b = LevelPrefix::from_bits(&bits).unwrap();
        assert_eq!(a.common_prefix_len(&b), 10);
    }

    #[test]
    fn test_truncated() {
        let a = LevelPrefix::from_bits(&[true, false, true, true]).unwrap();
        assert_eq!(a.truncated(2).to_bit_string(), "10");
        assert_eq!(a.truncated(0).to_bit_string(), "1");
        assert_eq!(a.truncated(9), a);
    }
}
