//! # Key Abstraction
//!
//! The tree is generic over the ordered scalar it indexes. A [`Key`] knows
//! its fixed encoded width, its ordering sentinels, and its neighbours on the
//! number line. The successor function is what makes the fast-path rule "the
//! inserted key extends the run one past the hint's right bound" expressible
//! for any key type, not just machine integers.

use crate::record::Value;

pub trait Key:
    Copy + Ord + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static
{
    /// Fixed byte width of the on-page encoding.
    const ENCODED_LEN: usize;
    /// Smallest value of the domain; doubles as the max-key sentinel of an
    /// empty leaf.
    const MIN: Self;
    /// Largest value of the domain; doubles as the min-key sentinel of an
    /// empty leaf.
    const MAX: Self;

    /// The next key up, or `None` at the top of the domain.
    fn successor(self) -> Option<Self>;
    /// The next key down, or `None` at the bottom of the domain.
    fn predecessor(self) -> Option<Self>;

    /// Writes `ENCODED_LEN` bytes at the front of `buf`.
    fn encode(self, buf: &mut [u8]);
    /// Reads `ENCODED_LEN` bytes from the front of `buf`.
    fn decode(buf: &[u8]) -> Self;

    /// Extracts a key from a tuple field, if the field holds this key type.
    fn from_value(value: &Value) -> Option<Self>;
    fn to_value(self) -> Value;
}

impl Key for i32 {
    const ENCODED_LEN: usize = 4;
    const MIN: Self = i32::MIN;
    const MAX: Self = i32::MAX;

    fn successor(self) -> Option<Self> {
        self.checked_add(1)
    }

    fn predecessor(self) -> Option<Self> {
        self.checked_sub(1)
    }

    fn encode(self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        let mut b = [0u8; 4];
        b.copy_from_slice(&buf[..4]);
        i32::from_le_bytes(b)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn to_value(self) -> Value {
        Value::Int(self)
    }
}

impl Key for i64 {
    const ENCODED_LEN: usize = 8;
    const MIN: Self = i64::MIN;
    const MAX: Self = i64::MAX;

    fn successor(self) -> Option<Self> {
        self.checked_add(1)
    }

    fn predecessor(self) -> Option<Self> {
        self.checked_sub(1)
    }

    fn encode(self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[..8]);
        i64::from_le_bytes(b)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    fn to_value(self) -> Value {
        Value::Long(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut buf = [0u8; 8];
        (-123i32).encode(&mut buf);
        assert_eq!(i32::decode(&buf), -123);

        i64::MAX.encode(&mut buf);
        assert_eq!(i64::decode(&buf), i64::MAX);
    }

    #[test]
    fn successor_saturates_at_domain_top() {
        assert_eq!(5i32.successor(), Some(6));
        assert_eq!(i32::MAX.successor(), None);
        assert_eq!(i64::MIN.predecessor(), None);
    }

    #[test]
    fn from_value_checks_the_variant() {
        assert_eq!(i32::from_value(&Value::Int(9)), Some(9));
        assert_eq!(i32::from_value(&Value::Long(9)), None);
        assert_eq!(i64::from_value(&Value::Long(9)), Some(9));
    }
}
