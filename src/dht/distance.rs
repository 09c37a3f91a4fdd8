//! 384-bit identifiers and XOR distance.
//!
//! Node IDs and blob keys share one 384-bit keyspace. Distance between two
//! identifiers is their bitwise XOR interpreted as an unsigned integer; the
//! routing table partitions `[0, 2^384)` into bucket ranges, so a fixed-width
//! unsigned integer type ([`U384`]) carries the range arithmetic.

use std::fmt;

/// A 384-bit identifier: a node ID or a blob key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id384([u8; 48]);

impl Id384 {
    pub const fn new(bytes: [u8; 48]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice; fails on any length other than 48.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 48] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 48] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_u384(&self) -> U384 {
        U384::from_be_bytes(&self.0)
    }

    /// XOR distance to another identifier.
    pub fn distance_to(&self, other: &Id384) -> U384 {
        let mut out = [0u8; 48];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        U384::from_be_bytes(&out)
    }
}

impl fmt::Debug for Id384 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id384({}…)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Id384 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A 20-byte RPC correlation ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcId([u8; 20]);

impl RpcId {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RpcId({}…)", &hex::encode(self.0)[..8])
    }
}

/// Distance comparator anchored at one key. Sorting and closeness checks in
/// the lookup and routing code all go through one of these.
#[derive(Clone, Copy)]
pub struct Distance {
    key: Id384,
}

impl Distance {
    pub fn new(key: Id384) -> Self {
        Self { key }
    }

    pub fn to(&self, id: &Id384) -> U384 {
        self.key.distance_to(id)
    }

    /// True if `a` is strictly closer to the anchor key than `b`.
    pub fn is_closer(&self, a: &Id384, b: &Id384) -> bool {
        self.to(a) < self.to(b)
    }
}

/// Fixed-width 384-bit unsigned integer.
///
/// Limbs are stored most-significant first so the derived lexicographic
/// ordering is the numeric ordering. Only the operations the routing table
/// needs are implemented; additions and subtractions that would wrap indicate
/// a broken range invariant and panic in debug builds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct U384 {
    limbs: [u64; 6],
}

impl U384 {
    pub const ZERO: U384 = U384 { limbs: [0; 6] };
    pub const ONE: U384 = U384 { limbs: [0, 0, 0, 0, 0, 1] };
    pub const MAX: U384 = U384 { limbs: [u64::MAX; 6] };

    pub fn from_be_bytes(bytes: &[u8; 48]) -> Self {
        let mut limbs = [0u64; 6];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *limb = u64::from_be_bytes(chunk);
        }
        Self { limbs }
    }

    pub fn to_be_bytes(&self) -> [u8; 48] {
        let mut out = [0u8; 48];
        for (i, limb) in self.limbs.iter().enumerate() {
            out[i * 8..(i + 1) * 8].copy_from_slice(&limb.to_be_bytes());
        }
        out
    }

    pub fn to_id(&self) -> Id384 {
        Id384::new(self.to_be_bytes())
    }

    pub fn is_zero(&self) -> bool {
        self.limbs.iter().all(|&l| l == 0)
    }

    pub fn add(&self, rhs: &U384) -> U384 {
        let (out, carry) = self.overflowing_add(rhs);
        debug_assert!(!carry, "U384 addition overflow");
        out
    }

    pub fn sub(&self, rhs: &U384) -> U384 {
        debug_assert!(self >= rhs, "U384 subtraction underflow");
        self.wrapping_sub(rhs)
    }

    fn overflowing_add(&self, rhs: &U384) -> (U384, bool) {
        let mut out = [0u64; 6];
        let mut carry = 0u64;
        for i in (0..6).rev() {
            let (sum, c1) = self.limbs[i].overflowing_add(rhs.limbs[i]);
            let (sum, c2) = sum.overflowing_add(carry);
            out[i] = sum;
            carry = (c1 as u64) + (c2 as u64);
        }
        (U384 { limbs: out }, carry != 0)
    }

    fn wrapping_sub(&self, rhs: &U384) -> U384 {
        let mut out = [0u64; 6];
        let mut borrow = 0u64;
        for i in (0..6).rev() {
            let (diff, b1) = self.limbs[i].overflowing_sub(rhs.limbs[i]);
            let (diff, b2) = diff.overflowing_sub(borrow);
            out[i] = diff;
            borrow = (b1 as u64) + (b2 as u64);
        }
        U384 { limbs: out }
    }

    pub fn shr1(&self) -> U384 {
        let mut out = [0u64; 6];
        let mut carry = 0u64;
        for i in 0..6 {
            out[i] = (self.limbs[i] >> 1) | (carry << 63);
            carry = self.limbs[i] & 1;
        }
        U384 { limbs: out }
    }

    /// Shift left by one, returning the bit shifted out of the top.
    fn shl1(&self) -> (U384, bool) {
        let mut out = [0u64; 6];
        let mut carry = 0u64;
        for i in (0..6).rev() {
            out[i] = (self.limbs[i] << 1) | carry;
            carry = self.limbs[i] >> 63;
        }
        (U384 { limbs: out }, carry != 0)
    }

    fn bit(&self, index: usize) -> bool {
        let limb = 5 - index / 64;
        (self.limbs[limb] >> (index % 64)) & 1 == 1
    }

    /// Remainder of `self / modulus` by shift-subtract. `modulus` must be
    /// non-zero.
    pub fn rem(&self, modulus: &U384) -> U384 {
        debug_assert!(!modulus.is_zero(), "U384 remainder by zero");
        let mut r = U384::ZERO;
        for i in (0..384).rev() {
            let (shifted, overflow) = r.shl1();
            r = shifted;
            if self.bit(i) {
                r = r.add(&U384::ONE);
            }
            // On overflow the real value is r + 2^384; the wrapping
            // subtraction of the modulus yields the correct remainder.
            if overflow || r >= *modulus {
                r = r.wrapping_sub(modulus);
            }
        }
        r
    }
}

impl fmt::Debug for U384 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U384(0x{})", hex::encode(self.to_be_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> Id384 {
        Id384::new([byte; 48])
    }

    fn u(n: u64) -> U384 {
        U384 {
            limbs: [0, 0, 0, 0, 0, n],
        }
    }

    #[test]
    fn distance_is_symmetric() {
        let a = id(0x13);
        let b = id(0xf0);
        assert_eq!(a.distance_to(&b), b.distance_to(&a));
    }

    #[test]
    fn distance_to_self_is_zero() {
        let a = id(0x42);
        assert!(a.distance_to(&a).is_zero());
    }

    #[test]
    fn closer_means_smaller_xor() {
        let key = id(0x00);
        let near = id(0x01);
        let far = id(0x80);
        let d = Distance::new(key);
        assert!(d.is_closer(&near, &far));
        assert!(!d.is_closer(&far, &near));
    }

    #[test]
    fn u384_ordering_matches_numeric() {
        assert!(u(1) < u(2));
        assert!(U384::ZERO < U384::MAX);
        let high = U384 {
            limbs: [1, 0, 0, 0, 0, 0],
        };
        assert!(u(u64::MAX) < high);
    }

    #[test]
    fn u384_add_sub_round_trip() {
        let a = u(1000);
        let b = u(17);
        assert_eq!(a.add(&b).sub(&b), a);
        assert_eq!(U384::MAX.sub(&U384::MAX), U384::ZERO);
    }

    #[test]
    fn u384_shr1_halves() {
        assert_eq!(u(8).shr1(), u(4));
        let high = U384 {
            limbs: [1, 0, 0, 0, 0, 0],
        };
        let expected = U384 {
            limbs: [0, 0x8000_0000_0000_0000, 0, 0, 0, 0],
        };
        assert_eq!(high.shr1(), expected);
    }

    #[test]
    fn u384_rem_small_values() {
        assert_eq!(u(10).rem(&u(3)), u(1));
        assert_eq!(u(10).rem(&u(5)), U384::ZERO);
        assert_eq!(u(2).rem(&u(7)), u(2));
        assert_eq!(U384::MAX.rem(&u(2)), u(1));
    }

    #[test]
    fn u384_bytes_round_trip() {
        let original = id(0xab).to_u384();
        assert_eq!(U384::from_be_bytes(&original.to_be_bytes()), original);
        assert_eq!(original.to_id(), id(0xab));
    }

    #[test]
    fn id_hex_round_trip() {
        let a = id(0x5c);
        assert_eq!(Id384::from_hex(&a.to_hex()), Some(a));
        assert_eq!(Id384::from_slice(&[0u8; 47]), None);
    }
}
