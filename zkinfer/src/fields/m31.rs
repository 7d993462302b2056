//! Mersenne-31 prime field, `P = 2^31 - 1`.
//!
//! Signed fixed-point values are embedded with the usual convention:
//! `0..=P/2` are non-negative, `P/2+1..P` encode `v - P`.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use num_traits::{One, Zero};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use stwo::core::fields::m31::BaseField;
use stwo::core::fields::FieldExpOps;

/// The field modulus.
pub const P: u32 = (1 << 31) - 1;

/// Largest value interpreted as non-negative.
pub const HALF_P: u32 = P / 2;

/// Bit width of the signed values that embed without wrapping.
pub const SIGNED_BITS: u32 = 31;

/// A base field element with the signed fixed-point embedding on top.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct M31(BaseField);

impl M31 {
    /// Reduce any `u64` into the field.
    pub fn reduce(value: u64) -> Self {
        // One fold keeps the operand inside the range the base field reduces.
        let folded = (value & P as u64) + (value >> 31);
        Self(BaseField::reduce(folded))
    }

    /// Wrap a value already known to be canonical.
    pub fn from_canonical(value: u32) -> Option<Self> {
        (value < P).then(|| Self(BaseField::from_u32_unchecked(value)))
    }

    /// Canonical representative in `0..P`.
    pub fn value(self) -> u32 {
        self.0 .0
    }

    /// Embed a signed integer.
    pub fn from_i64(value: i64) -> Self {
        let r = value.rem_euclid(P as i64);
        Self(BaseField::from_u32_unchecked(r as u32))
    }

    /// Signed interpretation of this element.
    pub fn to_signed(self) -> i64 {
        let v = self.value();
        if v <= HALF_P {
            v as i64
        } else {
            v as i64 - P as i64
        }
    }

    pub fn pow(self, mut exp: u64) -> Self {
        let mut base = self;
        let mut acc = Self::one();
        while exp > 0 {
            if exp & 1 == 1 {
                acc *= base;
            }
            base *= base;
            exp >>= 1;
        }
        acc
    }

    pub fn inverse(self) -> Option<Self> {
        if self.is_zero() {
            return None;
        }
        Some(Self(self.0.inverse()))
    }

    pub fn to_le_bytes(self) -> [u8; 4] {
        self.value().to_le_bytes()
    }
}

impl From<BaseField> for M31 {
    fn from(value: BaseField) -> Self {
        Self(value)
    }
}

impl From<M31> for BaseField {
    fn from(value: M31) -> Self {
        value.0
    }
}

impl From<u32> for M31 {
    fn from(value: u32) -> Self {
        Self::reduce(value as u64)
    }
}

impl From<u64> for M31 {
    fn from(value: u64) -> Self {
        Self::reduce(value)
    }
}

impl Default for M31 {
    fn default() -> Self {
        Self::zero()
    }
}

impl Hash for M31 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value().hash(state);
    }
}

impl PartialOrd for M31 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for M31 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value().cmp(&other.value())
    }
}

impl Serialize for M31 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.value())
    }
}

impl<'de> Deserialize<'de> for M31 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u32::deserialize(deserializer)?;
        Self::from_canonical(raw)
            .ok_or_else(|| de::Error::custom(format!("{raw} is not a canonical M31 element")))
    }
}

impl fmt::Debug for M31 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M31({})", self.value())
    }
}

impl fmt::Display for M31 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

impl Add for M31 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for M31 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Mul for M31 {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self(self.0 * rhs.0)
    }
}

impl Neg for M31 {
    type Output = Self;

    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl AddAssign for M31 {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl SubAssign for M31 {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl MulAssign for M31 {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl Sum for M31 {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, v| acc + v)
    }
}

impl Zero for M31 {
    fn zero() -> Self {
        Self(BaseField::from_u32_unchecked(0))
    }

    fn is_zero(&self) -> bool {
        self.value() == 0
    }
}

impl One for M31 {
    fn one() -> Self {
        Self(BaseField::from_u32_unchecked(1))
    }
}
