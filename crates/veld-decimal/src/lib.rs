//! # Veld Decimal - Fixed-Precision Decimal Numbers
//!
//! A decimal number is held as `0.f[0]f[1]... * BASE^exponent` with
//! base-10^9 limbs, most significant first, plus a sign code covering
//! the specials (NaN, signed zero, signed infinity). The storage is
//! variable length, which makes the type a useful exercise for
//! size-classed allocators; the arithmetic here is the small fragment
//! the runtime needs (compare, add, subtract, parse, print), not a full
//! numeric tower.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

/// Limb base: nine decimal digits per limb.
pub const BASE: u64 = 1_000_000_000;
/// Decimal digits per limb.
pub const BASE_FIG: usize = 9;

/// Errors from parsing or arithmetic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecimalError {
    #[error("invalid decimal literal: {0:?}")]
    Parse(String),

    #[error("exponent overflow")]
    ExponentOverflow,

    #[error("computation produced infinity")]
    Infinity,

    #[error("division by zero")]
    ZeroDivide,
}

/// Sign and special-value code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    NaN,
    PosZero,
    NegZero,
    Pos,
    Neg,
    PosInf,
    NegInf,
}

impl Sign {
    fn negate(self) -> Sign {
        match self {
            Sign::NaN => Sign::NaN,
            Sign::PosZero => Sign::NegZero,
            Sign::NegZero => Sign::PosZero,
            Sign::Pos => Sign::Neg,
            Sign::Neg => Sign::Pos,
            Sign::PosInf => Sign::NegInf,
            Sign::NegInf => Sign::PosInf,
        }
    }

    fn is_negative(self) -> bool {
        matches!(self, Sign::Neg | Sign::NegZero | Sign::NegInf)
    }
}

/// A fixed-precision decimal: `0.frac * BASE^exponent`.
///
/// Invariants for finite non-zero values: `frac` is non-empty, its first
/// limb is non-zero, and its last limb is non-zero (no redundant limbs
/// at either end).
#[derive(Debug, Clone)]
pub struct Decimal {
    sign: Sign,
    exponent: i32,
    frac: Box<[u32]>,
}

impl Decimal {
    pub fn nan() -> Self {
        Self {
            sign: Sign::NaN,
            exponent: 0,
            frac: Box::new([]),
        }
    }

    pub fn zero() -> Self {
        Self {
            sign: Sign::PosZero,
            exponent: 0,
            frac: Box::new([]),
        }
    }

    pub fn infinity(negative: bool) -> Self {
        Self {
            sign: if negative { Sign::NegInf } else { Sign::PosInf },
            exponent: 0,
            frac: Box::new([]),
        }
    }

    pub fn from_u64(value: u64) -> Self {
        if value == 0 {
            return Self::zero();
        }
        let mut limbs = Vec::new();
        let mut v = value;
        while v > 0 {
            limbs.push((v % BASE) as u32);
            v /= BASE;
        }
        limbs.reverse();
        let exponent = limbs.len() as i32;
        Self::normalized(Sign::Pos, exponent, limbs)
    }

    pub fn is_nan(&self) -> bool {
        self.sign == Sign::NaN
    }

    pub fn is_zero(&self) -> bool {
        matches!(self.sign, Sign::PosZero | Sign::NegZero)
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self.sign, Sign::PosInf | Sign::NegInf)
    }

    pub fn is_finite(&self) -> bool {
        !self.is_nan() && !self.is_infinite()
    }

    pub fn sign(&self) -> Sign {
        self.sign
    }

    pub fn exponent(&self) -> i32 {
        self.exponent
    }

    pub fn limbs(&self) -> &[u32] {
        &self.frac
    }

    /// Bytes of payload storage this value needs: the header fields plus
    /// the limb array. Size-classed allocators key off this.
    pub fn storage_bytes(&self) -> usize {
        std::mem::size_of::<Sign>()
            + std::mem::size_of::<i32>()
            + std::mem::size_of::<usize>()
            + self.frac.len() * std::mem::size_of::<u32>()
    }

    pub fn neg(&self) -> Decimal {
        Decimal {
            sign: self.sign.negate(),
            exponent: self.exponent,
            frac: self.frac.clone(),
        }
    }

    pub fn abs(&self) -> Decimal {
        let mut out = self.clone();
        out.sign = match out.sign {
            Sign::Neg => Sign::Pos,
            Sign::NegZero => Sign::PosZero,
            Sign::NegInf => Sign::PosInf,
            other => other,
        };
        out
    }

    // ========================================================================
    // Construction helpers
    // ========================================================================

    /// Build a finite value, trimming redundant limbs front and back.
    fn normalized(sign: Sign, mut exponent: i32, mut limbs: Vec<u32>) -> Decimal {
        while let Some(&0) = limbs.first() {
            limbs.remove(0);
            exponent -= 1;
        }
        while let Some(&0) = limbs.last() {
            limbs.pop();
        }
        if limbs.is_empty() {
            return Decimal {
                sign: if sign.is_negative() {
                    Sign::NegZero
                } else {
                    Sign::PosZero
                },
                exponent: 0,
                frac: Box::new([]),
            };
        }
        Decimal {
            sign,
            exponent,
            frac: limbs.into_boxed_slice(),
        }
    }

    // ========================================================================
    // Comparison
    // ========================================================================

    /// Total order over finite values and infinities; NaN compares as
    /// `None`.
    pub fn compare(&self, other: &Decimal) -> Option<Ordering> {
        if self.is_nan() || other.is_nan() {
            return None;
        }

        let ls = sign_rank(self.sign);
        let rs = sign_rank(other.sign);
        if ls != rs {
            return Some(ls.cmp(&rs));
        }

        // Same rank: zeros and like infinities are equal.
        if self.is_zero() || self.is_infinite() {
            return Some(Ordering::Equal);
        }

        let mag = self.compare_magnitude(other);
        Some(if self.sign == Sign::Neg { mag.reverse() } else { mag })
    }

    fn compare_magnitude(&self, other: &Decimal) -> Ordering {
        match self.exponent.cmp(&other.exponent) {
            Ordering::Equal => {}
            uneq => return uneq,
        }
        for (a, b) in self.frac.iter().zip(other.frac.iter()) {
            match a.cmp(b) {
                Ordering::Equal => {}
                uneq => return uneq,
            }
        }
        self.frac.len().cmp(&other.frac.len())
    }

    // ========================================================================
    // Addition / subtraction
    // ========================================================================

    pub fn add(&self, other: &Decimal) -> Decimal {
        if self.is_nan() || other.is_nan() {
            return Decimal::nan();
        }
        if self.is_infinite() || other.is_infinite() {
            return match (self.sign, other.sign) {
                (Sign::PosInf, Sign::NegInf) | (Sign::NegInf, Sign::PosInf) => Decimal::nan(),
                (Sign::PosInf, _) | (_, Sign::PosInf) => Decimal::infinity(false),
                _ => Decimal::infinity(true),
            };
        }
        if self.is_zero() {
            return other.clone();
        }
        if other.is_zero() {
            return self.clone();
        }

        let self_neg = self.sign == Sign::Neg;
        let other_neg = other.sign == Sign::Neg;

        if self_neg == other_neg {
            let (exponent, limbs) = add_magnitude(self, other);
            Decimal::normalized(
                if self_neg { Sign::Neg } else { Sign::Pos },
                exponent,
                limbs,
            )
        } else {
            match self.compare_magnitude(other) {
                Ordering::Equal => Decimal::zero(),
                Ordering::Greater => {
                    let (exponent, limbs) = sub_magnitude(self, other);
                    Decimal::normalized(
                        if self_neg { Sign::Neg } else { Sign::Pos },
                        exponent,
                        limbs,
                    )
                }
                Ordering::Less => {
                    let (exponent, limbs) = sub_magnitude(other, self);
                    Decimal::normalized(
                        if other_neg { Sign::Neg } else { Sign::Pos },
                        exponent,
                        limbs,
                    )
                }
            }
        }
    }

    pub fn sub(&self, other: &Decimal) -> Decimal {
        self.add(&other.neg())
    }

    // ========================================================================
    // Parsing and printing
    // ========================================================================

    /// Parse a decimal literal: optional sign, digits, optional decimal
    /// point, optional `e`/`E` exponent. `"NaN"`, `"Infinity"` and
    /// `"-Infinity"` parse to the specials.
    pub fn parse(input: &str) -> Result<Decimal, DecimalError> {
        let s = input.trim();
        match s {
            "NaN" => return Ok(Decimal::nan()),
            "Infinity" | "+Infinity" => return Ok(Decimal::infinity(false)),
            "-Infinity" => return Ok(Decimal::infinity(true)),
            _ => {}
        }

        let bytes = s.as_bytes();
        let mut pos = 0;

        let negative = match bytes.first() {
            Some(b'+') => {
                pos += 1;
                false
            }
            Some(b'-') => {
                pos += 1;
                true
            }
            _ => false,
        };

        let mut int_digits = Vec::new();
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            int_digits.push(bytes[pos] - b'0');
            pos += 1;
        }

        let mut frac_digits = Vec::new();
        if pos < bytes.len() && bytes[pos] == b'.' {
            pos += 1;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                frac_digits.push(bytes[pos] - b'0');
                pos += 1;
            }
        }

        if int_digits.is_empty() && frac_digits.is_empty() {
            return Err(DecimalError::Parse(input.to_string()));
        }

        let mut exp10: i64 = 0;
        if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
            pos += 1;
            let exp_str = &s[pos..];
            if exp_str.is_empty() {
                return Err(DecimalError::Parse(input.to_string()));
            }
            exp10 = exp_str
                .parse::<i64>()
                .map_err(|_| DecimalError::Parse(input.to_string()))?;
            pos = bytes.len();
        }

        if pos != bytes.len() {
            return Err(DecimalError::Parse(input.to_string()));
        }

        // All digits as one fraction, with the decimal point after
        // int_digits.len(), then shifted by the explicit exponent.
        let mut digits = int_digits;
        let point = digits.len() as i64 + exp10;
        digits.extend(frac_digits);

        // Strip leading zeros, tracking the point.
        let mut point = point;
        let mut start = 0;
        while start < digits.len() && digits[start] == 0 {
            start += 1;
            point -= 1;
        }
        let digits = &digits[start..];
        if digits.is_empty() {
            return Ok(if negative {
                Decimal {
                    sign: Sign::NegZero,
                    exponent: 0,
                    frac: Box::new([]),
                }
            } else {
                Decimal::zero()
            });
        }

        // Pad on the left so the point lands on a limb boundary.
        let pad = point.rem_euclid(BASE_FIG as i64) as usize;
        let lead = if pad == 0 { 0 } else { BASE_FIG - pad };
        let exponent_limbs = (point + lead as i64) / BASE_FIG as i64;
        if exponent_limbs > i32::MAX as i64 || exponent_limbs < i32::MIN as i64 {
            return Err(DecimalError::ExponentOverflow);
        }

        let mut padded = vec![0u8; lead];
        padded.extend_from_slice(digits);
        while padded.len() % BASE_FIG != 0 {
            padded.push(0);
        }

        let limbs: Vec<u32> = padded
            .chunks(BASE_FIG)
            .map(|chunk| chunk.iter().fold(0u32, |acc, &d| acc * 10 + d as u32))
            .collect();

        Ok(Decimal::normalized(
            if negative { Sign::Neg } else { Sign::Pos },
            exponent_limbs as i32,
            limbs,
        ))
    }

    /// Scientific rendering: `0.<digits>e<exp10>` with the limb padding
    /// stripped.
    pub fn to_scientific(&self) -> String {
        match self.sign {
            Sign::NaN => return "NaN".to_string(),
            Sign::PosInf => return "Infinity".to_string(),
            Sign::NegInf => return "-Infinity".to_string(),
            Sign::PosZero => return "0.0".to_string(),
            Sign::NegZero => return "-0.0".to_string(),
            _ => {}
        }

        let mut digits = String::new();
        for &limb in self.frac.iter() {
            digits.push_str(&format!("{:09}", limb));
        }
        let leading_zeros = digits.len() - digits.trim_start_matches('0').len();
        let trimmed = digits.trim_start_matches('0').trim_end_matches('0');
        let exp10 = self.exponent as i64 * BASE_FIG as i64 - leading_zeros as i64;

        format!(
            "{}0.{}e{}",
            if self.sign == Sign::Neg { "-" } else { "" },
            trimmed,
            exp10
        )
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_scientific())
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

fn sign_rank(sign: Sign) -> i8 {
    match sign {
        Sign::NegInf => -2,
        Sign::Neg => -1,
        Sign::PosZero | Sign::NegZero => 0,
        Sign::Pos => 1,
        Sign::PosInf => 2,
        Sign::NaN => unreachable!("NaN never ranks"),
    }
}

/// Magnitude addition of two aligned finite values; returns (exponent,
/// limbs) before normalization.
fn add_magnitude(a: &Decimal, b: &Decimal) -> (i32, Vec<u32>) {
    let high = a.exponent.max(b.exponent);
    let a_off = (high - a.exponent) as usize;
    let b_off = (high - b.exponent) as usize;
    let len = (a_off + a.frac.len()).max(b_off + b.frac.len());

    let mut limbs = vec![0u64; len + 1];
    for (i, &l) in a.frac.iter().enumerate() {
        limbs[a_off + i + 1] += l as u64;
    }
    for (i, &l) in b.frac.iter().enumerate() {
        limbs[b_off + i + 1] += l as u64;
    }

    // Carry propagation, least significant last.
    for i in (1..limbs.len()).rev() {
        if limbs[i] >= BASE {
            limbs[i] -= BASE;
            limbs[i - 1] += 1;
        }
    }

    (
        high + 1,
        limbs.into_iter().map(|l| l as u32).collect(),
    )
}

/// Magnitude subtraction (`a` strictly larger); returns (exponent,
/// limbs) before normalization.
fn sub_magnitude(a: &Decimal, b: &Decimal) -> (i32, Vec<u32>) {
    let high = a.exponent.max(b.exponent);
    let a_off = (high - a.exponent) as usize;
    let b_off = (high - b.exponent) as usize;
    let len = (a_off + a.frac.len()).max(b_off + b.frac.len());

    let mut limbs = vec![0i64; len];
    for (i, &l) in a.frac.iter().enumerate() {
        limbs[a_off + i] += l as i64;
    }
    for (i, &l) in b.frac.iter().enumerate() {
        limbs[b_off + i] -= l as i64;
    }

    for i in (1..limbs.len()).rev() {
        if limbs[i] < 0 {
            limbs[i] += BASE as i64;
            limbs[i - 1] -= 1;
        }
    }
    debug_assert!(limbs[0] >= 0);

    (high, limbs.into_iter().map(|l| l as u32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::parse(s).unwrap()
    }

    #[test]
    fn test_parse_and_print() {
        assert_eq!(dec("123.45").to_scientific(), "0.12345e3");
        assert_eq!(dec("-0.00012").to_scientific(), "-0.12e-3");
        assert_eq!(dec("1e9").to_scientific(), "0.1e10");
        assert_eq!(dec("0").to_scientific(), "0.0");
        assert_eq!(dec("NaN").to_scientific(), "NaN");
        assert_eq!(dec("-Infinity").to_scientific(), "-Infinity");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Decimal::parse("").is_err());
        assert!(Decimal::parse("abc").is_err());
        assert!(Decimal::parse("1.2.3").is_err());
        assert!(Decimal::parse("1e").is_err());
    }

    #[test]
    fn test_from_u64() {
        assert_eq!(Decimal::from_u64(0), Decimal::zero());
        assert_eq!(Decimal::from_u64(42), dec("42"));
        assert_eq!(Decimal::from_u64(1_000_000_007), dec("1000000007"));
    }

    #[test]
    fn test_compare() {
        assert_eq!(dec("1").compare(&dec("2")), Some(Ordering::Less));
        assert_eq!(dec("-1").compare(&dec("1")), Some(Ordering::Less));
        assert_eq!(dec("10").compare(&dec("10.0")), Some(Ordering::Equal));
        assert_eq!(dec("0.002").compare(&dec("0.001")), Some(Ordering::Greater));
        assert_eq!(
            dec("Infinity").compare(&dec("1e100")),
            Some(Ordering::Greater)
        );
        assert_eq!(dec("NaN").compare(&dec("1")), None);
    }

    #[test]
    fn test_add_same_sign() {
        assert_eq!(dec("1.5").add(&dec("2.25")), dec("3.75"));
        assert_eq!(dec("-1.5").add(&dec("-2.5")), dec("-4"));
        // Carry across limbs.
        assert_eq!(
            dec("999999999").add(&dec("1")),
            dec("1000000000")
        );
    }

    #[test]
    fn test_add_mixed_sign() {
        assert_eq!(dec("5").add(&dec("-3")), dec("2"));
        assert_eq!(dec("3").add(&dec("-5")), dec("-2"));
        assert_eq!(dec("5").add(&dec("-5")), Decimal::zero());
    }

    #[test]
    fn test_sub() {
        assert_eq!(dec("10").sub(&dec("0.5")), dec("9.5"));
        assert_eq!(
            dec("1000000000000").sub(&dec("1")),
            dec("999999999999")
        );
    }

    #[test]
    fn test_specials_propagate() {
        assert!(dec("NaN").add(&dec("1")).is_nan());
        assert!(dec("Infinity").add(&dec("-Infinity")).is_nan());
        assert_eq!(dec("Infinity").add(&dec("5")), Decimal::infinity(false));
    }

    #[test]
    fn test_print_parse_roundtrip() {
        fn prop(int_part: u64, frac_part: u32) -> bool {
            let literal = format!("{}.{}", int_part, frac_part);
            let value = Decimal::parse(&literal).unwrap();
            let reparsed = Decimal::parse(&value.to_scientific()).unwrap();
            value == reparsed
        }
        quickcheck::quickcheck(prop as fn(u64, u32) -> bool);
    }

    #[test]
    fn test_add_commutes() {
        fn prop(a: u32, b: u32) -> bool {
            let x = Decimal::from_u64(a as u64);
            let y = Decimal::from_u64(b as u64);
            x.add(&y) == y.add(&x)
        }
        quickcheck::quickcheck(prop as fn(u32, u32) -> bool);
    }

    #[test]
    fn test_storage_scales_with_precision() {
        let small = dec("1");
        let large = dec("123456789012345678901234567890.5");
        assert!(large.storage_bytes() > small.storage_bytes());
        assert!(large.limbs().len() >= 4);
    }
}
