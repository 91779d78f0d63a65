//! Overflow-checked exponentiation
//!
//! Integer exponentiation detects overflow *before* multiplying, using a
//! per-exponent maximum-base table: for exponent `e`, any |base| above the
//! table entry overflows the result type, any at or below it cannot. The
//! multiplication itself is then plain square-and-multiply with wrapping
//! ops, which the table guarantees never wraps in the result.
//!
//! Edge cases follow the language semantics:
//! - negative exponent: base 0 overflows (division by zero), anything
//!   else truncates to 0, except bases ±1 which stay ±1
//! - `0 ** 0` is a domain error and reported as overflow
//! - float results that come out infinite are overflow

struct PowInfo {
    max_base_u64: u64,
    max_base_i64: u32,
    max_base_u32: u16,
    max_base_i32: u16,
}

/// Maximum base per exponent; entries 0 and 1 are special-cased and hold
/// zeros. Exponents past the table (>= 64) only work for bases 0 and ±1.
#[rustfmt::skip]
static POW_INFO: [PowInfo; 64] = [
    PowInfo { max_base_u64: 0,          max_base_i64: 0,          max_base_u32: 0,     max_base_i32: 0 },     // 0
    PowInfo { max_base_u64: 0,          max_base_i64: 0,          max_base_u32: 0,     max_base_i32: 0 },     // 1
    PowInfo { max_base_u64: 3037000499, max_base_i64: 2147483647, max_base_u32: 65535, max_base_i32: 46340 }, // 2
    PowInfo { max_base_u64: 2097152,    max_base_i64: 1664510,    max_base_u32: 1625,  max_base_i32: 1290 },  // 3
    PowInfo { max_base_u64: 55108,      max_base_i64: 46340,      max_base_u32: 255,   max_base_i32: 215 },   // 4
    PowInfo { max_base_u64: 6208,       max_base_i64: 5404,       max_base_u32: 84,    max_base_i32: 73 },    // 5
    PowInfo { max_base_u64: 1448,       max_base_i64: 1290,       max_base_u32: 40,    max_base_i32: 35 },    // 6
    PowInfo { max_base_u64: 511,        max_base_i64: 463,        max_base_u32: 23,    max_base_i32: 21 },    // 7
    PowInfo { max_base_u64: 234,        max_base_i64: 215,        max_base_u32: 15,    max_base_i32: 14 },    // 8
    PowInfo { max_base_u64: 128,        max_base_i64: 118,        max_base_u32: 11,    max_base_i32: 10 },    // 9
    PowInfo { max_base_u64: 78,         max_base_i64: 73,         max_base_u32: 9,     max_base_i32: 8 },     // 10
    PowInfo { max_base_u64: 52,         max_base_i64: 49,         max_base_u32: 7,     max_base_i32: 7 },     // 11
    PowInfo { max_base_u64: 38,         max_base_i64: 35,         max_base_u32: 6,     max_base_i32: 5 },     // 12
    PowInfo { max_base_u64: 28,         max_base_i64: 27,         max_base_u32: 5,     max_base_i32: 5 },     // 13
    PowInfo { max_base_u64: 22,         max_base_i64: 21,         max_base_u32: 4,     max_base_i32: 4 },     // 14
    PowInfo { max_base_u64: 18,         max_base_i64: 17,         max_base_u32: 4,     max_base_i32: 4 },     // 15
    PowInfo { max_base_u64: 15,         max_base_i64: 14,         max_base_u32: 3,     max_base_i32: 3 },     // 16
    PowInfo { max_base_u64: 13,         max_base_i64: 12,         max_base_u32: 3,     max_base_i32: 3 },     // 17
    PowInfo { max_base_u64: 11,         max_base_i64: 10,         max_base_u32: 3,     max_base_i32: 3 },     // 18
    PowInfo { max_base_u64: 9,          max_base_i64: 9,          max_base_u32: 3,     max_base_i32: 3 },     // 19
    PowInfo { max_base_u64: 8,          max_base_i64: 8,          max_base_u32: 3,     max_base_i32: 2 },     // 20
    PowInfo { max_base_u64: 8,          max_base_i64: 7,          max_base_u32: 2,     max_base_i32: 2 },     // 21
    PowInfo { max_base_u64: 7,          max_base_i64: 7,          max_base_u32: 2,     max_base_i32: 2 },     // 22
    PowInfo { max_base_u64: 6,          max_base_i64: 6,          max_base_u32: 2,     max_base_i32: 2 },     // 23
    PowInfo { max_base_u64: 6,          max_base_i64: 5,          max_base_u32: 2,     max_base_i32: 2 },     // 24
    PowInfo { max_base_u64: 5,          max_base_i64: 5,          max_base_u32: 2,     max_base_i32: 2 },     // 25
    PowInfo { max_base_u64: 5,          max_base_i64: 5,          max_base_u32: 2,     max_base_i32: 2 },     // 26
    PowInfo { max_base_u64: 5,          max_base_i64: 4,          max_base_u32: 2,     max_base_i32: 2 },     // 27
    PowInfo { max_base_u64: 4,          max_base_i64: 4,          max_base_u32: 2,     max_base_i32: 2 },     // 28
    PowInfo { max_base_u64: 4,          max_base_i64: 4,          max_base_u32: 2,     max_base_i32: 2 },     // 29
    PowInfo { max_base_u64: 4,          max_base_i64: 4,          max_base_u32: 2,     max_base_i32: 2 },     // 30
    PowInfo { max_base_u64: 4,          max_base_i64: 4,          max_base_u32: 2,     max_base_i32: 1 },     // 31
    PowInfo { max_base_u64: 3,          max_base_i64: 3,          max_base_u32: 1,     max_base_i32: 1 },     // 32
    PowInfo { max_base_u64: 3,          max_base_i64: 3,          max_base_u32: 1,     max_base_i32: 1 },     // 33
    PowInfo { max_base_u64: 3,          max_base_i64: 3,          max_base_u32: 1,     max_base_i32: 1 },     // 34
    PowInfo { max_base_u64: 3,          max_base_i64: 3,          max_base_u32: 1,     max_base_i32: 1 },     // 35
    PowInfo { max_base_u64: 3,          max_base_i64: 3,          max_base_u32: 1,     max_base_i32: 1 },     // 36
    PowInfo { max_base_u64: 3,          max_base_i64: 3,          max_base_u32: 1,     max_base_i32: 1 },     // 37
    PowInfo { max_base_u64: 3,          max_base_i64: 3,          max_base_u32: 1,     max_base_i32: 1 },     // 38
    PowInfo { max_base_u64: 3,          max_base_i64: 3,          max_base_u32: 1,     max_base_i32: 1 },     // 39
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 40
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 41
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 42
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 43
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 44
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 45
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 46
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 47
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 48
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 49
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 50
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 51
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 52
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 53
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 54
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 55
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 56
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 57
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 58
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 59
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 60
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 61
    PowInfo { max_base_u64: 2,          max_base_i64: 2,          max_base_u32: 1,     max_base_i32: 1 },     // 62
    PowInfo { max_base_u64: 2,          max_base_i64: 1,          max_base_u32: 1,     max_base_i32: 1 },     // 63
];

/// `base ** exponent` for i32; `None` on overflow
pub fn pow_i32(base: i32, exponent: i32) -> Option<i32> {
    if exponent < 0 {
        // Result truncates to zero, except that base 0 divides by zero
        return if base == 0 { None } else { Some(0) };
    }
    if exponent == 0 && base == 0 {
        // Domain error
        return None;
    }
    if exponent >= 31 {
        return match base {
            -1 => Some(if exponent & 1 == 1 { -1 } else { 1 }),
            0 => Some(0),
            1 => Some(1),
            _ => None,
        };
    }
    let max_base = POW_INFO[exponent as usize].max_base_i32;
    if max_base != 0 && (max_base as i32) < base.wrapping_abs() {
        return None;
    }
    let mut result: i32 = 1;
    let mut b = base;
    let mut e = exponent;
    while e != 0 {
        if e & 1 == 1 {
            result = result.wrapping_mul(b);
        }
        e >>= 1;
        b = b.wrapping_mul(b);
    }
    Some(result)
}

/// `base ** exponent` for u32; `None` on overflow
pub fn pow_u32(base: u32, exponent: u32) -> Option<u32> {
    if exponent == 0 && base == 0 {
        return None;
    }
    if exponent >= 32 {
        return match base {
            0 => Some(0),
            1 => Some(1),
            _ => None,
        };
    }
    let max_base = POW_INFO[exponent as usize].max_base_u32;
    if max_base != 0 && (max_base as u32) < base {
        return None;
    }
    let mut result: u32 = 1;
    let mut b = base;
    let mut e = exponent;
    while e != 0 {
        if e & 1 == 1 {
            result = result.wrapping_mul(b);
        }
        e >>= 1;
        b = b.wrapping_mul(b);
    }
    Some(result)
}

/// `base ** exponent` for i64; `None` on overflow
pub fn pow_i64(base: i64, exponent: i64) -> Option<i64> {
    if exponent < 0 {
        return if base == 0 { None } else { Some(0) };
    }
    if exponent == 0 && base == 0 {
        return None;
    }
    if exponent >= 63 {
        return match base {
            -1 => Some(if exponent & 1 == 1 { -1 } else { 1 }),
            0 => Some(0),
            1 => Some(1),
            _ => None,
        };
    }
    let max_base = POW_INFO[exponent as usize].max_base_i64;
    if max_base != 0 && (max_base as i64) < base.wrapping_abs() {
        return None;
    }
    let mut result: i64 = 1;
    let mut b = base;
    let mut e = exponent;
    while e != 0 {
        if e & 1 == 1 {
            result = result.wrapping_mul(b);
        }
        e >>= 1;
        b = b.wrapping_mul(b);
    }
    Some(result)
}

/// `base ** exponent` for u64; `None` on overflow
pub fn pow_u64(base: u64, exponent: u64) -> Option<u64> {
    if exponent == 0 && base == 0 {
        return None;
    }
    if exponent >= 64 {
        return match base {
            0 => Some(0),
            1 => Some(1),
            _ => None,
        };
    }
    let max_base = POW_INFO[exponent as usize].max_base_u64;
    if max_base != 0 && max_base < base {
        return None;
    }
    let mut result: u64 = 1;
    let mut b = base;
    let mut e = exponent;
    while e != 0 {
        if e & 1 == 1 {
            result = result.wrapping_mul(b);
        }
        e >>= 1;
        b = b.wrapping_mul(b);
    }
    Some(result)
}

/// `base ** exponent` for f32; `None` when the result is infinite
pub fn pow_f32(base: f32, exponent: f32) -> Option<f32> {
    let r = base.powf(exponent);
    if r.is_infinite() {
        None
    } else {
        Some(r)
    }
}

/// `base ** exponent` for f64; `None` when the result is infinite
pub fn pow_f64(base: f64, exponent: f64) -> Option<f64> {
    let r = base.powf(exponent);
    if r.is_infinite() {
        None
    } else {
        Some(r)
    }
}

/// `base ** exponent` for an f64 base and i32 exponent; `None` when the
/// result is infinite
pub fn pow_f64_i32(base: f64, exponent: i32) -> Option<f64> {
    let r = base.powi(exponent);
    if r.is_infinite() {
        None
    } else {
        Some(r)
    }
}

// ============================================================================
// Tests
// ============================================================================
