//! Integer exponentiation with table-driven overflow detection.
//!
//! For each exponent below the type's bit width the tables hold the largest
//! magnitude base whose power still fits; the tables are const-evaluated so
//! the overflow decision is a single compare. Larger exponents only admit
//! the bases 0 and ±1. `0^0` overflows, and a negative exponent truncates
//! to 0 for every nonzero base; a zero base with a negative exponent is the
//! divide-by-zero domain case and also flags overflow.

use num_traits::PrimInt;

const fn max_base_for(exp: u32, limit: u64) -> u64 {
    // Largest b with b^exp <= limit, by bisection on the answer.
    let mut lo = 1u64;
    let mut hi = limit;
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        // Does mid^exp fit within limit?
        let mut acc: u64 = 1;
        let mut i = 0;
        let mut fits = true;
        while i < exp {
            if acc > limit / mid {
                fits = false;
                break;
            }
            acc *= mid;
            i += 1;
        }
        if fits {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo
}

const fn build_table<const N: usize>(limit: u64) -> [u64; N] {
    let mut table = [0u64; N];
    let mut e = 0;
    while e < N {
        // Exponents 0 and 1 never overflow for in-range bases.
        table[e] = if e < 2 { limit } else { max_base_for(e as u32, limit) };
        e += 1;
    }
    table
}

/// Largest magnitude base per exponent (0..31) whose power fits an `i32`.
static MAX_BASE_I32: [u64; 31] = build_table::<31>(i32::MAX as u64);
/// Largest base per exponent (0..32) whose power fits a `u32`.
static MAX_BASE_U32: [u64; 32] = build_table::<32>(u32::MAX as u64);
/// Largest magnitude base per exponent (0..63) whose power fits an `i64`.
static MAX_BASE_I64: [u64; 63] = build_table::<63>(i64::MAX as u64);
/// Largest base per exponent (0..64) whose power fits a `u64`.
static MAX_BASE_U64: [u64; 64] = build_table::<64>(u64::MAX);

fn pow_unsigned<T: PrimInt>(base: T, exp: u32) -> T {
    let mut acc = T::one();
    let mut i = 0;
    while i < exp {
        acc = acc * base;
        i += 1;
    }
    acc
}

/// `base ^ exponent` for `i32`, flagging overflow instead of wrapping.
#[must_use]
pub fn as_powi(base: i32, exponent: i32, overflow: &mut bool) -> i32 {
    if exponent < 0 {
        // The result is less than 1, so it truncates to 0; a zero base
        // cannot be raised to a negative power at all.
        *overflow = base == 0;
        return 0;
    }
    if exponent == 0 && base == 0 {
        // Domain error.
        *overflow = true;
        return 0;
    }
    *overflow = false;
    if exponent >= 31 {
        return match base {
            -1 => {
                if exponent & 1 == 0 {
                    1
                } else {
                    -1
                }
            }
            0 => 0,
            1 => 1,
            _ => {
                *overflow = true;
                0
            }
        };
    }
    if base.unsigned_abs() as u64 > MAX_BASE_I32[exponent as usize] {
        *overflow = true;
        return 0;
    }
    pow_unsigned(base, exponent as u32)
}

/// `base ^ exponent` for `u32`, flagging overflow instead of wrapping.
#[must_use]
pub fn as_powu(base: u32, exponent: u32, overflow: &mut bool) -> u32 {
    if exponent == 0 && base == 0 {
        // Domain error.
        *overflow = true;
        return 0;
    }
    *overflow = false;
    if exponent >= 32 {
        return match base {
            0 => 0,
            1 => 1,
            _ => {
                *overflow = true;
                0
            }
        };
    }
    if u64::from(base) > MAX_BASE_U32[exponent as usize] {
        *overflow = true;
        return 0;
    }
    pow_unsigned(base, exponent)
}

/// `base ^ exponent` for `i64`, flagging overflow instead of wrapping.
#[must_use]
pub fn as_powi64(base: i64, exponent: i64, overflow: &mut bool) -> i64 {
    if exponent < 0 {
        // Truncates to 0; a zero base is the divide-by-zero domain case.
        *overflow = base == 0;
        return 0;
    }
    if exponent == 0 && base == 0 {
        // Domain error.
        *overflow = true;
        return 0;
    }
    *overflow = false;
    if exponent >= 63 {
        return match base {
            -1 => {
                if exponent & 1 == 0 {
                    1
                } else {
                    -1
                }
            }
            0 => 0,
            1 => 1,
            _ => {
                *overflow = true;
                0
            }
        };
    }
    if base.unsigned_abs() > MAX_BASE_I64[exponent as usize] {
        *overflow = true;
        return 0;
    }
    pow_unsigned(base, exponent as u32)
}

/// `base ^ exponent` for `u64`, flagging overflow instead of wrapping.
#[must_use]
pub fn as_powu64(base: u64, exponent: u64, overflow: &mut bool) -> u64 {
    if exponent == 0 && base == 0 {
        // Domain error.
        *overflow = true;
        return 0;
    }
    *overflow = false;
    if exponent >= 64 {
        return match base {
            0 => 0,
            1 => 1,
            _ => {
                *overflow = true;
                0
            }
        };
    }
    if base > MAX_BASE_U64[exponent as usize] {
        *overflow = true;
        return 0;
    }
    pow_unsigned(base, exponent as u32)
}
