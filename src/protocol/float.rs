//! Portable packing of real numbers into IEEE754-style bit patterns.
//!
//! The scheduler reports the mean of a job's answers as a 64-bit pattern. The
//! conversion never reinterprets native float memory: the value is normalized
//! into `[1, 2)` by repeated halving or doubling, and the exponent and
//! significand fields are assembled by hand. Any `bits`/`expbits` layout that
//! fits in a `u64` can be produced, so the same code covers binary32-like and
//! binary64-like encodings.
//!
//! Values are rounded to the nearest representable significand. Magnitudes
//! beyond the exponent range saturate to the infinity pattern, and magnitudes
//! below the smallest normal flush to zero (subnormals are not produced).

/// Total width of the packed mean sent in status responses.
pub const MEAN_BITS: u32 = 64;

/// Exponent width of the packed mean sent in status responses.
pub const MEAN_EXPONENT_BITS: u32 = 11;

/// Pack the mean reported to submitters.
pub fn pack_mean(mean: f64) -> u64 {
    pack(mean, MEAN_BITS, MEAN_EXPONENT_BITS)
}

/// Inverse of [`pack_mean`].
pub fn unpack_mean(packed: u64) -> f64 {
    unpack(packed, MEAN_BITS, MEAN_EXPONENT_BITS)
}

/// Pack `value` into a `bits`-wide pattern with an `expbits`-wide exponent.
///
/// Layout, most significant bit first: sign, biased exponent, significand
/// (without the implicit leading one). Zero packs to `0`.
pub fn pack(value: f64, bits: u32, expbits: u32) -> u64 {
    debug_assert!(bits <= 64, "packed width exceeds 64 bits");
    debug_assert!(expbits >= 2 && expbits + 1 < bits, "invalid exponent width");

    let significand_bits = bits - expbits - 1;
    let bias = (1i64 << (expbits - 1)) - 1;
    let max_exponent = (1u64 << expbits) - 1;

    if value == 0.0 {
        return 0;
    }

    let sign_bit = if value < 0.0 { 1u64 << (bits - 1) } else { 0 };
    let infinity = sign_bit | (max_exponent << significand_bits);

    if value.is_nan() {
        return (max_exponent << significand_bits) | (1u64 << (significand_bits - 1));
    }

    let mut norm = if value < 0.0 { -value } else { value };
    if norm.is_infinite() {
        return infinity;
    }

    let mut shift: i64 = 0;
    while norm >= 2.0 {
        norm /= 2.0;
        shift += 1;
    }
    while norm < 1.0 {
        norm *= 2.0;
        shift -= 1;
    }

    let mut significand = ((norm - 1.0) * power_of_two(significand_bits) + 0.5).floor() as u64;
    if significand >= 1u64 << significand_bits {
        // rounded up to the next power of two
        significand = 0;
        shift += 1;
    }

    let exponent = shift + bias;
    if exponent >= max_exponent as i64 {
        return infinity;
    }
    if exponent <= 0 {
        return 0;
    }

    sign_bit | ((exponent as u64) << significand_bits) | significand
}

/// Unpack a pattern produced by [`pack`] with the same layout.
pub fn unpack(packed: u64, bits: u32, expbits: u32) -> f64 {
    debug_assert!(bits <= 64, "packed width exceeds 64 bits");
    debug_assert!(expbits >= 2 && expbits + 1 < bits, "invalid exponent width");

    let significand_bits = bits - expbits - 1;
    let bias = (1i64 << (expbits - 1)) - 1;
    let max_exponent = (1u64 << expbits) - 1;

    let negative = (packed >> (bits - 1)) & 1 == 1;
    let raw_significand = packed & ((1u64 << significand_bits) - 1);
    let raw_exponent = (packed >> significand_bits) & max_exponent;

    if raw_exponent == 0 && raw_significand == 0 {
        return if negative { -0.0 } else { 0.0 };
    }

    if raw_exponent == max_exponent {
        if raw_significand != 0 {
            return f64::NAN;
        }
        return if negative {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }

    let mut result = raw_significand as f64 / power_of_two(significand_bits) + 1.0;

    let mut shift = raw_exponent as i64 - bias;
    while shift > 0 {
        result *= 2.0;
        shift -= 1;
    }
    while shift < 0 {
        result /= 2.0;
        shift += 1;
    }

    if negative {
        -result
    } else {
        result
    }
}

fn power_of_two(exponent: u32) -> f64 {
    (0..exponent).fold(1.0, |acc, _| acc * 2.0)
}
