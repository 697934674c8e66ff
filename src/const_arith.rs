//! Division and multiplication by constants without runtime `div`.
//!
//! A divisor is turned into a magic multiplier and a shift by a `const fn`,
//! so a `const` [`Divisor64`] costs one high multiply, a subtract, an add and
//! two shifts per quotient (a single shift for powers of two). The transform
//! is the round-up variant from Granlund & Montgomery and is exact for every
//! dividend of the lane width.
//!
//! ```
//! use coreslab::const_arith::{div_u64, round_up_u32, Divisor64};
//!
//! const BY_SEVEN: Divisor64 = Divisor64::new(7);
//! assert_eq!(BY_SEVEN.div(50), 7);
//! assert_eq!(div_u64::<56>(560), 10);
//! assert_eq!(round_up_u32::<64>(65), 128);
//! ```
//!
//! A zero divisor is rejected while the constant is evaluated:
//!
//! ```compile_fail
//! let _ = coreslab::const_arith::div_u64::<0>(10);
//! ```

/// Precomputed reciprocal for unsigned 32-bit division by a fixed divisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Divisor32 {
    divisor: u32,
    /// 0 marks a power of two; the quotient is then a plain shift.
    magic: u32,
    shift: u32,
}

impl Divisor32 {
    /// Build the transform for `divisor`. Panics (at compile time when used
    /// in a const) if `divisor` is zero.
    pub const fn new(divisor: u32) -> Self {
        assert!(divisor != 0, "constant divisor must be non-zero");
        if divisor.is_power_of_two() {
            return Self {
                divisor,
                magic: 0,
                shift: divisor.trailing_zeros(),
            };
        }
        // l = ceil(log2(d)), always >= 2 here
        let l = 32 - (divisor - 1).leading_zeros();
        let d = divisor as u64;
        let magic = ((1u64 << 32) * ((1u64 << l) - d) / d + 1) as u32;
        Self {
            divisor,
            magic,
            shift: l - 1,
        }
    }

    #[inline(always)]
    pub const fn divisor(&self) -> u32 {
        self.divisor
    }

    #[inline(always)]
    pub const fn magic(&self) -> u32 {
        self.magic
    }

    #[inline(always)]
    pub const fn shift(&self) -> u32 {
        self.shift
    }

    #[inline(always)]
    pub const fn is_power_of_two(&self) -> bool {
        self.magic == 0
    }

    /// `n / divisor`, truncating.
    #[inline(always)]
    pub const fn div(&self, n: u32) -> u32 {
        if self.magic == 0 {
            return n >> self.shift;
        }
        let t = ((self.magic as u64 * n as u64) >> 32) as u32;
        (t + ((n - t) >> 1)) >> self.shift
    }

    /// `n % divisor`.
    #[inline(always)]
    pub const fn rem(&self, n: u32) -> u32 {
        if self.magic == 0 {
            return n & (self.divisor - 1);
        }
        n - self.div(n).wrapping_mul(self.divisor)
    }

    /// `(n / divisor, n % divisor)` with a single reciprocal multiply.
    #[inline(always)]
    pub const fn div_rem(&self, n: u32) -> (u32, u32) {
        let q = self.div(n);
        (q, n - q.wrapping_mul(self.divisor))
    }
}

/// Precomputed reciprocal for unsigned 64-bit division by a fixed divisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Divisor64 {
    divisor: u64,
    magic: u64,
    shift: u32,
}

impl Divisor64 {
    /// Identity divisor, handy as a filler in const tables.
    pub const ONE: Self = Self::new(1);

    /// Build the transform for `divisor`. Panics (at compile time when used
    /// in a const) if `divisor` is zero.
    pub const fn new(divisor: u64) -> Self {
        assert!(divisor != 0, "constant divisor must be non-zero");
        if divisor.is_power_of_two() {
            return Self {
                divisor,
                magic: 0,
                shift: divisor.trailing_zeros(),
            };
        }
        let l = 64 - (divisor - 1).leading_zeros();
        let d = divisor as u128;
        let magic = ((1u128 << 64) * ((1u128 << l) - d) / d + 1) as u64;
        Self {
            divisor,
            magic,
            shift: l - 1,
        }
    }

    #[inline(always)]
    pub const fn divisor(&self) -> u64 {
        self.divisor
    }

    #[inline(always)]
    pub const fn magic(&self) -> u64 {
        self.magic
    }

    #[inline(always)]
    pub const fn shift(&self) -> u32 {
        self.shift
    }

    #[inline(always)]
    pub const fn is_power_of_two(&self) -> bool {
        self.magic == 0
    }

    #[inline(always)]
    pub const fn div(&self, n: u64) -> u64 {
        if self.magic == 0 {
            return n >> self.shift;
        }
        let t = ((self.magic as u128 * n as u128) >> 64) as u64;
        (t + ((n - t) >> 1)) >> self.shift
    }

    #[inline(always)]
    pub const fn rem(&self, n: u64) -> u64 {
        if self.magic == 0 {
            return n & (self.divisor - 1);
        }
        n - self.div(n).wrapping_mul(self.divisor)
    }

    #[inline(always)]
    pub const fn div_rem(&self, n: u64) -> (u64, u64) {
        let q = self.div(n);
        (q, n - q.wrapping_mul(self.divisor))
    }

    /// Division of a `usize`, for address and index math.
    #[inline(always)]
    pub const fn div_usize(&self, n: usize) -> usize {
        self.div(n as u64) as usize
    }

    #[inline(always)]
    pub const fn div_rem_usize(&self, n: usize) -> (usize, usize) {
        let (q, r) = self.div_rem(n as u64);
        (q as usize, r as usize)
    }
}

/// Multiplication by a fixed factor. Powers of two become shifts; any
/// other factor is a wrapping multiply by an immediate, which the backend
/// is free to strength-reduce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Multiplier32 {
    factor: u32,
    /// `u32::MAX` when `factor` is not a power of two.
    shift: u32,
}

impl Multiplier32 {
    pub const fn new(factor: u32) -> Self {
        let shift = if factor.is_power_of_two() {
            factor.trailing_zeros()
        } else {
            u32::MAX
        };
        Self { factor, shift }
    }

    #[inline(always)]
    pub const fn factor(&self) -> u32 {
        self.factor
    }

    #[inline(always)]
    pub const fn shift(&self) -> Option<u32> {
        if self.shift == u32::MAX { None } else { Some(self.shift) }
    }

    #[inline(always)]
    pub const fn mul(&self, n: u32) -> u32 {
        if self.shift != u32::MAX {
            return n << self.shift;
        }
        n.wrapping_mul(self.factor)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Multiplier64 {
    factor: u64,
    shift: u32,
}

impl Multiplier64 {
    pub const fn new(factor: u64) -> Self {
        let shift = if factor.is_power_of_two() {
            factor.trailing_zeros()
        } else {
            u32::MAX
        };
        Self { factor, shift }
    }

    #[inline(always)]
    pub const fn factor(&self) -> u64 {
        self.factor
    }

    #[inline(always)]
    pub const fn shift(&self) -> Option<u32> {
        if self.shift == u32::MAX { None } else { Some(self.shift) }
    }

    #[inline(always)]
    pub const fn mul(&self, n: u64) -> u64 {
        if self.shift != u32::MAX {
            return n << self.shift;
        }
        n.wrapping_mul(self.factor)
    }

    #[inline(always)]
    pub const fn mul_usize(&self, n: usize) -> usize {
        self.mul(n as u64) as usize
    }
}

/// Transforms for a constant carried in the type.
pub struct Const32<const K: u32>;

impl<const K: u32> Const32<K> {
    pub const DIVISOR: Divisor32 = Divisor32::new(K);
    pub const MULTIPLIER: Multiplier32 = Multiplier32::new(K);
}

/// Transforms for a constant carried in the type.
pub struct Const64<const K: u64>;

impl<const K: u64> Const64<K> {
    pub const DIVISOR: Divisor64 = Divisor64::new(K);
    pub const MULTIPLIER: Multiplier64 = Multiplier64::new(K);
}

#[inline(always)]
pub const fn div_u32<const K: u32>(n: u32) -> u32 {
    Const32::<K>::DIVISOR.div(n)
}

#[inline(always)]
pub const fn rem_u32<const K: u32>(n: u32) -> u32 {
    Const32::<K>::DIVISOR.rem(n)
}

#[inline(always)]
pub const fn mul_u32<const K: u32>(n: u32) -> u32 {
    Const32::<K>::MULTIPLIER.mul(n)
}

#[inline(always)]
pub const fn add_u32<const K: u32>(n: u32) -> u32 {
    n.wrapping_add(K)
}

#[inline(always)]
pub const fn sub_u32<const K: u32>(n: u32) -> u32 {
    n.wrapping_sub(K)
}

/// Round `n` up to the next multiple of `K` (wrapping on overflow).
#[inline(always)]
pub const fn round_up_u32<const K: u32>(n: u32) -> u32 {
    mul_u32::<K>(div_u32::<K>(n.wrapping_add(K - 1)))
}

#[inline(always)]
pub const fn div_u64<const K: u64>(n: u64) -> u64 {
    Const64::<K>::DIVISOR.div(n)
}

#[inline(always)]
pub const fn rem_u64<const K: u64>(n: u64) -> u64 {
    Const64::<K>::DIVISOR.rem(n)
}

#[inline(always)]
pub const fn mul_u64<const K: u64>(n: u64) -> u64 {
    Const64::<K>::MULTIPLIER.mul(n)
}

#[inline(always)]
pub const fn add_u64<const K: u64>(n: u64) -> u64 {
    n.wrapping_add(K)
}

#[inline(always)]
pub const fn sub_u64<const K: u64>(n: u64) -> u64 {
    n.wrapping_sub(K)
}

#[inline(always)]
pub const fn round_up_u64<const K: u64>(n: u64) -> u64 {
    mul_u64::<K>(div_u64::<K>(n.wrapping_add(K - 1)))
}
