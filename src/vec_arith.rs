//! Lane-group arithmetic by a constant shared across all lanes.
//!
//! [`U32x8`] and [`U64x4`] each fill one 256-bit register. Division uses
//! the same magic-multiplier transform as [`crate::const_arith`], applied
//! lane-wise. On x86_64 builds with AVX2 enabled at compile time the
//! backend issues AVX2 intrinsics; elsewhere it falls back to plain lane
//! loops written so the optimizer can vectorize them.

use crate::const_arith::{Const32, Const64, Divisor32, Divisor64, Multiplier32, Multiplier64};

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))] {
        mod imp {
            use crate::const_arith::{Divisor32, Divisor64, Multiplier32, Multiplier64};
            use core::arch::x86_64::*;

            pub const BACKEND: &str = "avx2";

            #[inline(always)]
            fn load32(v: &[u32; 8]) -> __m256i {
                unsafe { _mm256_loadu_si256(v.as_ptr().cast()) }
            }

            #[inline(always)]
            fn store32(x: __m256i) -> [u32; 8] {
                let mut out = [0u32; 8];
                unsafe { _mm256_storeu_si256(out.as_mut_ptr().cast(), x) };
                out
            }

            #[inline(always)]
            fn load64(v: &[u64; 4]) -> __m256i {
                unsafe { _mm256_loadu_si256(v.as_ptr().cast()) }
            }

            #[inline(always)]
            fn store64(x: __m256i) -> [u64; 4] {
                let mut out = [0u64; 4];
                unsafe { _mm256_storeu_si256(out.as_mut_ptr().cast(), x) };
                out
            }

            /// High 32 bits of each 32x32 lane product.
            #[inline(always)]
            unsafe fn mulhi_epu32(a: __m256i, m: __m256i) -> __m256i {
                unsafe {
                    let even = _mm256_mul_epu32(a, m);
                    let odd = _mm256_mul_epu32(_mm256_srli_epi64::<32>(a), _mm256_srli_epi64::<32>(m));
                    let even_hi = _mm256_srli_epi64::<32>(even);
                    let odd_hi = _mm256_and_si256(odd, _mm256_set1_epi64x(0xFFFF_FFFF_0000_0000u64 as i64));
                    _mm256_or_si256(even_hi, odd_hi)
                }
            }

            /// High and low 64 bits of each 64x64 lane product, from four
            /// 32x32 partial products.
            #[inline(always)]
            unsafe fn mul_wide_epu64(a: __m256i, b: __m256i) -> (__m256i, __m256i) {
                unsafe {
                    let lo_mask = _mm256_set1_epi64x(0xFFFF_FFFF);
                    let a_hi = _mm256_srli_epi64::<32>(a);
                    let b_hi = _mm256_srli_epi64::<32>(b);
                    let ll = _mm256_mul_epu32(a, b);
                    let hl = _mm256_mul_epu32(a_hi, b);
                    let lh = _mm256_mul_epu32(a, b_hi);
                    let hh = _mm256_mul_epu32(a_hi, b_hi);
                    let cross = _mm256_add_epi64(
                        _mm256_add_epi64(_mm256_srli_epi64::<32>(ll), _mm256_and_si256(hl, lo_mask)),
                        _mm256_and_si256(lh, lo_mask),
                    );
                    let hi = _mm256_add_epi64(
                        _mm256_add_epi64(hh, _mm256_srli_epi64::<32>(hl)),
                        _mm256_add_epi64(_mm256_srli_epi64::<32>(lh), _mm256_srli_epi64::<32>(cross)),
                    );
                    let lo = _mm256_add_epi64(ll, _mm256_slli_epi64::<32>(_mm256_add_epi64(hl, lh)));
                    (hi, lo)
                }
            }

            #[inline(always)]
            pub fn div_u32x8(v: [u32; 8], d: &Divisor32) -> [u32; 8] {
                unsafe {
                    let n = load32(&v);
                    let count = _mm_cvtsi32_si128(d.shift() as i32);
                    if d.is_power_of_two() {
                        return store32(_mm256_srl_epi32(n, count));
                    }
                    let t = mulhi_epu32(n, _mm256_set1_epi32(d.magic() as i32));
                    let q = _mm256_add_epi32(t, _mm256_srli_epi32::<1>(_mm256_sub_epi32(n, t)));
                    store32(_mm256_srl_epi32(q, count))
                }
            }

            #[inline(always)]
            pub fn mul_u32x8(v: [u32; 8], m: &Multiplier32) -> [u32; 8] {
                unsafe {
                    let n = load32(&v);
                    match m.shift() {
                        Some(s) => store32(_mm256_sll_epi32(n, _mm_cvtsi32_si128(s as i32))),
                        None => store32(_mm256_mullo_epi32(n, _mm256_set1_epi32(m.factor() as i32))),
                    }
                }
            }

            #[inline(always)]
            pub fn add_u32x8(a: [u32; 8], b: [u32; 8]) -> [u32; 8] {
                unsafe { store32(_mm256_add_epi32(load32(&a), load32(&b))) }
            }

            #[inline(always)]
            pub fn sub_u32x8(a: [u32; 8], b: [u32; 8]) -> [u32; 8] {
                unsafe { store32(_mm256_sub_epi32(load32(&a), load32(&b))) }
            }

            #[inline(always)]
            pub fn div_u64x4(v: [u64; 4], d: &Divisor64) -> [u64; 4] {
                unsafe {
                    let n = load64(&v);
                    let count = _mm_cvtsi32_si128(d.shift() as i32);
                    if d.is_power_of_two() {
                        return store64(_mm256_srl_epi64(n, count));
                    }
                    let (t, _) = mul_wide_epu64(n, _mm256_set1_epi64x(d.magic() as i64));
                    let q = _mm256_add_epi64(t, _mm256_srli_epi64::<1>(_mm256_sub_epi64(n, t)));
                    store64(_mm256_srl_epi64(q, count))
                }
            }

            #[inline(always)]
            pub fn mul_u64x4(v: [u64; 4], m: &Multiplier64) -> [u64; 4] {
                unsafe {
                    let n = load64(&v);
                    match m.shift() {
                        Some(s) => store64(_mm256_sll_epi64(n, _mm_cvtsi32_si128(s as i32))),
                        None => {
                            let (_, lo) = mul_wide_epu64(n, _mm256_set1_epi64x(m.factor() as i64));
                            store64(lo)
                        }
                    }
                }
            }

            #[inline(always)]
            pub fn add_u64x4(a: [u64; 4], b: [u64; 4]) -> [u64; 4] {
                unsafe { store64(_mm256_add_epi64(load64(&a), load64(&b))) }
            }

            #[inline(always)]
            pub fn sub_u64x4(a: [u64; 4], b: [u64; 4]) -> [u64; 4] {
                unsafe { store64(_mm256_sub_epi64(load64(&a), load64(&b))) }
            }
        }
    } else {
        mod imp {
            use crate::const_arith::{Divisor32, Divisor64, Multiplier32, Multiplier64};

            pub const BACKEND: &str = "portable";

            #[inline(always)]
            pub fn div_u32x8(v: [u32; 8], d: &Divisor32) -> [u32; 8] {
                v.map(|n| d.div(n))
            }

            #[inline(always)]
            pub fn mul_u32x8(v: [u32; 8], m: &Multiplier32) -> [u32; 8] {
                v.map(|n| m.mul(n))
            }

            #[inline(always)]
            pub fn add_u32x8(a: [u32; 8], b: [u32; 8]) -> [u32; 8] {
                core::array::from_fn(|i| a[i].wrapping_add(b[i]))
            }

            #[inline(always)]
            pub fn sub_u32x8(a: [u32; 8], b: [u32; 8]) -> [u32; 8] {
                core::array::from_fn(|i| a[i].wrapping_sub(b[i]))
            }

            #[inline(always)]
            pub fn div_u64x4(v: [u64; 4], d: &Divisor64) -> [u64; 4] {
                v.map(|n| d.div(n))
            }

            #[inline(always)]
            pub fn mul_u64x4(v: [u64; 4], m: &Multiplier64) -> [u64; 4] {
                v.map(|n| m.mul(n))
            }

            #[inline(always)]
            pub fn add_u64x4(a: [u64; 4], b: [u64; 4]) -> [u64; 4] {
                core::array::from_fn(|i| a[i].wrapping_add(b[i]))
            }

            #[inline(always)]
            pub fn sub_u64x4(a: [u64; 4], b: [u64; 4]) -> [u64; 4] {
                core::array::from_fn(|i| a[i].wrapping_sub(b[i]))
            }
        }
    }
}

/// Name of the backend selected at compile time ("avx2" or "portable").
pub const BACKEND: &str = imp::BACKEND;

macro_rules! lane_group {
    (
        $(#[$meta:meta])*
        $name:ident, $elem:ty, $lanes:literal, $divisor:ty, $multiplier:ty, $konst:ident,
        $div:path, $mul:path, $add:path, $sub:path $(,)?
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        #[repr(C, align(32))]
        pub struct $name(pub [$elem; $lanes]);

        impl $name {
            pub const LANES: usize = $lanes;

            #[inline(always)]
            pub const fn splat(v: $elem) -> Self {
                Self([v; $lanes])
            }

            #[inline(always)]
            pub const fn to_array(self) -> [$elem; $lanes] {
                self.0
            }

            #[inline(always)]
            pub fn load(src: &[$elem; $lanes]) -> Self {
                Self(*src)
            }

            #[inline(always)]
            pub fn store(self, dst: &mut [$elem; $lanes]) {
                *dst = self.0;
            }

            /// Lane-wise truncating division.
            #[inline(always)]
            pub fn div(self, d: &$divisor) -> Self {
                Self($div(self.0, d))
            }

            /// Lane-wise wrapping multiplication.
            #[inline(always)]
            pub fn mul(self, m: &$multiplier) -> Self {
                Self($mul(self.0, m))
            }

            #[inline(always)]
            pub fn add_lanes(self, rhs: Self) -> Self {
                Self($add(self.0, rhs.0))
            }

            #[inline(always)]
            pub fn sub_lanes(self, rhs: Self) -> Self {
                Self($sub(self.0, rhs.0))
            }

            #[inline(always)]
            pub fn add_const(self, k: $elem) -> Self {
                self.add_lanes(Self::splat(k))
            }

            #[inline(always)]
            pub fn sub_const(self, k: $elem) -> Self {
                self.sub_lanes(Self::splat(k))
            }

            #[inline(always)]
            pub fn div_by<const K: $elem>(self) -> Self {
                self.div(&$konst::<K>::DIVISOR)
            }

            #[inline(always)]
            pub fn mul_by<const K: $elem>(self) -> Self {
                self.mul(&$konst::<K>::MULTIPLIER)
            }

            #[inline(always)]
            pub fn add_by<const K: $elem>(self) -> Self {
                self.add_const(K)
            }

            #[inline(always)]
            pub fn sub_by<const K: $elem>(self) -> Self {
                self.sub_const(K)
            }

            #[inline(always)]
            pub fn div_in_place(values: &mut [$elem; $lanes], d: &$divisor) {
                Self::load(values).div(d).store(values);
            }

            #[inline(always)]
            pub fn mul_in_place(values: &mut [$elem; $lanes], m: &$multiplier) {
                Self::load(values).mul(m).store(values);
            }

            #[inline(always)]
            pub fn add_in_place(values: &mut [$elem; $lanes], k: $elem) {
                Self::load(values).add_const(k).store(values);
            }

            #[inline(always)]
            pub fn sub_in_place(values: &mut [$elem; $lanes], k: $elem) {
                Self::load(values).sub_const(k).store(values);
            }

            /// Subtract `rhs` lane by lane from the values in memory.
            #[inline(always)]
            pub fn sub_in_place_lanes(values: &mut [$elem; $lanes], rhs: Self) {
                Self::load(values).sub_lanes(rhs).store(values);
            }

            /// Divide every element of `values`, a full register at a time.
            pub fn div_slice(values: &mut [$elem], d: &$divisor) {
                let mut chunks = values.chunks_exact_mut($lanes);
                for chunk in &mut chunks {
                    if let Ok(lanes) = <&mut [$elem; $lanes]>::try_from(chunk) {
                        Self::div_in_place(lanes, d);
                    }
                }
                for n in chunks.into_remainder() {
                    *n = d.div(*n);
                }
            }

            pub fn mul_slice(values: &mut [$elem], m: &$multiplier) {
                let mut chunks = values.chunks_exact_mut($lanes);
                for chunk in &mut chunks {
                    if let Ok(lanes) = <&mut [$elem; $lanes]>::try_from(chunk) {
                        Self::mul_in_place(lanes, m);
                    }
                }
                for n in chunks.into_remainder() {
                    *n = m.mul(*n);
                }
            }
        }

        impl From<[$elem; $lanes]> for $name {
            #[inline(always)]
            fn from(lanes: [$elem; $lanes]) -> Self {
                Self(lanes)
            }
        }
    };
}

lane_group!(
    /// Eight 32-bit lanes.
    U32x8, u32, 8, Divisor32, Multiplier32, Const32,
    imp::div_u32x8, imp::mul_u32x8, imp::add_u32x8, imp::sub_u32x8,
);

lane_group!(
    /// Four 64-bit lanes.
    U64x4, u64, 4, Divisor64, Multiplier64, Const64,
    imp::div_u64x4, imp::mul_u64x4, imp::add_u64x4, imp::sub_u64x4,
);

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    const DIVISORS_32: [u32; 9] = [1, 2, 3, 7, 10, 56, 641, 0x8000_0001, u32::MAX];
    const DIVISORS_64: [u64; 9] = [1, 3, 8, 24, 56, 1000, (1 << 32) + 1, 1 << 63, u64::MAX];

    #[test]
    fn test_div_u32x8_boundaries() {
        for &k in &DIVISORS_32 {
            let d = Divisor32::new(k);
            let lanes = [0, k - 1, k, k.wrapping_add(1), 12345, u32::MAX / 2, u32::MAX - 1, u32::MAX];
            let got = U32x8(lanes).div(&d).to_array();
            for i in 0..8 {
                assert_eq!(got[i], lanes[i] / k, "{} / {}", lanes[i], k);
            }
        }
    }

    #[test]
    fn test_div_u64x4_boundaries() {
        for &k in &DIVISORS_64 {
            let d = Divisor64::new(k);
            for lanes in [[0, k - 1, k, k.wrapping_add(1)], [77, u64::MAX / 3, u64::MAX - 1, u64::MAX]] {
                let got = U64x4(lanes).div(&d).to_array();
                for i in 0..4 {
                    assert_eq!(got[i], lanes[i] / k, "{} / {}", lanes[i], k);
                }
            }
        }
    }

    #[test]
    fn test_sampled_lanes_match_scalar() {
        let mut rng = StdRng::seed_from_u64(42);
        let d32 = Divisor32::new(56);
        let d64 = Divisor64::new(0x1_0000_0007);
        for _ in 0..1000 {
            let a: [u32; 8] = core::array::from_fn(|_| rng.next_u32());
            let b: [u64; 4] = core::array::from_fn(|_| rng.next_u64());
            assert_eq!(U32x8(a).div(&d32).to_array(), a.map(|n| n / 56));
            assert_eq!(U64x4(b).div(&d64).to_array(), b.map(|n| n / 0x1_0000_0007));
        }
    }

    #[test]
    fn test_mul_lane_boundaries() {
        for k in [0u32, 1, 3, 64, 56, 0x8000_0001, u32::MAX - 1, u32::MAX] {
            let m = Multiplier32::new(k);
            let lanes = [0, k.wrapping_sub(1), k, k.wrapping_add(1), 12345, u32::MAX / 2, u32::MAX - 1, u32::MAX];
            assert_eq!(U32x8(lanes).mul(&m).to_array(), lanes.map(|n| n.wrapping_mul(k)), "* {}", k);
        }
        for k in [0u64, 1, 3, 64, 56, (1 << 32) + 7, 0x1234_5678_9ABC, u64::MAX] {
            let m = Multiplier64::new(k);
            for lanes in [
                [0, k.wrapping_sub(1), k, k.wrapping_add(1)],
                [0xFFFF_FFFF, 1 << 32, u64::MAX - 1, u64::MAX],
            ] {
                assert_eq!(U64x4(lanes).mul(&m).to_array(), lanes.map(|n| n.wrapping_mul(k)), "* {}", k);
            }
        }
        let v32 = [0, 1, 7, 1 << 20, u32::MAX / 7, u32::MAX / 2, u32::MAX - 1, u32::MAX];
        assert_eq!(U32x8(v32).mul_by::<3>().to_array(), v32.map(|n| n.wrapping_mul(3)));
        assert_eq!(U32x8(v32).mul_by::<64>().to_array(), v32.map(|n| n.wrapping_mul(64)));
    }

    #[test]
    fn test_add_sub_const() {
        let v = U32x8([0, 1, 2, 3, u32::MAX, 5, 6, 7]);
        assert_eq!(v.add_const(1).to_array(), [1, 2, 3, 4, 0, 6, 7, 8]);
        assert_eq!(v.sub_by::<1>().to_array(), [u32::MAX, 0, 1, 2, u32::MAX - 1, 4, 5, 6]);
        let w = U64x4([10, 20, 30, 0]);
        assert_eq!(w.add_by::<5>().to_array(), [15, 25, 35, 5]);
        assert_eq!(w.sub_const(10).to_array(), [0, 10, 20, u64::MAX - 9]);
    }

    #[test]
    fn test_in_place_variants() {
        let mut mem = [100u64, 200, 300, 400];
        U64x4::div_in_place(&mut mem, &Divisor64::new(100));
        assert_eq!(mem, [1, 2, 3, 4]);
        U64x4::mul_in_place(&mut mem, &Multiplier64::new(10));
        assert_eq!(mem, [10, 20, 30, 40]);
        U64x4::add_in_place(&mut mem, 1);
        assert_eq!(mem, [11, 21, 31, 41]);
        U64x4::sub_in_place(&mut mem, 11);
        assert_eq!(mem, [0, 10, 20, 30]);
        U64x4::sub_in_place_lanes(&mut mem, U64x4([0, 5, 10, 15]));
        assert_eq!(mem, [0, 5, 10, 15]);

        let mut mem32 = [9u32; 8];
        U32x8::div_in_place(&mut mem32, &Divisor32::new(3));
        assert_eq!(mem32, [3; 8]);
    }

    #[test]
    fn test_div_slice_handles_tail() {
        let mut values: Vec<u64> = (0..11).map(|i| i * 7 + 3).collect();
        let expected: Vec<u64> = values.iter().map(|n| n / 7).collect();
        U64x4::div_slice(&mut values, &Divisor64::new(7));
        assert_eq!(values, expected);

        let mut values32: Vec<u32> = (0..19).collect();
        U32x8::mul_slice(&mut values32, &Multiplier32::new(5));
        assert_eq!(values32, (0..19).map(|n| n * 5).collect::<Vec<_>>());
    }

    #[test]
    fn test_backend_name() {
        assert!(BACKEND == "avx2" || BACKEND == "portable");
    }
}
