//! Deterministic pseudo-random numbers for simulation code.
//!
//! [`Pcg32`] is the PCG-XSH-RR 64/32 generator: a 64-bit linear congruential
//! state with an odd per-stream increment, and a 32-bit output produced by an
//! xorshift followed by a data-dependent rotation. The constants and the
//! output function are the canonical ones, so the stream is bit-identical to
//! every other conforming PCG32 implementation (including `rand_pcg::Pcg32`).
//!
//! Simulation code never shares a generator across entities. Per-entity,
//! per-tick randomness comes from [`Pcg32::for_entity`], which builds a fresh
//! generator from `(world seed, entity index, tick, salt)`. The values an
//! entity draws therefore do not depend on which worker processed it or in
//! which order chunks were visited.

use rand::{RngCore, SeedableRng};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// LCG multiplier shared by every PCG 64-bit-state variant.
pub const PCG_MULTIPLIER: u64 = 6_364_136_223_846_793_005;

/// Increment used by [`Pcg32::seed_default`]; equals `(0xda3e39cb94b95bdb << 1) | 1`.
pub const PCG_DEFAULT_INCREMENT: u64 = 1_442_695_040_888_963_407;

const TWO_POW_NEG_24: f32 = 1.0 / (1u32 << 24) as f32;
const TWO_POW_NEG_53: f64 = 1.0 / (1u64 << 53) as f64;

// ---------------------------------------------------------------------------
// Pcg32
// ---------------------------------------------------------------------------

/// A PCG-XSH-RR generator with 64 bits of state and 32-bit output.
///
/// `Clone` is cheap (two words). Cloning duplicates the stream; use
/// [`split`](Self::split) to derive an independent one.
#[derive(Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    increment: u64,
}

impl std::fmt::Debug for Pcg32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pcg32")
            .field("state", &format_args!("{:#018x}", self.state))
            .field("increment", &format_args!("{:#018x}", self.increment))
            .finish()
    }
}

impl Pcg32 {
    /// Seed a generator on the given stream.
    ///
    /// Matches the reference `pcg32_srandom_r(seed, stream)`: the increment
    /// is `(stream << 1) | 1`, so streams differing only in the top bit
    /// coincide.
    pub fn new(seed: u64, stream: u64) -> Self {
        Self::from_state_increment(seed, (stream << 1) | 1)
    }

    /// Seed a generator on the default stream.
    pub fn seed_default(seed: u64) -> Self {
        Self::from_state_increment(seed, PCG_DEFAULT_INCREMENT)
    }

    fn from_state_increment(seed: u64, increment: u64) -> Self {
        debug_assert!(increment & 1 == 1, "PCG increment must be odd");
        let mut rng = Self {
            state: seed.wrapping_add(increment),
            increment,
        };
        rng.step();
        rng
    }

    /// The generator for one entity on one tick.
    ///
    /// `salt` separates independent draws made for the same entity on the
    /// same tick (for example "jitter" and "spawn chance").
    pub fn for_entity(world_seed: u64, entity_index: u32, tick: u64, salt: u64) -> Self {
        let stream = splitmix64(tick ^ splitmix64(salt)) ^ u64::from(entity_index);
        Self::new(splitmix64(world_seed ^ stream), stream)
    }

    /// Derive an independent generator identified by `stream_id`.
    ///
    /// The parent is not advanced: splitting the same parent with the same
    /// id always yields the same child, and different ids yield generators on
    /// different streams.
    pub fn split(&self, stream_id: u64) -> Self {
        let seed = splitmix64(self.state ^ splitmix64(stream_id));
        let stream = splitmix64(self.increment.rotate_left(32) ^ stream_id);
        Self::new(seed, stream)
    }

    /// Current internal state (for diagnostics and tests).
    #[inline]
    pub fn state(&self) -> u64 {
        self.state
    }

    /// The odd stream increment.
    #[inline]
    pub fn increment(&self) -> u64 {
        self.increment
    }

    #[inline]
    fn step(&mut self) {
        self.state = self
            .state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.increment);
    }

    #[inline]
    fn output(state: u64) -> u32 {
        let rot = (state >> 59) as u32;
        let xsh = (((state >> 18) ^ state) >> 27) as u32;
        xsh.rotate_right(rot)
    }

    // -- raw output ---------------------------------------------------------

    /// Next 32 uniformly distributed bits.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.step();
        Self::output(old)
    }

    /// Next 64 bits, built from two consecutive 32-bit outputs (low word
    /// first).
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let lo = u64::from(self.next_u32());
        let hi = u64::from(self.next_u32());
        (hi << 32) | lo
    }

    // -- bounded integers ---------------------------------------------------

    /// Uniform integer in `[0, bound)`.
    ///
    /// Uses rejection sampling: outputs below `2^32 mod bound` are discarded
    /// so every residue is equally likely.
    ///
    /// # Panics
    ///
    /// Panics if `bound == 0`.
    pub fn next_bounded(&mut self, bound: u32) -> u32 {
        assert!(bound > 0, "next_bounded: bound must be non-zero");
        let threshold = bound.wrapping_neg() % bound;
        loop {
            let r = self.next_u32();
            if r >= threshold {
                return r % bound;
            }
        }
    }

    /// Uniform 64-bit integer in `[0, bound)`.
    ///
    /// # Panics
    ///
    /// Panics if `bound == 0`.
    pub fn next_bounded_u64(&mut self, bound: u64) -> u64 {
        assert!(bound > 0, "next_bounded_u64: bound must be non-zero");
        let threshold = bound.wrapping_neg() % bound;
        loop {
            let r = self.next_u64();
            if r >= threshold {
                return r % bound;
            }
        }
    }

    /// Uniform integer in the half-open range `[low, high)`.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty.
    pub fn range_i32(&mut self, low: i32, high: i32) -> i32 {
        assert!(low < high, "range_i32: empty range [{low}, {high})");
        // At most 2^32 - 1 for any non-empty i32 range.
        let span = (i64::from(high) - i64::from(low)) as u32;
        (i64::from(low) + i64::from(self.next_bounded(span))) as i32
    }

    // -- floating point -----------------------------------------------------

    /// Uniform `f32` in `[0, 1)` with 24 bits of precision.
    #[inline]
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * TWO_POW_NEG_24
    }

    /// Uniform `f64` in `[0, 1)` with 53 bits of precision.
    #[inline]
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * TWO_POW_NEG_53
    }

    /// Uniform `f32` in `[low, high)`.
    pub fn range_f32(&mut self, low: f32, high: f32) -> f32 {
        assert!(low < high, "range_f32: empty range [{low}, {high})");
        low + (high - low) * self.next_f32()
    }

    /// `true` with probability `p` (clamped to `[0, 1]`).
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    // -- jump-ahead ---------------------------------------------------------

    /// Skip `delta` outputs of [`next_u32`](Self::next_u32) in O(log delta).
    ///
    /// The LCG step `s' = a*s + c` is affine, so `delta` steps compose into a
    /// single `s' = A*s + C` computed by repeated squaring.
    pub fn advance(&mut self, delta: u64) {
        let mut acc_mult: u64 = 1;
        let mut acc_plus: u64 = 0;
        let mut cur_mult = PCG_MULTIPLIER;
        let mut cur_plus = self.increment;
        let mut remaining = delta;
        while remaining > 0 {
            if remaining & 1 == 1 {
                acc_mult = acc_mult.wrapping_mul(cur_mult);
                acc_plus = acc_plus.wrapping_mul(cur_mult).wrapping_add(cur_plus);
            }
            cur_plus = cur_mult.wrapping_add(1).wrapping_mul(cur_plus);
            cur_mult = cur_mult.wrapping_mul(cur_mult);
            remaining >>= 1;
        }
        self.state = acc_mult.wrapping_mul(self.state).wrapping_add(acc_plus);
    }
}

// ---------------------------------------------------------------------------
// rand integration
// ---------------------------------------------------------------------------

impl RngCore for Pcg32 {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        Pcg32::next_u32(self)
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        Pcg32::next_u64(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut chunks = dest.chunks_exact_mut(4);
        for chunk in &mut chunks {
            chunk.copy_from_slice(&Pcg32::next_u32(self).to_le_bytes());
        }
        let rest = chunks.into_remainder();
        if !rest.is_empty() {
            let bytes = Pcg32::next_u32(self).to_le_bytes();
            rest.copy_from_slice(&bytes[..rest.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for Pcg32 {
    /// Little-endian state in bytes 0..8, increment in bytes 8..16.
    type Seed = [u8; 16];

    fn from_seed(seed: Self::Seed) -> Self {
        let mut state = [0u8; 8];
        let mut increment = [0u8; 8];
        state.copy_from_slice(&seed[..8]);
        increment.copy_from_slice(&seed[8..]);
        Self::from_state_increment(u64::from_le_bytes(state), u64::from_le_bytes(increment) | 1)
    }

    fn seed_from_u64(seed: u64) -> Self {
        Self::seed_default(seed)
    }
}

// ---------------------------------------------------------------------------
// Mixing
// ---------------------------------------------------------------------------

/// SplitMix64 finalizer. A bijection on `u64` with full avalanche, used to
/// turn structured ids (ticks, indices, salts) into unrelated seeds.
#[inline]
pub fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_rand_pcg_stream() {
        let mut ours = Pcg32::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7);
        let mut theirs = rand_pcg::Pcg32::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7);
        for _ in 0..1000 {
            assert_eq!(ours.next_u32(), RngCore::next_u32(&mut theirs));
        }
        for _ in 0..100 {
            assert_eq!(ours.next_u64(), RngCore::next_u64(&mut theirs));
        }
    }

    #[test]
    fn matches_rand_pcg_seed_from_bytes() {
        let seed: [u8; 16] = core::array::from_fn(|i| (i as u8).wrapping_mul(37).wrapping_add(11));
        let mut ours = Pcg32::from_seed(seed);
        let mut theirs = rand_pcg::Pcg32::from_seed(seed);
        for _ in 0..64 {
            assert_eq!(ours.next_u32(), RngCore::next_u32(&mut theirs));
        }
    }

    #[test]
    fn reference_pcg32_demo_output() {
        // First outputs of the reference pcg32-demo (seed 42, stream 54).
        let mut rng = Pcg32::new(42, 54);
        let expected: [u32; 6] = [
            0xa15c02b7, 0x7b47f409, 0xba1d3330, 0x83d2f293, 0xbfa4784b, 0xcbed606e,
        ];
        for want in expected {
            assert_eq!(rng.next_u32(), want);
        }
    }

    #[test]
    fn advance_matches_sequential_u32() {
        for n in [0u64, 1, 1000, 1 << 20] {
            let mut jumped = Pcg32::new(0xB01D5EED, 7);
            let mut stepped = jumped.clone();
            jumped.advance(n);
            for _ in 0..n {
                stepped.next_u32();
            }
            assert_eq!(jumped, stepped, "advance({n}) diverged");
            assert_eq!(jumped.next_u32(), stepped.next_u32());
        }
    }

    #[test]
    fn advance_matches_sequential_u64() {
        // Each u64 consumes two u32 steps.
        for n in [0u64, 1, 1000, 1 << 20] {
            let mut jumped = Pcg32::seed_default(99);
            let mut stepped = jumped.clone();
            jumped.advance(2 * n);
            for _ in 0..n {
                stepped.next_u64();
            }
            assert_eq!(jumped, stepped, "advance(2*{n}) diverged");
        }
    }

    #[test]
    fn advance_matches_rand_pcg() {
        let mut ours = Pcg32::new(1, 2);
        let mut theirs = rand_pcg::Pcg32::new(1, 2);
        ours.advance(123_456_789);
        theirs.advance(123_456_789);
        assert_eq!(ours.next_u32(), RngCore::next_u32(&mut theirs));
    }

    #[test]
    fn bounded_in_range_for_many_bounds() {
        let mut rng = Pcg32::new(5, 5);
        for bound in [1u32, 2, 3, 7, 10, 100, 1 << 31, u32::MAX] {
            for _ in 0..2000 {
                assert!(rng.next_bounded(bound) < bound);
            }
        }
        for bound in [1u64, 3, 1 << 40, u64::MAX] {
            for _ in 0..2000 {
                assert!(rng.next_bounded_u64(bound) < bound);
            }
        }
    }

    #[test]
    fn bounded_is_uniform() {
        let mut rng = Pcg32::new(0xB01D5EED, 1);
        let bound = 7u32;
        let samples = 700_000u32;
        let mut counts = [0u32; 7];
        for _ in 0..samples {
            counts[rng.next_bounded(bound) as usize] += 1;
        }
        let expected = f64::from(samples / bound);
        for (value, &count) in counts.iter().enumerate() {
            let deviation = (f64::from(count) - expected).abs() / expected;
            assert!(
                deviation < 0.02,
                "value {value} drawn {count} times, expected ~{expected}"
            );
        }
    }

    #[test]
    #[should_panic(expected = "bound must be non-zero")]
    fn zero_bound_panics() {
        Pcg32::new(1, 1).next_bounded(0);
    }

    #[test]
    #[should_panic(expected = "empty range")]
    fn empty_range_panics() {
        Pcg32::new(1, 1).range_i32(3, 3);
    }

    #[test]
    fn range_i32_covers_negative_spans() {
        let mut rng = Pcg32::new(3, 3);
        for _ in 0..1000 {
            let v = rng.range_i32(-5, 5);
            assert!((-5..5).contains(&v));
        }
        let full = rng.range_i32(i32::MIN, i32::MAX);
        assert!(full < i32::MAX);
    }

    #[test]
    fn floats_in_unit_interval() {
        let mut rng = Pcg32::new(11, 0);
        for _ in 0..10_000 {
            let f = rng.next_f32();
            assert!((0.0..1.0).contains(&f));
            let d = rng.next_f64();
            assert!((0.0..1.0).contains(&d));
        }
    }

    #[test]
    fn split_does_not_advance_parent() {
        let parent = Pcg32::new(77, 3);
        let snapshot = parent.clone();
        let mut a = parent.split(1);
        let mut a_again = parent.split(1);
        let mut b = parent.split(2);
        assert_eq!(parent, snapshot);
        let xs: Vec<u32> = (0..8).map(|_| a.next_u32()).collect();
        let ys: Vec<u32> = (0..8).map(|_| a_again.next_u32()).collect();
        let zs: Vec<u32> = (0..8).map(|_| b.next_u32()).collect();
        assert_eq!(xs, ys);
        assert_ne!(xs, zs);
    }

    #[test]
    fn for_entity_is_order_independent() {
        let draws = |order: &[u32]| {
            let mut out: Vec<(u32, u32)> = order
                .iter()
                .map(|&index| (index, Pcg32::for_entity(9, index, 40, 0).next_u32()))
                .collect();
            out.sort();
            out
        };
        assert_eq!(draws(&[0, 1, 2, 3]), draws(&[3, 1, 0, 2]));
        let a = Pcg32::for_entity(9, 1, 40, 0).next_u32();
        let b = Pcg32::for_entity(9, 1, 41, 0).next_u32();
        let c = Pcg32::for_entity(9, 1, 40, 1).next_u32();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
