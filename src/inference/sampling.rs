//! Next-token sampling
//!
//! Logits are divided by `max(temperature, TEMPERATURE_EPSILON)` and turned
//! into probabilities with a max-subtracted softmax before the strategy runs.
//! A temperature at or near zero therefore collapses onto the argmax.
//!
//! The random source is a 32-bit linear congruential generator,
//! `state = state * 1664525 + 1013904223`, owned by each [`Sampler`]. It is
//! reproducible for a given seed and not suitable for anything secret.

use std::time::{SystemTime, UNIX_EPOCH};

use super::{GenerationParams, SamplingMethod};
use crate::error::{HyperionError, HyperionResult};
use crate::simd;

const LCG_MUL: u32 = 1_664_525;
const LCG_INC: u32 = 1_013_904_223;
const LCG_MASK: u32 = 0x7FFF_FFFF;

/// Smallest divisor applied to logits
pub const TEMPERATURE_EPSILON: f32 = 1e-6;

/// Seeded token sampler
#[derive(Debug, Clone)]
pub struct Sampler {
    state: u32,
}

impl Sampler {
    /// Create a sampler; seed 0 draws a seed from the system clock
    #[must_use]
    pub fn new(seed: u32) -> Self {
        let state = if seed == 0 {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(1, |d| d.as_secs() as u32)
        } else {
            seed
        };
        Self { state }
    }

    /// Current generator state
    #[must_use]
    pub const fn state(&self) -> u32 {
        self.state
    }

    /// Next value in `[0, 1]`
    pub fn next_f32(&mut self) -> f32 {
        self.state = self.state.wrapping_mul(LCG_MUL).wrapping_add(LCG_INC);
        (self.state & LCG_MASK) as f32 / LCG_MASK as f32
    }

    /// Pick the next token from raw logits
    ///
    /// # Errors
    ///
    /// Dimension error for empty logits.
    pub fn sample(&mut self, logits: &[f32], params: &GenerationParams) -> HyperionResult<u32> {
        if logits.is_empty() {
            return Err(HyperionError::Dimension("cannot sample from empty logits".into()));
        }
        let probs = probabilities(logits, params.temperature);

        let index = match params.sampling_method {
            SamplingMethod::Greedy => simd::argmax(&probs),
            SamplingMethod::TopK => self.top_k(&probs, params.top_k),
            SamplingMethod::TopP => self.top_p(&probs, params.top_p),
            SamplingMethod::Temperature => {
                let r = self.next_f32();
                cumulative_pick(probs.iter().copied().enumerate(), r).unwrap_or(probs.len() - 1)
            }
        };
        Ok(index as u32)
    }

    /// Draw from the `k` most likely entries of `probs`
    ///
    /// `k == 0` is greedy and `k >= probs.len()` draws from everything.
    pub fn top_k(&mut self, probs: &[f32], k: usize) -> usize {
        if k == 0 {
            return simd::argmax(probs);
        }
        if k >= probs.len() {
            return self.multinomial(probs);
        }
        let ranked = ranked_indices(probs);
        self.draw_from(probs, &ranked[..k])
    }

    /// Draw within the smallest prefix of sorted `probs` holding mass `p`
    ///
    /// At least one entry is kept. If the mass never reaches `p` the whole
    /// distribution is used. `p >= 1` draws from everything.
    pub fn top_p(&mut self, probs: &[f32], p: f32) -> usize {
        if p >= 1.0 {
            return self.multinomial(probs);
        }
        let ranked = ranked_indices(probs);
        let mut mass = 0.0;
        let cutoff = ranked
            .iter()
            .position(|&i| {
                mass += probs[i];
                mass >= p
            })
            .map_or(ranked.len(), |pos| pos + 1);
        self.draw_from(probs, &ranked[..cutoff])
    }

    /// Proportional draw over all of `probs`; rounding falls to the last index
    pub fn multinomial(&mut self, probs: &[f32]) -> usize {
        let total: f32 = probs.iter().sum();
        let r = self.next_f32() * total;
        cumulative_pick(probs.iter().copied().enumerate(), r).unwrap_or(probs.len().saturating_sub(1))
    }

    /// Proportional draw over `candidates`, falling back to the first
    fn draw_from(&mut self, probs: &[f32], candidates: &[usize]) -> usize {
        let first = candidates.first().copied().unwrap_or(0);
        let total: f32 = candidates.iter().map(|&i| probs[i]).sum();
        if total <= 0.0 {
            return first;
        }
        let r = self.next_f32() * total;
        cumulative_pick(candidates.iter().map(|&i| (i, probs[i])), r).unwrap_or(first)
    }
}

/// Temperature-scaled softmax
///
/// Scaled logits that overflow are clamped to the finite range so the
/// softmax never sees `inf - inf`.
#[must_use]
pub fn probabilities(logits: &[f32], temperature: f32) -> Vec<f32> {
    let t = if temperature.is_nan() {
        1.0
    } else {
        temperature.max(TEMPERATURE_EPSILON)
    };
    let mut probs: Vec<f32> = logits
        .iter()
        .map(|&x| (x / t).clamp(f32::MIN, f32::MAX))
        .collect();
    simd::softmax_in_place(&mut probs);
    probs
}

/// Indices ordered by descending probability, ties by ascending index
fn ranked_indices(probs: &[f32]) -> Vec<usize> {
    let mut ranked: Vec<usize> = (0..probs.len()).collect();
    ranked.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
    ranked
}

fn cumulative_pick(items: impl Iterator<Item = (usize, f32)>, r: f32) -> Option<usize> {
    let mut cum = 0.0;
    for (i, p) in items {
        cum += p;
        if r < cum {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEAKED: [f32; 5] = [0.1, 0.2, 5.0, 0.3, 4.0];

    fn params(method: SamplingMethod) -> GenerationParams {
        GenerationParams::default()
            .with_sampling_method(method)
            .with_temperature(1.0)
    }

    // =========================================================================
    // Generator Tests
    // =========================================================================

    #[test]
    fn test_lcg_sequence() {
        let mut s = Sampler::new(1);
        let first = s.next_f32();
        assert_eq!(s.state(), 1_664_525 + 1_013_904_223);
        let expected = ((1_664_525u32 + 1_013_904_223) & LCG_MASK) as f32 / LCG_MASK as f32;
        assert_eq!(first, expected);
    }

    #[test]
    fn test_same_seed_same_draws() {
        let mut a = Sampler::new(42);
        let mut b = Sampler::new(42);
        for _ in 0..16 {
            assert_eq!(a.next_f32(), b.next_f32());
        }
    }

    #[test]
    fn test_draws_in_unit_interval() {
        let mut s = Sampler::new(9);
        for _ in 0..1000 {
            let v = s.next_f32();
            assert!((0.0..=1.0).contains(&v));
        }
    }

    // =========================================================================
    // Strategy Tests
    // =========================================================================

    #[test]
    fn test_greedy_picks_peak() {
        let mut s = Sampler::new(3);
        assert_eq!(s.sample(&PEAKED, &params(SamplingMethod::Greedy)).ok(), Some(2));
    }

    #[test]
    fn test_top_k_zero_and_one_are_greedy() {
        let mut s = Sampler::new(3);
        for k in [0, 1] {
            let p = params(SamplingMethod::TopK).with_top_k(k);
            assert_eq!(s.sample(&PEAKED, &p).ok(), Some(2));
        }
        let p = params(SamplingMethod::TopK).with_top_k(0);
        assert_eq!(s.sample(&[5.0, 2.0, 1.0, -3.0], &p).ok(), Some(0));
    }

    #[test]
    fn test_top_k_stays_in_candidates() {
        let mut s = Sampler::new(11);
        let p = params(SamplingMethod::TopK).with_top_k(2);
        for _ in 0..200 {
            let t = s.sample(&PEAKED, &p).expect("sample");
            assert!(t == 2 || t == 4);
        }
    }

    #[test]
    fn test_top_p_cut() {
        let mut s = Sampler::new(5);
        let p = params(SamplingMethod::TopP).with_top_p(0.7);
        for _ in 0..50 {
            assert_eq!(s.sample(&[6.0, 1.0, -6.0], &p).ok(), Some(0));
        }
    }

    #[test]
    fn test_top_p_full_mass_reaches_every_index() {
        let logits = [0.0, 0.3, 0.1, 0.2, 0.4];
        let mut s = Sampler::new(5);
        let p = params(SamplingMethod::TopP).with_top_p(1.0);
        let mut seen = [0usize; 5];
        for _ in 0..500 {
            seen[s.sample(&logits, &p).expect("sample") as usize] += 1;
        }
        assert!(seen.iter().all(|&n| n > 0), "{seen:?}");
    }

    #[test]
    fn test_temperature_sampling_reaches_mass() {
        let mut s = Sampler::new(17);
        let p = params(SamplingMethod::Temperature);
        let mut seen = [0usize; 5];
        for _ in 0..500 {
            seen[s.sample(&PEAKED, &p).expect("sample") as usize] += 1;
        }
        assert!(seen[2] > seen[4]);
        assert!(seen[2] + seen[4] > 450);
    }

    #[test]
    fn test_zero_temperature_is_argmax() {
        for t in [0.0, -2.0] {
            let probs = probabilities(&PEAKED, t);
            assert_eq!(probs[2], 1.0);
            assert!(probs.iter().enumerate().all(|(i, &p)| i == 2 || p == 0.0));
        }

        let mut s = Sampler::new(7);
        let p = params(SamplingMethod::Temperature).with_temperature(0.0);
        for _ in 0..40 {
            assert_eq!(s.sample(&PEAKED, &p).ok(), Some(2));
        }
    }

    #[test]
    fn test_tiny_temperature_stays_finite() {
        let probs = probabilities(&PEAKED, 1e-39);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert_eq!(simd::argmax(&probs), 2);

        let mut s = Sampler::new(7);
        for method in [SamplingMethod::Greedy, SamplingMethod::Temperature, SamplingMethod::TopP] {
            let p = params(method).with_temperature(1e-39);
            assert_eq!(s.sample(&PEAKED, &p).ok(), Some(2));
        }
    }

    #[test]
    fn test_empty_logits() {
        let mut s = Sampler::new(1);
        assert!(matches!(
            s.sample(&[], &GenerationParams::default()),
            Err(HyperionError::Dimension(_))
        ));
    }

    #[test]
    fn test_ranked_ties_by_index() {
        assert_eq!(ranked_indices(&[0.2, 0.4, 0.4, 0.0]), vec![1, 2, 0, 3]);
    }
}
