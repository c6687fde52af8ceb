//! # rwkv-sampling
//!
//! Sampling for the rwkv generation loop: nucleus (top-p) filtering with
//! temperature scaling and a decay-based repetition penalty.
//!
//! The penalty model follows the RWKV chat convention rather than plain
//! repetition division: every token sampled during a call accumulates an
//! occurrence count, all counts decay geometrically each step, and the
//! penalty subtracted from a token's raw logit is
//! `presence_penalty + count * count_penalty`. With `penalty_decay =
//! exp(-ln 2 / half_life)` a token's influence halves every `half_life`
//! steps.
//!
//! Order matters for parity with the compute pipeline: penalties are
//! applied to raw logits *before* softmax ([`NucleusSampler::transform`]),
//! and nucleus filtering operates on the resulting probabilities
//! ([`NucleusSampler::sample`]).

use std::collections::HashMap;

use rwkv_engine::TokenId;
use serde::Deserialize;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SamplingError {
    #[error("probability vector is empty")]
    EmptyDistribution,
    #[error("temperature must be > 0")]
    InvalidTemperature,
    #[error("penalty_decay must be in (0, 1]")]
    InvalidPenaltyDecay,
    #[error("no valid tokens after filtering")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Deterministic RNG for reproducible sampling.
///
/// xorshift64; fast, and a fixed seed reproduces an entire token stream.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Zero state would stick at zero forever.
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

fn default_temperature() -> f32 {
    2.0
}
fn default_top_p() -> f32 {
    0.3
}
fn default_presence_penalty() -> f32 {
    0.5
}
fn default_count_penalty() -> f32 {
    0.5
}
fn default_penalty_decay() -> f32 {
    penalty_decay_from_half_life(200.0)
}

/// Convert a half-life (in sampled tokens) into the per-step geometric
/// decay factor: `exp(-ln 2 / half_life)`.
pub fn penalty_decay_from_half_life(half_life: f32) -> f32 {
    (-std::f32::consts::LN_2 / half_life).exp()
}

/// Sampler hyperparameters.
///
/// Field defaults match the RWKV world-model presets (temperature 2.0 with a
/// tight nucleus reads much less wild than it looks).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SamplerConfig {
    /// Temperature for logit scaling. Must be > 0; values < 1 sharpen the
    /// distribution, > 1 flatten it.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus threshold: sample from the smallest set of tokens whose
    /// cumulative probability reaches this. 1.0 disables filtering; values
    /// near 0 degenerate to argmax.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Flat penalty subtracted from the logit of any token sampled before.
    #[serde(default = "default_presence_penalty")]
    pub presence_penalty: f32,

    /// Penalty per (decayed) occurrence count.
    #[serde(default = "default_count_penalty")]
    pub count_penalty: f32,

    /// Geometric decay applied to all occurrence counts each step, in
    /// (0, 1]. 1.0 means counts never decay.
    #[serde(default = "default_penalty_decay")]
    pub penalty_decay: f32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            temperature: default_temperature(),
            top_p: default_top_p(),
            presence_penalty: default_presence_penalty(),
            count_penalty: default_count_penalty(),
            penalty_decay: default_penalty_decay(),
        }
    }
}

impl SamplerConfig {
    /// Argmax-equivalent sampling with no repetition penalty. Handy for
    /// reproducible tests and replay.
    pub fn deterministic() -> Self {
        SamplerConfig {
            temperature: 1.0,
            top_p: 0.0,
            presence_penalty: 0.0,
            count_penalty: 0.0,
            penalty_decay: 1.0,
        }
    }

    pub fn validate(&self) -> SamplingResult<()> {
        if !(self.temperature > 0.0) {
            return Err(SamplingError::InvalidTemperature);
        }
        if !(self.penalty_decay > 0.0 && self.penalty_decay <= 1.0) {
            return Err(SamplingError::InvalidPenaltyDecay);
        }
        Ok(())
    }
}

/// Numerically stable softmax over raw logits.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();

    if sum > 0.0 {
        exps.iter().map(|&e| e / sum).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}

/// Nucleus sampler with decayed occurrence penalties.
///
/// Scoped to a single generation call: the occurrence map starts empty and
/// is not part of the persisted cache.
#[derive(Debug, Clone)]
pub struct NucleusSampler {
    config: SamplerConfig,

    /// Decayed occurrence count per sampled token.
    occurrences: HashMap<TokenId, f32>,

    /// RNG state. Mutated on each draw.
    rng: SeededRng,
}

impl NucleusSampler {
    /// Create a sampler for one generation call.
    pub fn new(config: SamplerConfig) -> SamplingResult<Self> {
        config.validate()?;
        Ok(NucleusSampler {
            config,
            occurrences: HashMap::new(),
            rng: SeededRng::new(42),
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SeededRng::new(seed);
        self
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Current decayed occurrence count for a token.
    pub fn occurrence(&self, token: TokenId) -> f32 {
        self.occurrences.get(&token).copied().unwrap_or(0.0)
    }

    /// Apply repetition penalties and temperature to raw logits, in place.
    ///
    /// Runs before softmax: `logits[t] -= presence + count[t] * count_pen`,
    /// then `logits[t] /= temperature`.
    pub fn transform(&self, logits: &mut [f32]) {
        for (&token, &count) in &self.occurrences {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit -= self.config.presence_penalty + count * self.config.count_penalty;
            }
        }

        if (self.config.temperature - 1.0).abs() > 1e-6 {
            for logit in logits.iter_mut() {
                *logit /= self.config.temperature;
            }
        }
    }

    /// Draw one token from a probability distribution (post-softmax).
    ///
    /// Applies nucleus filtering first: probabilities are sorted descending
    /// and accumulated until the cumulative mass reaches `top_p`; the tail
    /// is zeroed and the nucleus renormalized. With `top_p >= 1` the full
    /// distribution is eligible; with a threshold the single most likely
    /// token already satisfies, the draw is deterministic argmax.
    pub fn sample(&mut self, probs: &[f32]) -> SamplingResult<TokenId> {
        if probs.is_empty() {
            return Err(SamplingError::EmptyDistribution);
        }

        let filtered;
        let probs = if self.config.top_p < 1.0 {
            filtered = Self::apply_top_p(probs, self.config.top_p);
            &filtered[..]
        } else {
            probs
        };

        self.sample_from_distribution(probs)
    }

    /// Record a sampled token: decay every count, then increment the new
    /// token's count by 1. Counts converge to `1 / (1 - penalty_decay)`
    /// under constant repetition.
    pub fn update(&mut self, token: TokenId) {
        for count in self.occurrences.values_mut() {
            *count *= self.config.penalty_decay;
        }
        *self.occurrences.entry(token).or_insert(0.0) += 1.0;
    }

    fn apply_top_p(probs: &[f32], top_p: f32) -> Vec<f32> {
        let mut indexed: Vec<(usize, f32)> =
            probs.iter().enumerate().map(|(i, &p)| (i, p)).collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut cumsum = 0.0;
        let mut cutoff_idx = 0;
        for (idx, (_, prob)) in indexed.iter().enumerate() {
            cumsum += prob;
            cutoff_idx = idx;
            if cumsum >= top_p {
                break;
            }
        }

        let cutoff_prob = indexed[cutoff_idx].1;
        let mut result = vec![0.0; probs.len()];
        for (i, &p) in probs.iter().enumerate() {
            if p >= cutoff_prob {
                result[i] = p;
            }
        }

        let sum: f32 = result.iter().sum();
        if sum > 0.0 {
            for p in &mut result {
                *p /= sum;
            }
        }

        result
    }

    fn sample_from_distribution(&mut self, probs: &[f32]) -> SamplingResult<TokenId> {
        let r = self.rng.next_f32();
        let mut cumsum = 0.0;

        for (i, &prob) in probs.iter().enumerate() {
            cumsum += prob;
            if r < cumsum {
                return Ok(i as TokenId);
            }
        }

        // Float round-off can leave the cumulative sum a hair under r;
        // fall back to the last token with nonzero probability.
        for (i, &prob) in probs.iter().enumerate().rev() {
            if prob > 0.0 {
                return Ok(i as TokenId);
            }
        }

        Err(SamplingError::NoValidTokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(config: SamplerConfig) -> NucleusSampler {
        NucleusSampler::new(config).unwrap()
    }

    #[test]
    fn seeded_rng_reproducible() {
        let mut rng1 = SeededRng::new(42);
        let mut rng2 = SeededRng::new(42);

        for _ in 0..100 {
            let v1 = rng1.next_f32();
            let v2 = rng2.next_f32();
            assert!((v1 - v2).abs() < 1e-6);
            assert!((0.0..1.0).contains(&v1));
        }
    }

    #[test]
    fn deterministic_across_samplers_with_same_seed() {
        let probs = softmax(&[0.1, 0.2, 0.3, 0.4]);

        let mut s1 = sampler(SamplerConfig {
            top_p: 1.0,
            ..SamplerConfig::deterministic()
        })
        .with_seed(7);
        let mut s2 = sampler(SamplerConfig {
            top_p: 1.0,
            ..SamplerConfig::deterministic()
        })
        .with_seed(7);

        for _ in 0..20 {
            assert_eq!(s1.sample(&probs).unwrap(), s2.sample(&probs).unwrap());
        }
    }

    #[test]
    fn top_p_zero_is_argmax() {
        let probs = softmax(&[1.0, 5.0, 2.0, 3.0]);
        let mut s = sampler(SamplerConfig::deterministic()).with_seed(99);

        for _ in 0..50 {
            assert_eq!(s.sample(&probs).unwrap(), 1);
        }
    }

    #[test]
    fn top_p_one_keeps_full_distribution() {
        let probs = vec![0.25, 0.25, 0.25, 0.25];
        let mut s = sampler(SamplerConfig {
            top_p: 1.0,
            ..SamplerConfig::deterministic()
        });

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(s.sample(&probs).unwrap());
        }
        assert!(seen.len() > 1, "uniform distribution should vary");
    }

    #[test]
    fn nucleus_excludes_tail() {
        // 0.5 + 0.3 = 0.8 reaches top_p; the two smallest are zeroed.
        let probs = vec![0.5, 0.3, 0.15, 0.05];
        let filtered = NucleusSampler::apply_top_p(&probs, 0.8);

        assert!(filtered[0] > 0.0);
        assert!(filtered[1] > 0.0);
        assert_eq!(filtered[2], 0.0);
        assert_eq!(filtered[3], 0.0);
        assert!((filtered.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn transform_subtracts_penalty_from_raw_logits() {
        let config = SamplerConfig {
            temperature: 1.0,
            top_p: 1.0,
            presence_penalty: 0.4,
            count_penalty: 0.2,
            penalty_decay: 1.0,
        };
        let mut s = sampler(config);
        s.update(3);
        s.update(3);

        let mut logits = vec![1.0; 8];
        s.transform(&mut logits);

        // Token 3 sampled twice: 1.0 - (0.4 + 2 * 0.2).
        assert!((logits[3] - 0.2).abs() < 1e-6);
        assert!((logits[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn transform_applies_temperature_after_penalty() {
        let config = SamplerConfig {
            temperature: 2.0,
            top_p: 1.0,
            presence_penalty: 1.0,
            count_penalty: 0.0,
            penalty_decay: 1.0,
        };
        let mut s = sampler(config);
        s.update(0);

        let mut logits = vec![3.0, 3.0];
        s.transform(&mut logits);

        // (3.0 - 1.0) / 2.0 vs 3.0 / 2.0.
        assert!((logits[0] - 1.0).abs() < 1e-6);
        assert!((logits[1] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn penalty_decay_converges_to_geometric_limit() {
        let decay = 0.9;
        let config = SamplerConfig {
            temperature: 1.0,
            top_p: 1.0,
            presence_penalty: 0.0,
            count_penalty: 0.0,
            penalty_decay: decay,
        };
        let mut s = sampler(config);

        for _ in 0..500 {
            s.update(5);
        }

        let limit = 1.0 / (1.0 - decay);
        let count = s.occurrence(5);
        assert!(
            (count - limit).abs() < 1e-3,
            "count {count} should converge to {limit}"
        );
        assert!(count < limit + 1e-3, "count must never diverge past the limit");
    }

    #[test]
    fn half_life_halves_count() {
        let half_life = 50.0;
        let config = SamplerConfig {
            temperature: 1.0,
            top_p: 1.0,
            presence_penalty: 0.0,
            count_penalty: 0.0,
            penalty_decay: penalty_decay_from_half_life(half_life),
        };
        let mut s = sampler(config);

        s.update(1);
        assert!((s.occurrence(1) - 1.0).abs() < 1e-6);

        // 50 further updates of a different token decay token 1 by half.
        for _ in 0..half_life as usize {
            s.update(2);
        }
        assert!((s.occurrence(1) - 0.5).abs() < 1e-2);
    }

    #[test]
    fn update_decays_before_increment() {
        let config = SamplerConfig {
            temperature: 1.0,
            top_p: 1.0,
            presence_penalty: 0.0,
            count_penalty: 0.0,
            penalty_decay: 0.5,
        };
        let mut s = sampler(config);

        s.update(9);
        s.update(9);
        // 1.0 * 0.5 + 1.0, not (1.0 + 1.0) * 0.5.
        assert!((s.occurrence(9) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = SamplerConfig {
            temperature: 0.0,
            ..SamplerConfig::default()
        };
        assert_eq!(
            NucleusSampler::new(config).unwrap_err(),
            SamplingError::InvalidTemperature
        );
    }

    #[test]
    fn invalid_penalty_decay_rejected() {
        for decay in [0.0, -0.5, 1.5] {
            let config = SamplerConfig {
                penalty_decay: decay,
                ..SamplerConfig::default()
            };
            assert_eq!(
                NucleusSampler::new(config).unwrap_err(),
                SamplingError::InvalidPenaltyDecay
            );
        }
    }

    #[test]
    fn empty_distribution_rejected() {
        let mut s = sampler(SamplerConfig::default());
        assert_eq!(s.sample(&[]).unwrap_err(), SamplingError::EmptyDistribution);
    }

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn softmax_handles_large_logits() {
        let probs = softmax(&[1000.0, 999.0]);
        assert!(probs[0].is_finite() && probs[1].is_finite());
        assert!(probs[0] > probs[1]);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: SamplerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SamplerConfig::default());

        let config: SamplerConfig =
            serde_json::from_str(r#"{"temperature": 1.0, "top_p": 0.5}"#).unwrap();
        assert!((config.temperature - 1.0).abs() < 1e-6);
        assert!((config.top_p - 0.5).abs() < 1e-6);
        assert!((config.presence_penalty - 0.5).abs() < 1e-6);
    }

    #[test]
    fn half_life_conversion_in_range() {
        let decay = penalty_decay_from_half_life(200.0);
        assert!(decay > 0.99 && decay < 1.0);
    }
}
