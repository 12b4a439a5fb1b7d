//! Logit Processing and Sampling
//!
//! Turns the score vector of the last input position into one token id.
//! Scores are scaled by `1 / temperature`, then either the argmax is taken
//! (`top_k == 0`) or a token is drawn from the softmax over the `top_k`
//! highest-scoring entries.
//!
//! Ties between equal scores always resolve to the lowest index, both for the
//! argmax and for the cut-off of the top-k candidate set. NaN scores rank
//! below every other value.

use std::cmp::Ordering;

use nayan_core::error::{Error, Result};
use nayan_core::TokenId;
use rand::Rng;

use crate::config::GenerationConfig;

/// Sampling strategy for text generation
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Sampling {
    /// Always select the token with highest score
    ArgMax,
    /// Sample from the k highest-scoring tokens
    TopK { k: usize },
}

/// One top-k candidate with its renormalized probability
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Candidate {
    pub id: TokenId,
    pub probability: f64,
}

/// Selects next tokens according to a temperature and sampling strategy
#[derive(Clone, Debug)]
pub struct Sampler {
    temperature: f32,
    sampling: Sampling,
}

impl Sampler {
    /// Create a sampler; `top_k == 0` selects greedy decoding
    pub fn new(temperature: f32, top_k: usize) -> Result<Self> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "temperature must be a finite value > 0, got {}",
                temperature
            )));
        }
        let sampling = if top_k == 0 { Sampling::ArgMax } else { Sampling::TopK { k: top_k } };
        Ok(Self { temperature, sampling })
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        Self::new(config.temperature, config.top_k)
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Get the current sampling strategy
    pub fn sampling_strategy(&self) -> &Sampling {
        &self.sampling
    }

    /// Choose the next token from a score vector
    ///
    /// Never fails for a non-empty score vector. The random source is only
    /// drawn from in top-k mode, exactly once per call.
    pub fn choose<R: Rng + ?Sized>(&self, scores: &[f32], rng: &mut R) -> Result<TokenId> {
        if scores.is_empty() {
            return Err(Error::ForwardPassFailure("score vector is empty".to_string()));
        }

        let scaled = self.scale(scores);
        let token = match self.sampling {
            Sampling::ArgMax => argmax(&scaled),
            Sampling::TopK { k } => {
                let candidates = top_k_softmax(&scaled, k);
                sample_candidates(&candidates, rng.random::<f64>())
            }
        };

        Ok(token)
    }

    /// Top-k candidates in descending score order with their probabilities.
    ///
    /// In greedy mode this is the single argmax with probability 1.
    pub fn candidates(&self, scores: &[f32]) -> Vec<Candidate> {
        if scores.is_empty() {
            return Vec::new();
        }
        let scaled = self.scale(scores);
        match self.sampling {
            Sampling::ArgMax => vec![Candidate { id: argmax(&scaled), probability: 1.0 }],
            Sampling::TopK { k } => top_k_softmax(&scaled, k),
        }
    }

    fn scale(&self, scores: &[f32]) -> Vec<f32> {
        scores.iter().map(|&x| x / self.temperature).collect()
    }
}

/// Choose a token with a one-off sampler built from `temperature` and `top_k`
pub fn choose<R: Rng + ?Sized>(
    scores: &[f32],
    temperature: f32,
    top_k: usize,
    rng: &mut R,
) -> Result<TokenId> {
    Sampler::new(temperature, top_k)?.choose(scores, rng)
}

#[inline]
fn rank_value(x: f32) -> f32 {
    if x.is_nan() {
        f32::NEG_INFINITY
    } else {
        x
    }
}

/// Descending score, then ascending index
fn by_rank(scores: &[f32]) -> impl Fn(&usize, &usize) -> Ordering + '_ {
    move |&i, &j| {
        rank_value(scores[j])
            .partial_cmp(&rank_value(scores[i]))
            .unwrap_or(Ordering::Equal)
            .then(i.cmp(&j))
    }
}

/// Greedy decoding; first occurrence wins on ties
fn argmax(scores: &[f32]) -> TokenId {
    let mut best = 0;
    for (i, &x) in scores.iter().enumerate().skip(1) {
        if rank_value(x) > rank_value(scores[best]) {
            best = i;
        }
    }
    best as TokenId
}

/// Indices of the `k` highest scores in descending rank order
fn top_k_indices(scores: &[f32], k: usize) -> Vec<usize> {
    let cmp = by_rank(scores);
    let mut indices: Vec<usize> = (0..scores.len()).collect();

    let k = k.min(scores.len());
    if k < indices.len() {
        indices.select_nth_unstable_by(k - 1, &cmp);
        indices.truncate(k);
    }
    indices.sort_unstable_by(&cmp);
    indices
}

/// Numerically stable softmax over the top-k scores
fn top_k_softmax(scores: &[f32], k: usize) -> Vec<Candidate> {
    let indices = top_k_indices(scores, k);
    let max_score = rank_value(scores[indices[0]]) as f64;

    let exps: Vec<f64> =
        indices.iter().map(|&i| (rank_value(scores[i]) as f64 - max_score).exp()).collect();
    let exp_sum: f64 = exps.iter().sum();

    indices
        .iter()
        .zip(exps)
        .map(|(&i, e)| Candidate { id: i as TokenId, probability: e / exp_sum })
        .collect()
}

/// Walk candidates accumulating mass until it exceeds `u`.
///
/// Rounding can leave the total just under `u`; the top candidate is the
/// fallback then.
fn sample_candidates(candidates: &[Candidate], u: f64) -> TokenId {
    let mut cumulative = 0.0;
    for candidate in candidates {
        cumulative += candidate.probability;
        if u < cumulative {
            return candidate.id;
        }
    }
    candidates[0].id
}
