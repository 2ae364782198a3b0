//! Corpus BLEU accumulated over batches of predictions.
//!
//! Papineni et al., 2002, "BLEU: a Method for Automatic Evaluation of Machine Translation".
use std::collections::{HashMap, HashSet};

use candle::{DType, Result, Tensor};

#[derive(Debug, Clone)]
pub struct Bleu {
    ngram_weights: Vec<f64>,
    exclude_indices: HashSet<u32>,
    precision_matches: Vec<u64>,
    precision_totals: Vec<u64>,
    prediction_lengths: u64,
    reference_lengths: u64,
}

impl Bleu {
    /// `ngram_weights[n - 1]` weighs the n-gram precision, ids in `exclude_indices` are not
    /// counted, neither in n-grams nor in lengths.
    pub fn new(ngram_weights: Vec<f64>, exclude_indices: HashSet<u32>) -> Result<Self> {
        if ngram_weights.is_empty() {
            candle::bail!("bleu needs at least one n-gram weight")
        }
        let max_order = ngram_weights.len();
        Ok(Self {
            ngram_weights,
            exclude_indices,
            precision_matches: vec![0; max_order],
            precision_totals: vec![0; max_order],
            prediction_lengths: 0,
            reference_lengths: 0,
        })
    }

    pub fn reset(&mut self) {
        self.precision_matches.iter_mut().for_each(|v| *v = 0);
        self.precision_totals.iter_mut().for_each(|v| *v = 0);
        self.prediction_lengths = 0;
        self.reference_lengths = 0;
    }

    fn ngrams<'a>(&self, tokens: &'a [u32], n: usize) -> HashMap<&'a [u32], u64> {
        let mut counts = HashMap::new();
        if n == 0 || n > tokens.len() {
            return counts;
        }
        for ngram in tokens.windows(n) {
            if ngram.iter().any(|t| self.exclude_indices.contains(t)) {
                continue;
            }
            *counts.entry(ngram).or_insert(0) += 1;
        }
        counts
    }

    fn valid_length(&self, tokens: &[u32]) -> u64 {
        tokens
            .iter()
            .filter(|t| !self.exclude_indices.contains(t))
            .count() as u64
    }

    /// Accumulates the statistics of a single prediction against its reference.
    pub fn update_sequence(&mut self, prediction: &[u32], reference: &[u32]) {
        for n in 1..=self.ngram_weights.len() {
            let predicted = self.ngrams(prediction, n);
            let references = self.ngrams(reference, n);
            let mut matches = 0;
            let mut total = 0;
            for (ngram, count) in predicted.iter() {
                total += count;
                matches += (*count).min(references.get(ngram).copied().unwrap_or(0));
            }
            self.precision_matches[n - 1] += matches;
            self.precision_totals[n - 1] += total;
        }
        self.prediction_lengths += self.valid_length(prediction);
        self.reference_lengths += self.valid_length(reference);
    }

    /// Accumulates a batch, `predictions` and `references` are `(batch, len)` id tensors,
    /// their lengths may differ.
    pub fn update(&mut self, predictions: &Tensor, references: &Tensor) -> Result<()> {
        let predictions = predictions.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        let references = references.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        if predictions.len() != references.len() {
            candle::bail!(
                "{} predictions for {} references",
                predictions.len(),
                references.len()
            )
        }
        for (prediction, reference) in predictions.iter().zip(references.iter()) {
            self.update_sequence(prediction, reference)
        }
        Ok(())
    }

    fn brevity_penalty(&self) -> f64 {
        if self.prediction_lengths > self.reference_lengths {
            1.0
        } else if self.reference_lengths == 0 || self.prediction_lengths == 0 {
            0.0
        } else {
            (1.0 - self.reference_lengths as f64 / self.prediction_lengths as f64).exp()
        }
    }

    /// The BLEU score of everything accumulated so far, optionally resetting the counts.
    pub fn get_metric(&mut self, reset: bool) -> f64 {
        let brevity_penalty = self.brevity_penalty();
        let log_precisions: f64 = self
            .ngram_weights
            .iter()
            .enumerate()
            .map(|(n, weight)| {
                let matches = self.precision_matches[n] as f64 + 1e-13;
                let totals = self.precision_totals[n] as f64 + 1e-13;
                weight * (matches.ln() - totals.ln())
            })
            .sum();
        let bleu = brevity_penalty * log_precisions.exp();
        if reset {
            self.reset()
        }
        bleu
    }
}
