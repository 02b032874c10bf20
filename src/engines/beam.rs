//! Deterministic decoding for sequence-to-sequence models.
//!
//! The model is hidden behind [`StepScorer`], so the search itself can be
//! tested without any weights.

use std::cmp::Ordering;

use crate::prelude::*;

/// Scores the next token for a batch of partial sequences.
pub trait StepScorer {
    /// Return one row of vocabulary logits per input sequence, for the token
    /// following its last one.
    fn next_logits(&mut self, sequences: &[Vec<i64>]) -> Result<Vec<Vec<f32>>>;
}

/// Decoding parameters. Fixed per backend, so output is repeatable.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    /// 1 means greedy.
    pub num_beams: usize,
    /// Maximum sequence length, counting the start token.
    pub max_length: usize,
    pub decoder_start_token_id: i64,
    pub eos_token_id: i64,
    /// Exponent applied to the generated length when ranking finished
    /// hypotheses.
    pub length_penalty: f32,
    /// Stop as soon as `num_beams` hypotheses have finished.
    pub early_stopping: bool,
}

/// Generate a sequence, starting with the decoder start token. The result
/// ends with EOS unless `max_length` was reached first.
pub fn generate(scorer: &mut dyn StepScorer, params: &SearchParams) -> Result<Vec<i64>> {
    if params.max_length < 2 {
        bail!("max_length must be at least 2, got {}", params.max_length);
    }
    if params.num_beams <= 1 {
        greedy(scorer, params)
    } else {
        beam_search(scorer, params)
    }
}

fn greedy(scorer: &mut dyn StepScorer, params: &SearchParams) -> Result<Vec<i64>> {
    let mut sequence = vec![params.decoder_start_token_id];
    while sequence.len() < params.max_length {
        let logits = single_row(scorer.next_logits(std::slice::from_ref(&sequence))?)?;
        let next = argmax(&logits)?;
        sequence.push(next);
        if next == params.eos_token_id {
            break;
        }
    }
    Ok(sequence)
}

/// A partial sequence and its summed log probability.
#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<i64>,
    score: f32,
}

/// A candidate extension of a live beam.
struct Candidate {
    beam: usize,
    token: i64,
    score: f32,
}

/// Finished sequences, best `capacity` kept.
struct Hypotheses {
    capacity: usize,
    length_penalty: f32,
    finished: Vec<(f32, Vec<i64>)>,
}

impl Hypotheses {
    fn normalized(&self, score: f32, len: usize) -> f32 {
        // Generated length, ignoring the start token.
        score / ((len.saturating_sub(1)).max(1) as f32).powf(self.length_penalty)
    }

    fn add(&mut self, tokens: Vec<i64>, score: f32) {
        let normalized = self.normalized(score, tokens.len());
        self.finished.push((normalized, tokens));
        self.finished
            .sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        self.finished.truncate(self.capacity);
    }

    fn is_full(&self) -> bool {
        self.finished.len() >= self.capacity
    }

    fn worst(&self) -> Option<f32> {
        self.finished.last().map(|(score, _)| *score)
    }

    /// Could a live beam with this raw score still beat our worst entry?
    fn is_done(&self, best_live: f32, cur_len: usize, early_stopping: bool) -> bool {
        if !self.is_full() {
            return false;
        }
        if early_stopping {
            return true;
        }
        match self.worst() {
            Some(worst) => self.normalized(best_live, cur_len) <= worst,
            None => false,
        }
    }

    fn best(self) -> Option<Vec<i64>> {
        self.finished.into_iter().next().map(|(_, tokens)| tokens)
    }
}

fn beam_search(scorer: &mut dyn StepScorer, params: &SearchParams) -> Result<Vec<i64>> {
    let num_beams = params.num_beams;
    let mut beams = vec![Beam {
        tokens: vec![params.decoder_start_token_id],
        score: 0.0,
    }];
    let mut hypotheses = Hypotheses {
        capacity: num_beams,
        length_penalty: params.length_penalty,
        finished: vec![],
    };

    let mut cur_len = 1;
    while cur_len < params.max_length && !beams.is_empty() {
        let sequences = beams.iter().map(|b| b.tokens.clone()).collect::<Vec<_>>();
        let rows = scorer.next_logits(&sequences)?;
        if rows.len() != beams.len() {
            bail!(
                "scorer returned {} rows for {} sequences",
                rows.len(),
                beams.len()
            );
        }

        let mut candidates = vec![];
        for (beam_idx, (beam, logits)) in beams.iter().zip(&rows).enumerate() {
            for (token, logprob) in log_softmax(logits).into_iter().enumerate() {
                candidates.push(Candidate {
                    beam: beam_idx,
                    token: token as i64,
                    score: beam.score + logprob,
                });
            }
        }
        candidates.sort_by(compare_candidates);
        candidates.truncate(2 * num_beams);

        cur_len += 1;
        let mut next_beams = Vec::with_capacity(num_beams);
        for (rank, candidate) in candidates.iter().enumerate() {
            let mut tokens = beams[candidate.beam].tokens.clone();
            tokens.push(candidate.token);
            if candidate.token == params.eos_token_id {
                // Only EOS among the top `num_beams` counts as finished.
                if rank < num_beams {
                    hypotheses.add(tokens, candidate.score);
                }
            } else {
                next_beams.push(Beam {
                    tokens,
                    score: candidate.score,
                });
            }
            if next_beams.len() == num_beams {
                break;
            }
        }
        beams = next_beams;

        let best_live = beams.iter().map(|b| b.score).fold(f32::NEG_INFINITY, f32::max);
        if hypotheses.is_done(best_live, cur_len, params.early_stopping) {
            beams.clear();
        }
    }

    // Ran out of length: whatever is still live competes as-is.
    for beam in beams {
        hypotheses.add(beam.tokens, beam.score);
    }
    hypotheses
        .best()
        .ok_or_else(|| anyhow!("beam search produced no hypotheses"))
}

/// Best score first. Ties go to the earlier beam, then the lower token id.
fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.beam.cmp(&b.beam))
        .then_with(|| a.token.cmp(&b.token))
}

fn single_row(mut rows: Vec<Vec<f32>>) -> Result<Vec<f32>> {
    if rows.len() != 1 {
        bail!("scorer returned {} rows for 1 sequence", rows.len());
    }
    Ok(rows.swap_remove(0))
}

/// Index of the largest logit, lowest index on ties.
fn argmax(logits: &[f32]) -> Result<i64> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in logits.iter().enumerate() {
        match best {
            Some((_, best_value)) if value <= best_value => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx as i64)
        .ok_or_else(|| anyhow!("scorer returned empty logits"))
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum = logits.iter().map(|&x| (x - max).exp()).sum::<f32>();
    let log_sum = sum.ln() + max;
    logits.iter().map(|&x| x - log_sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: i64 = 0;
    const EOS: i64 = 1;
    const A: i64 = 2;
    const B: i64 = 3;
    const C: i64 = 4;

    /// A bigram model: the next-token distribution depends only on the last
    /// token.
    struct Bigram {
        calls: usize,
    }

    impl Bigram {
        fn probs(last: i64) -> [f32; 5] {
            match last {
                START => [1e-6, 1e-6, 0.5, 0.4, 0.1],
                A => [1e-6, 0.3, 1e-6, 0.35, 0.35],
                _ => [0.025, 0.9, 0.025, 0.025, 0.025],
            }
        }
    }

    impl StepScorer for Bigram {
        fn next_logits(&mut self, sequences: &[Vec<i64>]) -> Result<Vec<Vec<f32>>> {
            self.calls += 1;
            Ok(sequences
                .iter()
                .map(|seq| {
                    let last = *seq.last().unwrap();
                    Self::probs(last).iter().map(|p| p.ln()).collect()
                })
                .collect())
        }
    }

    /// Never emits EOS.
    struct Chatterbox;

    impl StepScorer for Chatterbox {
        fn next_logits(&mut self, sequences: &[Vec<i64>]) -> Result<Vec<Vec<f32>>> {
            Ok(sequences.iter().map(|_| vec![0.0, -5.0, 3.0]).collect())
        }
    }

    fn params(num_beams: usize, max_length: usize) -> SearchParams {
        SearchParams {
            num_beams,
            max_length,
            decoder_start_token_id: START,
            eos_token_id: EOS,
            length_penalty: 1.0,
            early_stopping: true,
        }
    }

    #[test]
    fn greedy_follows_the_best_token() -> Result<()> {
        let mut scorer = Bigram { calls: 0 };
        let tokens = generate(&mut scorer, &params(1, 10))?;
        // After A, B and C tie; the lower id wins.
        assert_eq!(tokens, vec![START, A, B, EOS]);
        assert_eq!(scorer.calls, 3);
        Ok(())
    }

    #[test]
    fn beam_search_finds_a_better_sequence_than_greedy() -> Result<()> {
        let tokens = generate(&mut Bigram { calls: 0 }, &params(2, 10))?;
        assert_eq!(tokens, vec![START, B, EOS]);
        Ok(())
    }

    #[test]
    fn decoding_is_deterministic() -> Result<()> {
        for num_beams in [1, 2, 4] {
            let first = generate(&mut Bigram { calls: 0 }, &params(num_beams, 10))?;
            let second = generate(&mut Bigram { calls: 0 }, &params(num_beams, 10))?;
            assert_eq!(first, second, "num_beams = {num_beams}");
        }
        Ok(())
    }

    #[test]
    fn max_length_bounds_the_output() -> Result<()> {
        let greedy = generate(&mut Chatterbox, &params(1, 5))?;
        assert_eq!(greedy, vec![START, 2, 2, 2, 2]);
        let beams = generate(&mut Chatterbox, &params(3, 5))?;
        assert_eq!(beams.len(), 5);
        assert!(!beams.contains(&EOS));
        Ok(())
    }

    #[test]
    fn tiny_max_length_is_rejected() {
        assert!(generate(&mut Chatterbox, &params(1, 1)).is_err());
    }

    #[test]
    fn log_softmax_normalizes() {
        let logp = log_softmax(&[1.0, 2.0, 3.0]);
        let total = logp.iter().map(|x| x.exp()).sum::<f32>();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(logp[2] > logp[1] && logp[1] > logp[0]);
    }
}
