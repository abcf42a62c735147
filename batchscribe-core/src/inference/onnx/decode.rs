//! Greedy Whisper decoding over the baseline (no KV cache) decoder export.
//!
//! Stops at EOT or `MAX_TOKENS`, and breaks out of obvious repetition loops
//! that a stuck decoder would otherwise ride to the token limit.

use ort::session::Session;
use ort::value::TensorRef;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::error::{Result, ScribeError};
use crate::inference::LanguageHint;

const EOT_FALLBACK: i64 = 50257;
const SOT_FALLBACK: i64 = 50258;
const TRANSCRIBE_FALLBACK: i64 = 50359;
const NOTIMESTAMPS_FALLBACK: i64 = 50363;
pub const MAX_TOKENS: usize = 224;
const REPEAT_TOKEN_BREAK_THRESHOLD: usize = 14;

fn onnx_err(e: impl std::fmt::Display) -> ScribeError {
    ScribeError::OnnxSession(e.to_string())
}

/// Special-token ids resolved once per loaded tokenizer.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub sot: i64,
    pub eot: i64,
    pub transcribe: i64,
    pub no_timestamps: i64,
    pub timestamp_begin: Option<i64>,
    suppress_always: Vec<i64>,
}

impl TokenSet {
    pub fn from_tokenizer(tokenizer: &Tokenizer) -> Self {
        let id_or = |token: &str, fallback: i64| {
            tokenizer
                .token_to_id(token)
                .map(|id| id as i64)
                .unwrap_or(fallback)
        };
        let mut suppress_always: Vec<i64> = [
            "<|startoftranscript|>",
            "<|translate|>",
            "<|transcribe|>",
            "<|notimestamps|>",
            "<|nospeech|>",
        ]
        .iter()
        .filter_map(|t| tokenizer.token_to_id(t).map(|id| id as i64))
        .collect();
        suppress_always.sort_unstable();

        Self {
            sot: id_or("<|startoftranscript|>", SOT_FALLBACK),
            eot: id_or("<|endoftext|>", EOT_FALLBACK),
            transcribe: id_or("<|transcribe|>", TRANSCRIBE_FALLBACK),
            no_timestamps: id_or("<|notimestamps|>", NOTIMESTAMPS_FALLBACK),
            timestamp_begin: tokenizer.token_to_id("<|0.00|>").map(|id| id as i64),
            suppress_always,
        }
    }

    /// Decoder prompt for `language`. A language the tokenizer does not know
    /// falls back to auto-detection.
    pub fn prefix(&self, tokenizer: &Tokenizer, language: &LanguageHint) -> Vec<i64> {
        let lang = language
            .code()
            .and_then(|code| tokenizer.token_to_id(&format!("<|{code}|>")))
            .map(|id| id as i64);
        match lang {
            Some(lang) => vec![self.sot, lang, self.transcribe, self.no_timestamps],
            None => vec![self.sot, self.transcribe, self.no_timestamps],
        }
    }

    fn is_suppressed(&self, token: i64, step: usize) -> bool {
        if self.timestamp_begin.is_some_and(|tb| token >= tb) {
            return true;
        }
        if step == 0 && (token == self.eot || token == 220) {
            return true;
        }
        self.suppress_always.binary_search(&token).is_ok()
    }
}

/// Encoder output for one window, borrowed from the session outputs.
pub struct EncoderStates<'a> {
    pub data: &'a [f32],
    pub frames: usize,
    pub d_model: usize,
}

/// Run the decoder greedily and return the generated text tokens
/// (prefix and EOT stripped).
pub fn greedy_decode(
    decoder: &mut Session,
    specials: &TokenSet,
    encoder: &EncoderStates<'_>,
    prefix: &[i64],
    max_steps: usize,
) -> Result<Vec<i64>> {
    let mut tokens = prefix.to_vec();
    let mut repeated = 0usize;

    for step in 0..max_steps.clamp(1, MAX_TOKENS) {
        let seq = tokens.len();
        let input_ids = TensorRef::from_array_view(([1_i64, seq as i64], tokens.as_slice()))
            .map_err(onnx_err)?;
        let hidden = TensorRef::from_array_view((
            [1_i64, encoder.frames as i64, encoder.d_model as i64],
            encoder.data,
        ))
        .map_err(onnx_err)?;
        let out = decoder
            .run(ort::inputs![
                "input_ids"             => input_ids,
                "encoder_hidden_states" => hidden,
            ])
            .map_err(onnx_err)?;

        let (_, logits) = out["logits"].try_extract_tensor::<f32>().map_err(onnx_err)?;
        let vocab = logits.len() / seq;
        let last_row = &logits[(seq - 1) * vocab..seq * vocab];

        let next = last_row
            .iter()
            .enumerate()
            .filter(|(i, _)| !specials.is_suppressed(*i as i64, step))
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i as i64)
            .unwrap_or(specials.eot);

        if next == specials.eot {
            break;
        }
        repeated = if tokens.last() == Some(&next) { repeated + 1 } else { 0 };
        tokens.push(next);

        if repeated >= REPEAT_TOKEN_BREAK_THRESHOLD || has_repeating_tail(&tokens[prefix.len()..]) {
            debug!(step, token = next, "breaking decode on repetition loop");
            break;
        }
    }

    Ok(tokens.split_off(prefix.len()))
}

/// Step budget from window length: about 7 tokens per second plus prompt
/// overhead, clamped to the model limit.
pub fn step_budget(window_seconds: f32) -> usize {
    ((window_seconds * 6.8).ceil() as usize + 12).clamp(24, MAX_TOKENS)
}

/// `[a,b,a,b,a,b]`-style loops of up to 8 tokens at the tail.
fn has_repeating_tail(generated: &[i64]) -> bool {
    let len = generated.len();
    (1..=8).filter(|n| len >= n * 3).any(|n| {
        let a = &generated[len - n..];
        let b = &generated[len - 2 * n..len - n];
        let c = &generated[len - 3 * n..len - 2 * n];
        a == b && b == c
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_loops_are_detected() {
        assert!(has_repeating_tail(&[9, 1, 2, 1, 2, 1, 2]));
        assert!(has_repeating_tail(&[5, 5, 5]));
        assert!(!has_repeating_tail(&[1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn step_budget_is_clamped() {
        assert_eq!(step_budget(0.5), 24);
        assert!((216..=217).contains(&step_budget(30.0)));
        assert_eq!(step_budget(600.0), MAX_TOKENS);
    }
}
