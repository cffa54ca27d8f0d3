#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use std::io::Cursor;

use anyhow::{bail, Error, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_transformers::models::whisper;
use candle_transformers::models::whisper::quantized_model::Whisper;
use candle_transformers::models::whisper::{
    audio, Config, COMPRESSION_RATIO_THRESHOLD, EOT_TOKEN, HOP_LENGTH, LOGPROB_THRESHOLD,
    NO_SPEECH_THRESHOLD, NO_SPEECH_TOKENS, NO_TIMESTAMPS_TOKEN, SAMPLE_RATE, SOT_TOKEN,
    TEMPERATURES, TRANSCRIBE_TOKEN, TRANSLATE_TOKEN,
};
use candle_transformers::quantized_var_builder::VarBuilder;
use hf_hub::api::sync::ApiRepo;
use rand::distributions::Distribution;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{debug, error};

use crate::inference::pcm_decode::pcm_decode;
use crate::inference::whisper::Task;

/// A time-bounded unit of recognized speech, in seconds relative to the start
/// of the source media.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TimedSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

// Decode loop taken from https://github.com/huggingface/candle/blob/main/candle-examples/examples/whisper/main.rs
#[derive(Clone)]
pub struct AudioGeneratorPipeline {
    model: Whisper,
    tokenizer: Tokenizer,
    config: Config,
    mel_filters: Vec<f32>,
    suppress_tokens: Tensor,
    sot_token: u32,
    transcribe_token: u32,
    translate_token: u32,
    eot_token: u32,
    no_speech_token: u32,
    no_timestamps_token: u32,
    language_tokens: Vec<u32>,
    seed: rand::rngs::StdRng,
}

impl AudioGeneratorPipeline {
    pub fn with_gguf_model(
        repo: &ApiRepo,
        config_filename: &str,
        tokenizer_filename: &str,
        gguf_filename: &str,
        mel_filters_filename: &str,
        seed: rand::rngs::StdRng,
    ) -> Result<Self> {
        let config_path = repo.get(config_filename)?;
        let tokenizer_path = repo.get(tokenizer_filename)?;
        let model_path = repo.get(gguf_filename)?;

        let config: Config = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(Error::msg)?;

        let vb = VarBuilder::from_gguf(model_path, &Device::Cpu)?;
        let model = Whisper::load(&vb, config.clone())?;

        let mel_bytes = &*std::fs::read(mel_filters_filename)?;
        let mut mel_filters = vec![0f32; mel_bytes.len() / 4];
        <byteorder::LittleEndian as byteorder::ByteOrder>::read_f32_into(
            mel_bytes,
            &mut mel_filters,
        );

        let no_timestamps_token = token_id(&tokenizer, NO_TIMESTAMPS_TOKEN)?;
        // Timestamps are always decoded here, so the no-timestamps token is
        // suppressed along with the model's own suppress list.
        let suppress_tokens: Vec<f32> = (0..model.config.vocab_size as u32)
            .map(|i| {
                if model.config.suppress_tokens.contains(&i) || i == no_timestamps_token {
                    f32::NEG_INFINITY
                } else {
                    0f32
                }
            })
            .collect();
        let suppress_tokens = Tensor::new(suppress_tokens.as_slice(), &Device::Cpu)?;
        let sot_token = token_id(&tokenizer, SOT_TOKEN)?;
        let transcribe_token = token_id(&tokenizer, TRANSCRIBE_TOKEN)?;
        let translate_token = token_id(&tokenizer, TRANSLATE_TOKEN)?;
        let eot_token = token_id(&tokenizer, EOT_TOKEN)?;
        let no_speech_token = NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| token_id(&tokenizer, token).ok());
        let no_speech_token = match no_speech_token {
            None => bail!("Unable to find any non-speech token"),
            Some(n) => n,
        };
        let language_tokens = language_tokens(&tokenizer);

        Ok(Self {
            model,
            tokenizer,
            config,
            mel_filters,
            suppress_tokens,
            sot_token,
            transcribe_token,
            translate_token,
            eot_token,
            no_speech_token,
            no_timestamps_token,
            language_tokens,
            seed,
        })
    }

    /// Transcribes (or translates) the given media bytes into chronological,
    /// non-overlapping transcript segments. Empty or all-silence input yields
    /// an empty segment list.
    pub fn transcribe(
        &mut self,
        input: Box<[u8]>,
        language: Option<&str>,
        task: Task,
    ) -> Result<Vec<TimedSegment>> {
        let mel = self.load_mel(input)?;
        let (_, _, content_frames) = mel.dims3()?;
        if content_frames == 0 {
            return Ok(vec![]);
        }

        let language_token = match language {
            Some(lang) => {
                // Region suffixes like "en-US" are recorded upstream but the
                // model only knows the bare code.
                let code = lang.split(['-', '_']).next().unwrap_or(lang).to_lowercase();
                match token_id(&self.tokenizer, &format!("<|{code}|>")) {
                    Ok(id) => id,
                    Err(_) => bail!("language {lang} is not supported"),
                }
            }
            None => self.detect_language(&mel)?,
        };
        let task_token = match task {
            Task::Transcribe => self.transcribe_token,
            Task::Translate => self.translate_token,
        };

        let mut seek = 0;
        let mut segments = vec![];
        while seek < content_frames {
            let time_offset = (seek * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let window_size = usize::min(content_frames - seek, whisper::N_FRAMES);
            let mel_window = mel.narrow(2, seek, window_size)?;
            let window_duration = (window_size * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let dr = self.decode_with_fallback(&mel_window, language_token, task_token)?;
            seek += window_size;
            if dr.no_speech_prob > NO_SPEECH_THRESHOLD && dr.avg_logprob < LOGPROB_THRESHOLD {
                debug!("no speech detected, skipping {seek} {dr:?}");
                continue;
            }
            segments.extend(self.timed_segments(&dr, time_offset, window_duration)?);
        }
        Ok(segments)
    }

    /// Single-pass language identification over the first audio window: one
    /// decoder step from the start-of-transcript token, restricted to the
    /// tokenizer's language tokens.
    fn detect_language(&mut self, mel: &Tensor) -> Result<u32> {
        if self.language_tokens.is_empty() {
            bail!("model has no language tokens, cannot auto-detect language");
        }
        let (_, _, content_frames) = mel.dims3()?;
        let window_size = usize::min(content_frames, whisper::N_FRAMES);
        let mel_window = mel.narrow(2, 0, window_size)?;
        let audio_features = self.model.encoder.forward(&mel_window, true)?;
        let tokens = Tensor::new(&[self.sot_token], mel.device())?.unsqueeze(0)?;
        let ys = self.model.decoder.forward(&tokens, &audio_features, true)?;
        let logits = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
        let logits: Vec<f32> = logits.to_vec1()?;

        let detected = self
            .language_tokens
            .iter()
            .copied()
            .max_by(|&a, &b| logits[a as usize].total_cmp(&logits[b as usize]));
        match detected {
            Some(token) => {
                debug!(
                    "detected language token {:?}",
                    self.tokenizer.id_to_token(token)
                );
                Ok(token)
            }
            None => bail!("language detection produced no candidate"),
        }
    }

    fn decode_with_fallback(
        &mut self,
        window: &Tensor,
        language_token: u32,
        task_token: u32,
    ) -> Result<DecodingResult> {
        for (i, &t) in TEMPERATURES.iter().enumerate() {
            let dr: Result<DecodingResult> = self.decode(window, t, language_token, task_token);
            if i == TEMPERATURES.len() - 1 {
                return dr;
            }
            // On errors, we try again with a different temperature.
            match dr {
                Ok(dr) => {
                    let needs_fallback = dr.compression_ratio > COMPRESSION_RATIO_THRESHOLD
                        || dr.avg_logprob < LOGPROB_THRESHOLD;
                    if !needs_fallback || dr.no_speech_prob > NO_SPEECH_THRESHOLD {
                        return Ok(dr);
                    }
                }
                Err(err) => {
                    error!("Error running at {t}: {err}");
                }
            }
        }
        unreachable!()
    }

    fn decode(
        &mut self,
        mel: &Tensor,
        t: f64,
        language_token: u32,
        task_token: u32,
    ) -> Result<DecodingResult> {
        let model = &mut self.model;
        let audio_features = model.encoder.forward(mel, true)?;
        debug!("audio features: {:?}", audio_features.dims());

        let sample_len = model.config.max_target_positions / 2;
        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;
        let mut tokens = vec![self.sot_token, language_token, task_token];
        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), mel.device())?;

            // The model expects a batch dim but this inference loop does not handle
            // it so we add it at this point.
            let tokens_t = tokens_t.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &audio_features, i == 0)?;

            // Extract the no speech probability on the first iteration by looking at the first
            // token logits and the probability for the according token.
            if i == 0 {
                let logits = model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                no_speech_prob = f64::from(
                    softmax(&logits, 0)?
                        .i(self.no_speech_token as usize)?
                        .to_scalar::<f32>()?,
                );
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits = logits.broadcast_add(&self.suppress_tokens)?;
            let next_token = if t > 0f64 {
                let prs = softmax(&(&logits / t)?, 0)?;
                let logits_v: Vec<f32> = prs.to_vec1()?;
                let distr = rand::distributions::WeightedIndex::new(&logits_v)?;
                u32::try_from(distr.sample(&mut self.seed))?
            } else {
                let logits_v: Vec<f32> = logits.to_vec1()?;
                logits_v
                    .iter()
                    .enumerate()
                    .max_by(|(_, u), (_, v)| u.total_cmp(v))
                    .map(|(i, _)| i as u32)
                    .unwrap()
            };
            tokens.push(next_token);
            let prob = f64::from(
                softmax(&logits, D::Minus1)?
                    .i(next_token as usize)?
                    .to_scalar::<f32>()?,
            );
            if next_token == self.eot_token || tokens.len() > model.config.max_target_positions {
                break;
            }
            sum_logprob += prob.ln();
        }
        let text = self.tokenizer.decode(&tokens, true).map_err(Error::msg)?;
        let avg_logprob = sum_logprob / tokens.len() as f64;

        Ok(DecodingResult {
            tokens,
            text,
            avg_logprob,
            no_speech_prob,
            temperature: t,
            compression_ratio: f64::NAN,
        })
    }

    /// Splits one decoded window into transcript segments on the timestamp
    /// tokens interleaved with the text tokens. A trailing chunk without a
    /// closing timestamp ends at the window boundary.
    fn timed_segments(
        &self,
        dr: &DecodingResult,
        window_offset: f64,
        window_duration: f64,
    ) -> Result<Vec<TimedSegment>> {
        let mut segments = vec![];
        let mut chunk = vec![];
        let mut prev_timestamp = 0f64;
        for &token in &dr.tokens {
            if token > self.no_timestamps_token {
                // The no_timestamp_token is the last before the timestamp ones.
                let timestamp = f64::from(token - self.no_timestamps_token + 1) / 50.;
                if !chunk.is_empty() {
                    self.push_segment(
                        &mut segments,
                        &chunk,
                        window_offset + prev_timestamp,
                        window_offset + timestamp.min(window_duration),
                    )?;
                    chunk.clear();
                }
                prev_timestamp = timestamp;
            } else if token < self.eot_token {
                chunk.push(token);
            }
        }
        if !chunk.is_empty() {
            self.push_segment(
                &mut segments,
                &chunk,
                window_offset + prev_timestamp.min(window_duration),
                window_offset + window_duration,
            )?;
        }
        Ok(segments)
    }

    fn push_segment(
        &self,
        segments: &mut Vec<TimedSegment>,
        tokens: &[u32],
        start: f64,
        end: f64,
    ) -> Result<()> {
        let text = self.tokenizer.decode(tokens, true).map_err(Error::msg)?;
        let text = text.trim();
        if !text.is_empty() && end > start {
            debug!("{start:.1}s -- {end:.1}s: {text}");
            segments.push(TimedSegment {
                start,
                end,
                text: text.to_string(),
            });
        }
        Ok(())
    }

    fn load_mel(&self, input: Box<[u8]>) -> Result<Tensor> {
        let cursor = Cursor::new(input);
        let (pcm_data, sample_rate) = pcm_decode(cursor)?;
        if sample_rate != u32::try_from(SAMPLE_RATE)? {
            bail!("Input file must have a {} sampling rate", SAMPLE_RATE)
        }
        debug!("pcm data loaded {}", pcm_data.len());
        let mel = audio::pcm_to_mel(&self.config, &pcm_data, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(
            mel,
            (
                1,
                self.config.num_mel_bins,
                mel_len / self.config.num_mel_bins,
            ),
            &Device::Cpu,
        )?;
        debug!("loaded mel: {:?}", mel.dims());
        Ok(mel)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
struct DecodingResult {
    tokens: Vec<u32>,
    text: String,
    avg_logprob: f64,
    no_speech_prob: f64,
    temperature: f64,
    compression_ratio: f64,
}

pub fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    match tokenizer.token_to_id(token) {
        None => bail!("no token-id for {token}"),
        Some(id) => Ok(id),
    }
}

/// Ids of the `<|xx|>` language markers in the tokenizer vocabulary. Empty for
/// English-only checkpoints.
fn language_tokens(tokenizer: &Tokenizer) -> Vec<u32> {
    let mut tokens: Vec<u32> = tokenizer
        .get_vocab(true)
        .iter()
        .filter(|(token, _)| is_language_token(token))
        .map(|(_, id)| *id)
        .collect();
    tokens.sort_unstable();
    tokens
}

fn is_language_token(token: &str) -> bool {
    token
        .strip_prefix("<|")
        .and_then(|rest| rest.strip_suffix("|>"))
        .is_some_and(|code| {
            (2..=3).contains(&code.len()) && code.chars().all(|c| c.is_ascii_lowercase())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_token_shape_is_two_or_three_lowercase_letters() {
        assert!(is_language_token("<|en|>"));
        assert!(is_language_token("<|yue|>"));
        assert!(!is_language_token("<|transcribe|>"));
        assert!(!is_language_token("<|endoftext|>"));
        assert!(!is_language_token("<|0.00|>"));
        assert!(!is_language_token("en"));
    }
}
