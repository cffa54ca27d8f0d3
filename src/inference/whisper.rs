use std::fmt::{self, Display};
use std::str::FromStr;

use anyhow::{bail, Error, Result};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use rand::SeedableRng;

use crate::config::Config;
use crate::inference::audio_pipeline::{AudioGeneratorPipeline, TimedSegment};

/// The fixed accuracy/latency trade-off enumeration of the wrapped Whisper
/// checkpoints. Parsing accepts the single-letter aliases the CLAMS parameter
/// declaration documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl FromStr for ModelSize {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "tiny" | "t" => Ok(Self::Tiny),
            "base" | "b" => Ok(Self::Base),
            "small" | "s" => Ok(Self::Small),
            "medium" | "m" => Ok(Self::Medium),
            "large" | "l" => Ok(Self::Large),
            _ => bail!("'{value}' is not a supported model size"),
        }
    }
}

impl Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tiny => write!(f, "tiny"),
            Self::Base => write!(f, "base"),
            Self::Small => write!(f, "small"),
            Self::Medium => write!(f, "medium"),
            Self::Large => write!(f, "large"),
        }
    }
}

impl ModelSize {
    pub fn config_filename(self) -> String {
        format!("config-{self}.json")
    }

    pub fn tokenizer_filename(self) -> String {
        format!("tokenizer-{self}.json")
    }

    pub fn gguf_filename(self) -> String {
        format!("model-{self}-q80.gguf")
    }
}

/// Whether decoding stays in the source language or translates to English,
/// delegated from the whisper CLI surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Task {
    #[default]
    Transcribe,
    Translate,
}

impl FromStr for Task {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "transcribe" => Ok(Self::Transcribe),
            "translate" => Ok(Self::Translate),
            _ => bail!("'{value}' is not a supported task"),
        }
    }
}

#[derive(Clone)]
pub struct WhisperModel {
    generator_pipeline: AudioGeneratorPipeline,
}

impl WhisperModel {
    #[tracing::instrument(level = "info", skip(api, config))]
    pub fn new(api: &Api, size: ModelSize, config: &Config) -> Result<Self> {
        let repo = api.repo(Repo::with_revision(
            config.model_repo.clone(),
            RepoType::Model,
            config.model_revision.clone(),
        ));
        let generator_pipeline = AudioGeneratorPipeline::with_gguf_model(
            &repo,
            &size.config_filename(),
            &size.tokenizer_filename(),
            &size.gguf_filename(),
            &config.mel_filters_path,
            rand::rngs::StdRng::from_seed([0; 32]),
        )?;

        Ok(Self { generator_pipeline })
    }

    /// Consumes a per-request clone of the model, keeping the shared copy
    /// untouched by the decoder's mutable state.
    #[tracing::instrument(level = "info", skip(self, input))]
    pub fn run_transcribe(
        mut self,
        input: Box<[u8]>,
        language: Option<&str>,
        task: Task,
    ) -> Result<Vec<TimedSegment>> {
        self.generator_pipeline.transcribe(input, language, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_size_parses_names_and_aliases() {
        assert_eq!("tiny".parse::<ModelSize>().unwrap(), ModelSize::Tiny);
        assert_eq!("t".parse::<ModelSize>().unwrap(), ModelSize::Tiny);
        assert_eq!("B".parse::<ModelSize>().unwrap(), ModelSize::Base);
        assert_eq!("small".parse::<ModelSize>().unwrap(), ModelSize::Small);
        assert_eq!("m".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("large".parse::<ModelSize>().unwrap(), ModelSize::Large);
    }

    #[test]
    fn unsupported_model_size_is_rejected() {
        assert!("huge".parse::<ModelSize>().is_err());
        assert!("turbo".parse::<ModelSize>().is_err());
        assert!("".parse::<ModelSize>().is_err());
    }

    #[test]
    fn model_size_maps_to_repo_filenames() {
        assert_eq!(ModelSize::Tiny.config_filename(), "config-tiny.json");
        assert_eq!(ModelSize::Base.tokenizer_filename(), "tokenizer-base.json");
        assert_eq!(ModelSize::Small.gguf_filename(), "model-small-q80.gguf");
    }

    #[test]
    fn task_parses_and_defaults_to_transcribe() {
        assert_eq!("transcribe".parse::<Task>().unwrap(), Task::Transcribe);
        assert_eq!("translate".parse::<Task>().unwrap(), Task::Translate);
        assert_eq!(Task::default(), Task::Transcribe);
        assert!("summarize".parse::<Task>().is_err());
    }
}
