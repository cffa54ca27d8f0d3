use anyhow::Result;
use clap_serde_derive::ClapSerde;
use serde::Deserialize;

#[derive(ClapSerde, Deserialize, Debug)]
pub struct Config {
    /// The address the listener binds to
    #[arg(short, long, env, default_value = "0.0.0.0")]
    pub(crate) address: String,

    /// The port the listener binds to
    #[arg(short, long, env, default_value = "5000")]
    pub(crate) port: u16,

    /// Model size loaded at startup, also used when a request gives no modelSize
    #[arg(short, long, env, default_value = "tiny")]
    pub(crate) model_size: String,

    /// The id of the hub repository holding the quantized whisper weights
    #[arg(long, env, default_value = "lmz/candle-whisper")]
    pub(crate) model_repo: String,

    /// The revision of the weights repository
    #[arg(long, env, default_value = "main")]
    pub(crate) model_revision: String,

    /// Path to the precomputed mel filter bank
    #[arg(long, env, default_value = "melfilters.bytes")]
    pub(crate) mel_filters_path: String,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let config = toml::from_str(&str)?;
        Ok(config)
    }
}
