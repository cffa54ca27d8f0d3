pub mod audio_pipeline;
pub mod pcm_decode;
pub mod whisper;
