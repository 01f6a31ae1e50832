//! Media pipeline: chunk codec, speech synthesis, and PCM conversion.

pub mod codec;
pub mod convert;
pub mod tts;
