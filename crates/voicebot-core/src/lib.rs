//! Core types, config, errors, and session model for the voicebot gateway.

pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
