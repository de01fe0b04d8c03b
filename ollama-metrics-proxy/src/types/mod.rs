//! API types for the proxy.
//!
//! This module contains type definitions for both the Ollama-native and the
//! OpenAI-compatible APIs, enabling conversion between the two formats.

pub mod ollama;
pub mod openai;
