//! # Chime Providers
//!
//! The lead-time estimator and the OpenAI-compatible client it talks through.
//! Groq, OpenAI, OpenRouter, Together, Mistral, Ollama and llama.cpp are all
//! reached via the same client; only endpoint and auth differ.

pub mod estimator;
pub mod openai_compatible;
pub mod provider_registry;

pub use estimator::{ChatEstimator, FixedEstimator, create_estimator, parse_minutes};
pub use openai_compatible::{CompletionParams, OpenAiCompatibleClient};
