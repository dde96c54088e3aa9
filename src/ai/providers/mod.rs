//! Concrete backend adapters.

pub mod openai_compatible;

pub use openai_compatible::{OpenAiCompatibleBackend, OpenAiCompatibleConfig};
