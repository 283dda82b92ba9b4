//! LLM integration for ruleforge.
//!
//! The AI rule backend, the model classifier and the self-correction loop
//! all reach the text-generation service through the [`TextGenerator`]
//! gateway, which turns every failure into `None`:
//!
//! ```ignore
//! use ruleforge::llm::{LiteLlmClient, LlmTextGenerator, RetryConfig, TextGenerator};
//! use std::sync::Arc;
//!
//! let client = Arc::new(LiteLlmClient::from_env()?);
//! let gateway = LlmTextGenerator::new(client, "gpt-4o-mini").with_retry(RetryConfig::new(2));
//! if let Some(text) = gateway.generate("Propose rules for ...", None).await {
//!     println!("{}", text);
//! }
//! ```

pub mod gateway;
pub mod litellm;

pub use gateway::{retry_llm, LlmTextGenerator, RetryConfig, TextGenerator};
pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
    DEFAULT_MODEL,
};
