//! Shared utility functions for ruleforge.
//!
//! JSON extraction from LLM responses and prompt template filling.

pub mod json_extraction;
pub mod template;

pub use json_extraction::{
    extract_from_code_block, extract_json_objects, find_matching_brace, strip_code_fences,
    JsonFragment,
};
pub use template::fill_template;
