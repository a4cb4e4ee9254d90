pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

use sift_core::error::Result;
use sift_core::structured::parse_structured;
use sift_core::types::{GenerateRequest, Generation};

/// Turn provider text into a `Generation`, enforcing the schema when the
/// request carries one.
pub(crate) fn finish(request: &GenerateRequest, raw: String, tokens_used: u64) -> Result<Generation> {
    let parsed = match &request.schema {
        Some(schema) => Some(parse_structured(&raw, schema)?),
        None => None,
    };
    Ok(Generation {
        raw,
        parsed,
        tokens_used,
    })
}

/// Schema appended to the prompt so the model knows the expected shape.
pub(crate) fn schema_instruction(request: &GenerateRequest) -> String {
    match &request.schema {
        Some(schema) => format!(
            "{}\n\nRespond with ONLY valid JSON matching this schema:\n{}",
            request.prompt, schema
        ),
        None => request.prompt.clone(),
    }
}
