pub mod model;
pub mod redactor;
pub mod refiner;
pub mod runtime;
pub mod sanitizer;

pub use model::{
    GuardedModelClient, HttpModelClient, ModelClient, ModelError, ModelRequest, ModelResponse,
};
pub use redactor::Redactor;
pub use refiner::{
    IntentRefiner, RefinerOutput, RefinerPath, RefinerResult, PROMPT_TEMPLATE_VERSION,
};
pub use runtime::{
    AgentReply, AgentRequest, AgentResponse, AgentRuntime, INTAKE_CAPABILITY,
};
pub use sanitizer::{PromptSanitizer, Verdict};
