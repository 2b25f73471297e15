pub mod engine;
pub mod prompt;

pub use engine::AnalysisEngine;
pub use prompt::{build_system_prompt, build_user_prompt};
