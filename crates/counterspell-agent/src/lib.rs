pub mod claude;
pub mod codex;
pub mod factory;
pub mod llm;
pub mod native;
pub mod normalize;
pub mod subprocess;
pub mod tools;
pub mod wire;

pub use claude::ClaudeCodeBackend;
pub use codex::CodexBackend;
pub use factory::DefaultBackendFactory;
pub use native::NativeBackend;
