//! Concrete tool implementations. The business logic of most tools (web
//! browsing, media synthesis, deployment) is out of scope for this kernel
//! (§1) — only filesystem and shell access are implemented here, directly
//! generalising `aigent-tools::builtins::{fs, shell}`. Everything else a
//! manifest declares is served by [`crate::ToolRegistry`]'s stub path.

mod fs;
mod shell;

pub use fs::{ReadFileTool, WriteFileTool};
pub use shell::RunShellTool;
