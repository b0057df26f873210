//! Utility modules.

pub mod debug;
pub mod path;
pub mod platform;
pub mod process;
pub mod shell;

pub use debug::{init_debug_logging, is_debug_enabled, SBX_DEBUG_ENV};
pub use path::{expand_home, is_within, normalize_path};
pub use platform::{check_tool, is_privileged, is_linux};
pub use process::{run_tool, run_tool_checked, ToolOutput};
pub use shell::{join_args, quote, split_args};
