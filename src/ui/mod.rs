//! Console output helpers
//!
//! Styled status lines in a terminal, bracketed tags when output is piped
//! or running under CI.

mod context;
mod output;
mod prompts;

pub use context::UiContext;
pub use output::{
    key_value, remark, section, step_info, step_ok, step_ok_detail, step_warn, step_warn_hint,
};
pub use prompts::confirm;
