//! UI module for consistent CLI output
//!
//! Spinners and colored step lines on a terminal, plain `[OK]`/`[FAIL]`
//! lines in CI or when log output is enabled.
//!
//! # Example
//!
//! ```rust,ignore
//! use vectis::ui::{self, TaskSpinner, UiContext};
//!
//! let ctx = UiContext::detect();
//!
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("bootstrap debian/sid/amd64");
//! // ... run the stage ...
//! spinner.stop("bootstrap debian/sid/amd64");
//!
//! ui::step_warn_hint(&ctx, "No artifacts", "Nothing was written to $VECTIS_OUT");
//! ```

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{
    remark, section, step_error_detail, step_info, step_ok, step_ok_detail, step_warn_hint,
};
pub use progress::{counted, TaskSpinner};
