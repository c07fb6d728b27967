//! Application-level orchestration.
//!
//! Owns the session lifecycle (rig setup, the state machine thread, operator
//! command relay, Ctrl-C) and post-run processing such as exports. UI/CLI
//! layers call into this module to keep responsibilities separated.

mod calibration;
mod controller;
mod post_process;
mod session;

pub(crate) use controller::run_controller;
pub(crate) use post_process::process_run_completion;
pub(crate) use session::SessionContext;
