//! Supervised desktop automation.
//!
//! A perceive -> decide -> act control loop drives a target application while
//! two monitors watch the seams: a safety supervisor that halts automation
//! the moment the operator touches mouse or keyboard, and a dialog watchdog
//! that classifies popup dialogs and answers them. An event router turns
//! monitor events into state transitions and an auditable JSONL session log,
//! and a recovery coordinator resumes automation once operator activity
//! settles.
//!
//! The binary ships with inert backends for dry runs; embedders implement
//! the traits in [`ports`] to drive a real desktop.

pub mod cli;
pub mod clock;
pub mod config;
pub mod controller;
pub mod dialog;
pub mod errors;
pub mod log;
pub mod ports;
pub mod recovery;
pub mod router;
pub mod safety;
pub mod state;
