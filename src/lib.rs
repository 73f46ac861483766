//! mail-triage — personal email triage agent core.
//!
//! Polls a mailbox with incremental delta sync, routes each new message
//! through a classification ladder (auto-rules → thread inheritance →
//! LLM tool call), persists suggestions for user review, and learns
//! classification preferences from the user's corrections.
//!
//! The mail transport and LLM provider are traits; hosts wire concrete
//! clients and drive [`triage::spawn_triage_loop`].

pub mod classifier;
pub mod config;
pub mod error;
pub mod llm;
pub mod mail;
pub mod store;
pub mod triage;
