//! Conversational guide backend for a 33-week self-reflection journey.
//!
//! Each incoming message is answered by a persona whose rules, narrative
//! references and person context are assembled from the user's progress.
//! Episodes unlock sequentially and the persona never mentions content the
//! user has not reached.

pub mod config;
pub mod content;
pub mod database;
pub mod error;
pub mod generation;
pub mod history;
pub mod llm_client;
pub mod memory;
pub mod persona;
pub mod pipeline;
pub mod progress;
pub mod prompt;
pub mod runtime;
pub mod safety;
pub mod server;
pub mod spoiler;
pub mod stage;
pub mod telegram;

#[cfg(test)]
mod testing;
