//! Election engine for ranked-choice group decisions: nominate candidates, collect
//! full ranked ballots, and tabulate a single instant-runoff winner with live updates.

pub mod config;
pub mod db;
pub mod directory;
pub mod election;
pub mod engine;
pub mod error;
pub mod models;
pub mod stream;
pub mod tasks;
pub mod voting;

pub use engine::Engine;
pub use error::EngineError;
