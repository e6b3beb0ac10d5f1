//! Command-line front end for the `elfload` engine.

pub mod cli;
pub mod error;
pub mod logger;
pub mod output;
pub mod run;
