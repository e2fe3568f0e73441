//! Sheetgate CLI
//!
//! `sheetgate import | validate | preview | export | probe`. Command parsing
//! lives in [`cli`], the runners in [`commands`].

pub mod cli;
pub mod commands;
pub mod logging;

pub use cli::{Cli, Commands};
pub use commands::{execute, parse_records, Outcome};
