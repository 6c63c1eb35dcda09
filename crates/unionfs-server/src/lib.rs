//! unionfs server library
//!
//! Command-line parsing, configuration assembly and the client
//! operations behind the `unionfs` binary.

pub mod cli;
pub mod constants;
pub mod session;

pub use cli::{Cli, Command, LayerArg};
pub use session::Session;
