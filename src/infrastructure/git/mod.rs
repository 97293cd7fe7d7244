//! Git CLI adapters.

pub mod cli;

pub use cli::GitCli;
