//! CLI module for hyperion
//!
//! All logic lives here so it can be tested; the binary
//! (`src/bin/hyperion-cli.rs`) only parses arguments and calls [`run`].
//!
//! ```text
//! src/cli/
//! ├── mod.rs       # This file - module exports
//! ├── args.rs      # Argument parsing with clap
//! └── commands.rs  # Command implementations
//! ```

pub mod args;
pub mod commands;

pub use args::{Args, Command};
pub use commands::{run, CliError, CliResult, CommandResult};
