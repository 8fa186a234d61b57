//! Application wiring shared by the CLI

pub mod options;
pub mod run;
