//! Program loading shared by the `risa` binary and the compliance runner.

pub mod loader;
