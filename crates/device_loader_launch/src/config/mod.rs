//! Launch file, environment file and substitution handling

mod environment;
mod launch_file;
mod substitution;

pub use environment::*;
pub use launch_file::*;
pub use substitution::*;
