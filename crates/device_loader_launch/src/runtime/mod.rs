//! Bootstrap runtime: the step sequence and the application process

pub mod bootstrap;
pub mod process;
pub mod sequencer;

pub use bootstrap::*;
pub use process::*;
pub use sequencer::*;
