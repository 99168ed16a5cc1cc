//! Device loader launcher
//!
//! Container entry point that brings the device loader up in a fixed order:
//!
//! 1. load the environment description file (`/environment.sh`)
//! 2. open the lifecycle scope
//! 3. install Avahi service advertisements
//! 4. run the application in the foreground
//! 5. close the lifecycle scope, if the application ever returns
//!
//! # Example Launch File
//!
//! ```yaml
//! version: "1.0"
//!
//! env_file: /environment.sh
//!
//! services:
//!   advertise:
//!     - name: "device-loader on ${VEHICLE_NAME}"
//!       type: _duckietown._tcp
//!       port: 8081
//!
//! app:
//!   executable: device-loader
//!   mode: supervise
//! ```

pub mod avahi;
pub mod cli;
pub mod config;
pub mod lifecycle;
pub mod runtime;

pub use cli::LaunchArgs;
pub use config::{
    Environment, EnvironmentError, ExecMode, LaunchFile, LaunchFileError, SubstitutionContext,
    SubstitutionError,
};
pub use lifecycle::{LifecycleScope, LifecycleState};
pub use runtime::{
    Bootstrap, BootstrapSteps, ExecError, ExitReport, LaunchPlan, ProcessConfig, SequenceError,
    SequenceState, Sequencer, StopHandle, SupervisedProcess,
};
