//! Fixed bootstrap sequence: environment, init, services, exec, terminate

use crate::avahi::AvahiError;
use crate::config::{Environment, EnvironmentError, SubstitutionError};
use crate::runtime::process::{ExecError, ExitReport};

/// The steps of a bootstrap, in the order [`Sequencer::run`] calls them
pub trait BootstrapSteps {
    /// Load the environment description. Nothing else runs if this fails.
    fn load_environment(&mut self) -> Result<Environment, SequenceError>;

    /// Open the lifecycle scope
    fn init_lifecycle(&mut self, env: &Environment) -> Result<(), SequenceError>;

    /// Install service advertisements, returning how many were installed
    fn install_services(&mut self, env: &Environment) -> Result<usize, SequenceError>;

    /// Run the application in the foreground. Returning at all means the
    /// application is gone.
    fn exec_application(&mut self, env: &Environment) -> Result<ExitReport, SequenceError>;

    /// Close the lifecycle scope. `exit` is `None` when a step failed before
    /// the application reported a status.
    fn terminate_lifecycle(&mut self, exit: Option<&ExitReport>);
}

/// Sequencer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    /// Not started, or stopped before init
    Idle,
    /// Between init and terminate
    Running,
    Terminated,
}

/// Drives a [`BootstrapSteps`] implementation through the fixed order
pub struct Sequencer<S> {
    steps: S,
    state: SequenceState,
}

impl<S: BootstrapSteps> Sequencer<S> {
    pub fn new(steps: S) -> Self {
        Self {
            steps,
            state: SequenceState::Idle,
        }
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn steps(&self) -> &S {
        &self.steps
    }

    pub fn into_steps(self) -> S {
        self.steps
    }

    /// Run the sequence. Failures are passed through untouched; once init
    /// has succeeded, terminate runs exactly once on every path.
    pub fn run(&mut self) -> Result<ExitReport, SequenceError> {
        let env = self.steps.load_environment()?;

        self.steps.init_lifecycle(&env)?;
        self.state = SequenceState::Running;

        let result = self
            .steps
            .install_services(&env)
            .and_then(|_| self.steps.exec_application(&env));

        self.steps.terminate_lifecycle(result.as_ref().ok());
        self.state = SequenceState::Terminated;

        result
    }
}

/// Errors from any bootstrap step
#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error("Unknown argument: {0}")]
    UnknownArgument(String),

    #[error("Failed to resolve {context}: {source}")]
    Substitution {
        context: String,
        #[source]
        source: SubstitutionError,
    },

    #[error("Service installation failed: {0}")]
    Services(#[from] AvahiError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
}
