//! Substitution engine for `$(arg NAME)`, `$(env NAME)` and `$(timestamp [FMT])`

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::LazyLock;

/// Matches `$(kind value)` and the bare `$(kind)` form
static SUBSTITUTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\((\w+)(?:\s+([^)]+))?\)").unwrap());

/// Nested substitutions deeper than this are treated as a cycle
const MAX_PASSES: usize = 8;

/// Values visible to launch file substitutions
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// Launch file arguments, defaults already merged with overrides
    pub args: HashMap<String, String>,
    /// Variables loaded from the environment file
    pub env: HashMap<String, String>,
}

impl SubstitutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn with_args(mut self, args: HashMap<String, String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Substitute every pattern in `input`, re-running until the result is stable
    pub fn substitute(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut current = input.to_string();

        for _ in 0..MAX_PASSES {
            if !SUBSTITUTION_PATTERN.is_match(&current) {
                return Ok(current);
            }
            current = self.substitute_pass(&current)?;
        }

        if SUBSTITUTION_PATTERN.is_match(&current) {
            return Err(SubstitutionError::TooDeep(input.to_string()));
        }
        Ok(current)
    }

    fn substitute_pass(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;

        for caps in SUBSTITUTION_PATTERN.captures_iter(input) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            out.push_str(&input[last..whole.start()]);
            out.push_str(&self.resolve(&caps)?);
            last = whole.end();
        }
        out.push_str(&input[last..]);

        Ok(out)
    }

    fn resolve(&self, caps: &Captures) -> Result<String, SubstitutionError> {
        let kind = &caps[1];
        let value = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");

        match kind {
            "arg" => self
                .args
                .get(value)
                .cloned()
                .ok_or_else(|| SubstitutionError::UndefinedArg(value.to_string())),
            "env" => self
                .env
                .get(value)
                .cloned()
                .or_else(|| std::env::var(value).ok())
                .ok_or_else(|| SubstitutionError::UndefinedEnv(value.to_string())),
            "timestamp" => {
                let format = if value.is_empty() { "%Y%m%d_%H%M%S" } else { value };
                let mut stamp = String::new();
                write!(stamp, "{}", chrono::Local::now().format(format))
                    .map_err(|_| SubstitutionError::InvalidTimestamp(format.to_string()))?;
                Ok(stamp)
            }
            other => Err(SubstitutionError::UnknownType(other.to_string())),
        }
    }
}

/// Errors that can occur during substitution
#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error("Unknown substitution type: {0}")]
    UnknownType(String),

    #[error("Undefined argument: {0}")]
    UndefinedArg(String),

    #[error("Undefined environment variable: {0}")]
    UndefinedEnv(String),

    #[error("Substitution did not settle for: {0}")]
    TooDeep(String),

    #[error("Invalid timestamp format: {0}")]
    InvalidTimestamp(String),
}
