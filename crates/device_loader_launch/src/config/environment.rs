//! Environment description file loading
//!
//! The container image ships a shell file (by default `/environment.sh`)
//! that the launcher sources with `bash`. Whatever variables the file
//! defines or changes become the environment overlay of the application.

use indexmap::IndexMap;
use regex::Regex;
use std::iter::Peekable;
use std::path::Path;
use std::process::{Command, Stdio};
use std::str::Chars;
use std::sync::LazyLock;

pub const DEFAULT_ENV_FILE: &str = "/environment.sh";

/// Shell used to source environment files
pub const SOURCE_SHELL: &str = "bash";

/// Dumps the environment, an empty entry, then the environment again after
/// sourcing `$0` with auto-export on. Output of the file goes to stderr.
const SOURCE_SCRIPT: &str = r#"env -0; printf '\0'; set -a; . "$0" >&2 || exit; env -0"#;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Variables loaded from an environment file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: IndexMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source an environment file and keep the variables it set or changed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EnvironmentError> {
        let path = path.as_ref();
        std::fs::File::open(path).map_err(|e| EnvironmentError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let output = Command::new(SOURCE_SHELL)
            .arg("-c")
            .arg(SOURCE_SCRIPT)
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EnvironmentError::Spawn {
                shell: SOURCE_SHELL.to_string(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(EnvironmentError::Source {
                path: path.display().to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let env = Self::from_dumps(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            EnvironmentError::Source {
                path: path.display().to_string(),
                status: output.status.to_string(),
                stderr: "the file exited before its variables could be read".to_string(),
            }
        })?;
        log::debug!(
            "Loaded {} variables from {}",
            env.len(),
            path.display()
        );
        Ok(env)
    }

    /// Diff the `env -0` dumps taken before and after sourcing
    fn from_dumps(output: &str) -> Option<Self> {
        let mut entries = output.split('\0');
        let before: IndexMap<&str, &str> = entries
            .by_ref()
            .take_while(|entry| !entry.is_empty())
            .filter_map(|entry| entry.split_once('='))
            .collect();

        let mut env = Self::new();
        let mut complete = false;
        for entry in entries {
            let Some((name, value)) = entry.split_once('=') else {
                continue;
            };
            complete = true;
            // Exported functions and `_` are shell bookkeeping
            if name == "_" || !IDENTIFIER.is_match(name) {
                continue;
            }
            if before.get(name) != Some(&value) {
                env.vars.insert(name.to_string(), value.to_string());
            }
        }

        complete.then_some(env)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Look a variable up in the loaded set, then in the process environment
    pub fn lookup(&self, name: &str) -> Option<String> {
        self.vars
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Expand `$VAR`, `${VAR}` and `${VAR:-default}` in free text
    pub fn expand(&self, input: &str) -> Result<String, EnvironmentError> {
        let mut out = String::with_capacity(input.len());
        let mut chars = input.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&'$') => {
                    chars.next();
                    out.push('$');
                }
                '$' => self.expand_variable(&mut chars, &mut out, input)?,
                other => out.push(other),
            }
        }

        Ok(out)
    }

    /// Expand a variable reference whose `$` has already been consumed
    fn expand_variable(
        &self,
        chars: &mut Peekable<Chars<'_>>,
        out: &mut String,
        input: &str,
    ) -> Result<(), EnvironmentError> {
        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut default = None;
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(':') if chars.peek() == Some(&'-') => {
                            chars.next();
                            let mut fallback = String::new();
                            loop {
                                match chars.next() {
                                    Some('}') => break,
                                    Some(ch) => fallback.push(ch),
                                    None => return Err(unterminated(input)),
                                }
                            }
                            default = Some(fallback);
                            break;
                        }
                        Some(ch) => name.push(ch),
                        None => return Err(unterminated(input)),
                    }
                }
                if !IDENTIFIER.is_match(&name) {
                    return Err(EnvironmentError::Expand(format!(
                        "bad substitution '${{{}}}'",
                        name
                    )));
                }
                let value = self.lookup(&name).filter(|v| !v.is_empty());
                out.push_str(&value.or(default).unwrap_or_default());
            }
            Some(ch) if ch.is_ascii_alphabetic() || *ch == '_' => {
                let mut name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        name.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&self.lookup(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
        Ok(())
    }
}

fn unterminated(input: &str) -> EnvironmentError {
    EnvironmentError::Expand(format!("unterminated '${{' in '{}'", input))
}

/// Errors that can occur when loading an environment file
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("Failed to read environment file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to run '{shell}': {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Sourcing '{path}' failed ({status}): {stderr}")]
    Source {
        path: String,
        status: String,
        stderr: String,
    },

    #[error("Invalid expansion: {0}")]
    Expand(String),
}
