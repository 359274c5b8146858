use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while assembling an override set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvError {
    #[error("Environment variable name is empty")]
    EmptyName,
    #[error("Environment variable name {0:?} contains '=' or NUL")]
    InvalidName(String),
    #[error("Value of environment variable {0:?} contains NUL")]
    InvalidValue(String),
    #[error("Environment variable {name:?} is overridden twice ({first:?} vs {second:?})")]
    ConflictingOverride {
        name: String,
        first: String,
        second: String,
    },
}

/// An ordered, immutable-by-convention process environment.
///
/// Values are never shared between build attempts: every profile composes its
/// own copy from the same base, so nothing set for one engine can leak into the
/// next one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

fn validate(name: &str, value: &str) -> Result<(), EnvError> {
    if name.is_empty() {
        return Err(EnvError::EmptyName);
    }
    if name.contains('=') || name.contains('\0') {
        return Err(EnvError::InvalidName(name.to_string()));
    }
    if value.contains('\0') {
        return Err(EnvError::InvalidValue(name.to_string()));
    }
    Ok(())
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the current process environment. Entries that are not valid
    /// UTF-8 are skipped.
    pub fn from_process() -> Self {
        let mut vars = BTreeMap::new();
        for (key, value) in std::env::vars_os() {
            match (key.into_string(), value.into_string()) {
                (Ok(k), Ok(v)) => {
                    vars.insert(k, v);
                }
                (Ok(k), Err(_)) => {
                    log::warn!("Skipping environment variable {k} with non UTF-8 value");
                }
                (Err(k), _) => {
                    log::warn!("Skipping environment variable with non UTF-8 name {k:?}");
                }
            }
        }
        Self { vars }
    }

    /// Builds an override set. The same name may appear twice only with the
    /// same value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, EnvError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut vars: BTreeMap<String, String> = BTreeMap::new();
        for (k, v) in pairs {
            let (name, value) = (k.into(), v.into());
            validate(&name, &value)?;
            if let Some(first) = vars.get(&name) {
                if *first != value {
                    return Err(EnvError::ConflictingOverride {
                        name,
                        first: first.clone(),
                        second: value,
                    });
                }
                continue;
            }
            vars.insert(name, value);
        }
        Ok(Self { vars })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    /// Returns a copy with one variable set.
    pub fn with_var(&self, name: &str, value: &str) -> Result<Self, EnvError> {
        validate(name, value)?;
        let mut vars = self.vars.clone();
        vars.insert(name.to_string(), value.to_string());
        Ok(Self { vars })
    }

    /// Returns a copy where `flags` are appended, space separated, to the
    /// current value of `name`.
    pub fn with_appended_flags(&self, name: &str, flags: &[String]) -> Result<Self, EnvError> {
        if flags.is_empty() {
            return Ok(self.clone());
        }
        let appended = flags.join(" ");
        let value = match self.get(name) {
            Some(existing) if !existing.trim().is_empty() => format!("{existing} {appended}"),
            _ => appended,
        };
        self.with_var(name, &value)
    }

    /// Replaces every `{NAME}` in `template` with the value of `NAME`.
    /// Unknown names expand to the empty string.
    pub fn expand(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if is_var_name(&after[..close]) => {
                    out.push_str(self.get(&after[..close]).unwrap_or_default());
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn is_var_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Overlays `overrides` on top of `base` and returns the result. Neither input
/// is modified.
pub fn compose(base: &Environment, overrides: &Environment) -> Environment {
    let mut vars = base.vars.clone();
    for (k, v) in &overrides.vars {
        vars.insert(k.clone(), v.clone());
    }
    Environment { vars }
}
