//! Import allowlist for learner code.
//!
//! The sandbox replaces `builtins.__import__` with a hook that consults a
//! [`ModuleAllowlist`] for every import issued by learner code. Imports issued
//! by stdlib modules themselves are not checked, so an allowed module can load
//! its own private dependencies.

use std::collections::HashSet;

use crate::types::{ExecutionError, ExecutionSettings};

/// Set of importable top-level module names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleAllowlist {
    names: HashSet<String>,
}

impl ModuleAllowlist {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self::new(settings.allowed_modules.iter().cloned())
    }

    /// `Ok(())` if `module_name` or its top-level package is allowed.
    ///
    /// `collections.abc` is importable when `collections` is allowed.
    pub fn check(&self, module_name: &str) -> Result<(), ExecutionError> {
        if self.names.contains(module_name) {
            return Ok(());
        }
        if let Some((parent, _)) = module_name.split_once('.') {
            if self.names.contains(parent) {
                return Ok(());
            }
        }
        Err(ExecutionError::ModuleNotAllowed {
            module_name: module_name.to_string(),
        })
    }

    pub fn is_allowed(&self, module_name: &str) -> bool {
        self.check(module_name).is_ok()
    }
}
