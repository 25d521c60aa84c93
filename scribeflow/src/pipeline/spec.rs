//! Stage definitions.

use crate::cache::is_valid_key_component;
use crate::errors::RegistryError;
use crate::stages::Stage;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// A named stage with its declared dependencies.
#[derive(Debug, Clone)]
pub struct StageDefinition {
    /// The unique name of the stage.
    pub name: String,
    /// Names of stages whose outputs this stage reads.
    pub depends_on: BTreeSet<String>,
    /// Whether the stage may be skipped by the skip predicate.
    pub optional: bool,
    /// Upper bound on one invocation, if any.
    pub timeout: Option<Duration>,
    /// The stage implementation.
    pub runner: Arc<dyn Stage>,
}

impl StageDefinition {
    /// Creates a new stage definition.
    #[must_use]
    pub fn new(name: impl Into<String>, runner: impl Stage + 'static) -> Self {
        Self::from_arc(name, Arc::new(runner))
    }

    /// Creates a new stage definition from a shared implementation.
    #[must_use]
    pub fn from_arc(name: impl Into<String>, runner: Arc<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            depends_on: BTreeSet::new(),
            optional: false,
            timeout: None,
            runner,
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.insert(dep.into());
        self
    }

    /// Adds several dependencies.
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Marks the stage as optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Bounds each invocation of the stage.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validates the definition in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or cannot be used as a cache
    /// key, if the stage depends on itself, or if the timeout is zero.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::InvalidDefinition {
                stage: self.name.clone(),
                reason: "name cannot be empty or whitespace-only".to_string(),
            });
        }
        if !is_valid_key_component(&self.name) {
            return Err(RegistryError::InvalidDefinition {
                stage: self.name.clone(),
                reason: "name must start with a letter or digit and contain only letters, digits, '.', '_' or '-'"
                    .to_string(),
            });
        }
        if self.depends_on.contains(&self.name) {
            return Err(RegistryError::InvalidDefinition {
                stage: self.name.clone(),
                reason: "a stage cannot depend on itself".to_string(),
            });
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(RegistryError::InvalidDefinition {
                stage: self.name.clone(),
                reason: "timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageResult;
    use crate::stages::FnStage;

    fn def(name: &str) -> StageDefinition {
        StageDefinition::new(name, FnStage::new(name, |_, _| Ok(StageResult::text("ok"))))
    }

    #[test]
    fn test_builder_methods() {
        let stage = def("summarize")
            .with_dependency("clean")
            .with_dependencies(["transcribe", "clean"])
            .optional()
            .with_timeout(Duration::from_secs(30));

        assert_eq!(stage.depends_on.len(), 2);
        assert!(stage.optional);
        assert_eq!(stage.timeout, Some(Duration::from_secs(30)));
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = def("clean").with_dependency("clean").validate().unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDefinition { .. }));
        assert!(err.to_string().contains("itself"));
    }

    #[test]
    fn test_names_unusable_as_cache_keys_rejected() {
        for name in ["clean summary", "../parse", ".hidden", "a/b"] {
            let err = def(name).validate().unwrap_err();
            assert!(
                matches!(&err, RegistryError::InvalidDefinition { stage, .. } if stage == name),
                "{name} accepted"
            );
        }
        assert!(def("clean_v2.summary-en").validate().is_ok());
    }

    #[test]
    fn test_blank_name_and_zero_timeout_rejected() {
        assert!(def("  ").validate().is_err());
        assert!(def("parse").with_timeout(Duration::ZERO).validate().is_err());
    }
}
