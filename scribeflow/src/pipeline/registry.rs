//! Stage registry and dependency resolution.

use super::StageDefinition;
use crate::errors::{CycleError, DuplicateStageError, RegistryError, UnknownDependencyError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Which stages a run should produce.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Targets {
    /// Every registered stage.
    #[default]
    All,
    /// The named stages and their transitive dependencies.
    Stages(Vec<String>),
}

impl Targets {
    /// Targets the given stages.
    #[must_use]
    pub fn stages<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Stages(names.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for Targets {
    fn from(stage: &str) -> Self {
        Self::Stages(vec![stage.to_string()])
    }
}

/// The set of known stages, in registration order.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    stages: Vec<Arc<StageDefinition>>,
    index: HashMap<String, usize>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a validating builder.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registers a stage.
    ///
    /// Dependencies may be registered later; they are checked when an
    /// execution order is built.
    ///
    /// # Errors
    ///
    /// Returns `Duplicate` if the name is taken, or `InvalidDefinition` if
    /// the definition is malformed.
    pub fn register(&mut self, definition: StageDefinition) -> Result<(), RegistryError> {
        definition.validate()?;
        if self.index.contains_key(&definition.name) {
            return Err(DuplicateStageError {
                stage: definition.name,
            }
            .into());
        }

        debug!(stage = %definition.name, deps = ?definition.depends_on, "Registered stage");
        self.index.insert(definition.name.clone(), self.stages.len());
        self.stages.push(Arc::new(definition));
        Ok(())
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<StageDefinition>> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    /// Returns true if the stage is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Stage names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }

    /// Number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Checks the whole graph for unknown dependencies and cycles.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found.
    pub fn validate(&self) -> Result<(), RegistryError> {
        self.resolve(&Targets::All).map(|_| ())
    }

    /// Resolves run targets into an execution order.
    ///
    /// # Errors
    ///
    /// See [`build_execution_order`](Self::build_execution_order).
    pub fn resolve(&self, targets: &Targets) -> Result<Vec<Arc<StageDefinition>>, RegistryError> {
        match targets {
            Targets::All => self.build_execution_order(self.names()),
            Targets::Stages(names) => self.build_execution_order(names),
        }
    }

    /// Orders the requested stages and all their transitive dependencies.
    ///
    /// Every dependency precedes its dependents. Among stages that are ready
    /// at the same time, the one registered first comes first, so the result
    /// is stable across calls.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` for an unregistered request, `UnknownDependency`
    /// for a dangling `depends_on` entry, and `Cycle` if the requested
    /// subgraph is cyclic. No partial order is ever returned.
    pub fn build_execution_order<I, S>(
        &self,
        requested: I,
    ) -> Result<Vec<Arc<StageDefinition>>, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let closure = self.closure(requested)?;

        let mut in_degree: HashMap<usize, usize> = HashMap::with_capacity(closure.len());
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for &node in &closure {
            let deps = self.dependency_indices(node)?;
            in_degree.insert(node, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(node);
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&node, _)| node)
            .collect();
        let mut order = Vec::with_capacity(closure.len());

        while let Some(node) = ready.pop_first() {
            order.push(Arc::clone(&self.stages[node]));
            for &child in dependents.get(&node).map_or(&[][..], Vec::as_slice) {
                if let Some(degree) = in_degree.get_mut(&child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(child);
                    }
                }
            }
        }

        if order.len() < closure.len() {
            let stuck: BTreeSet<usize> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(node, _)| node)
                .collect();
            return Err(CycleError::new(self.find_cycle(&stuck)?).into());
        }

        Ok(order)
    }

    /// Expands the request to its transitive dependency closure.
    fn closure<I, S>(&self, requested: I) -> Result<BTreeSet<usize>, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut closure = BTreeSet::new();
        let mut stack = Vec::new();
        for name in requested {
            let name = name.as_ref();
            let &node = self
                .index
                .get(name)
                .ok_or_else(|| RegistryError::UnknownStage(name.to_string()))?;
            stack.push(node);
        }

        while let Some(node) = stack.pop() {
            if closure.insert(node) {
                stack.extend(self.dependency_indices(node)?);
            }
        }
        Ok(closure)
    }

    fn dependency_indices(&self, node: usize) -> Result<Vec<usize>, RegistryError> {
        let stage = &self.stages[node];
        stage
            .depends_on
            .iter()
            .map(|dep| {
                self.index.get(dep).copied().ok_or_else(|| {
                    RegistryError::from(UnknownDependencyError {
                        stage: stage.name.clone(),
                        dependency: dep.clone(),
                    })
                })
            })
            .collect()
    }

    /// Walks dependency edges inside `stuck` until a node repeats.
    ///
    /// Every node left over by Kahn's algorithm still has an unresolved
    /// dependency inside the leftover set, so the walk always closes.
    fn find_cycle(&self, stuck: &BTreeSet<usize>) -> Result<Vec<String>, RegistryError> {
        let Some(&start) = stuck.first() else {
            return Ok(Vec::new());
        };

        let mut path: Vec<usize> = Vec::new();
        let mut position: HashMap<usize, usize> = HashMap::new();
        let mut node = start;
        loop {
            if let Some(&at) = position.get(&node) {
                let mut cycle: Vec<String> = path[at..]
                    .iter()
                    .map(|&i| self.stages[i].name.clone())
                    .collect();
                cycle.push(self.stages[node].name.clone());
                return Ok(cycle);
            }
            position.insert(node, path.len());
            path.push(node);

            let next = self
                .dependency_indices(node)?
                .into_iter()
                .filter(|dep| stuck.contains(dep))
                .min();
            match next {
                Some(dep) => node = dep,
                None => return Ok(path.iter().map(|&i| self.stages[i].name.clone()).collect()),
            }
        }
    }
}

/// Builds a registry and validates the complete graph before handing it out.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: StageRegistry,
}

impl RegistryBuilder {
    /// Adds a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or the definition is malformed.
    pub fn stage(mut self, definition: StageDefinition) -> Result<Self, RegistryError> {
        self.registry.register(definition)?;
        Ok(self)
    }

    /// Finishes the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if any dependency is unknown or the graph is cyclic.
    pub fn build(self) -> Result<StageRegistry, RegistryError> {
        self.registry.validate()?;
        Ok(self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageResult;
    use crate::stages::FnStage;
    use pretty_assertions::assert_eq;

    fn def(name: &str, deps: &[&str]) -> StageDefinition {
        StageDefinition::new(name, FnStage::new(name, |_, _| Ok(StageResult::text("ok"))))
            .with_dependencies(deps.iter().copied())
    }

    fn names(order: &[Arc<StageDefinition>]) -> Vec<&str> {
        order.iter().map(|s| s.name.as_str()).collect()
    }

    fn transcript_registry() -> StageRegistry {
        StageRegistry::builder()
            .stage(def("parse", &[]))
            .and_then(|b| b.stage(def("transcribe", &["parse"])))
            .and_then(|b| b.stage(def("clean", &["transcribe"])))
            .and_then(|b| b.stage(def("summarize", &["clean"])))
            .and_then(|b| b.stage(def("chunk", &["clean"])))
            .and_then(RegistryBuilder::build)
            .unwrap()
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = StageRegistry::new();
        registry.register(def("parse", &[])).unwrap();
        let err = registry.register(def("parse", &[])).unwrap_err();
        assert_eq!(
            err,
            RegistryError::Duplicate(DuplicateStageError {
                stage: "parse".to_string()
            })
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stage_name_with_space_fails_at_registration() {
        let err = StageRegistry::builder()
            .stage(def("parse", &[]))
            .and_then(|b| b.stage(def("clean summary", &["parse"])))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InvalidDefinition { ref stage, .. } if stage == "clean summary"
        ));
    }

    #[test]
    fn test_requested_subset_orders_dependencies_first() {
        let registry = transcript_registry();
        let order = registry.build_execution_order(["chunk", "summarize"]).unwrap();
        assert_eq!(names(&order), vec!["parse", "transcribe", "clean", "summarize", "chunk"]);
    }

    #[test]
    fn test_order_is_stable_and_follows_registration() {
        let mut registry = StageRegistry::new();
        registry.register(def("b", &[])).unwrap();
        registry.register(def("a", &[])).unwrap();
        registry.register(def("c", &["a", "b"])).unwrap();

        let first = names(&registry.build_execution_order(["c"]).unwrap())
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        for _ in 0..10 {
            let again = registry.build_execution_order(["c"]).unwrap();
            assert_eq!(names(&again), first);
        }
        assert_eq!(first, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_every_dependency_precedes_its_dependents() {
        let mut registry = StageRegistry::new();
        for layer in 0..6 {
            for i in 0..5 {
                let deps: Vec<String> = if layer == 0 {
                    Vec::new()
                } else {
                    vec![format!("s{}_{}", layer - 1, (i * 3) % 5), format!("s{}_{}", layer - 1, (i + 4) % 5)]
                };
                let name = format!("s{layer}_{i}");
                registry
                    .register(def(&name, &deps.iter().map(String::as_str).collect::<Vec<_>>()))
                    .unwrap();
            }
        }

        let order = registry.resolve(&Targets::All).unwrap();
        assert_eq!(order.len(), 30);
        crate::testing::assert_topological(&order);

        let partial = registry.build_execution_order(["s5_2"]).unwrap();
        crate::testing::assert_topological(&partial);
        assert_eq!(partial.last().unwrap().name, "s5_2");
    }

    #[test]
    fn test_closure_only_includes_needed_stages() {
        let registry = transcript_registry();
        let order = registry.build_execution_order(["transcribe"]).unwrap();
        assert_eq!(names(&order), vec!["parse", "transcribe"]);

        let order = registry.build_execution_order(["clean", "clean"]).unwrap();
        assert_eq!(names(&order), vec!["parse", "transcribe", "clean"]);
    }

    #[test]
    fn test_all_targets() {
        let registry = transcript_registry();
        let order = registry.resolve(&Targets::All).unwrap();
        assert_eq!(order.len(), 5);
        let order = registry.resolve(&Targets::from("clean")).unwrap();
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_unknown_dependency() {
        let mut registry = StageRegistry::new();
        registry.register(def("summarize", &["clean"])).unwrap();
        let err = registry.build_execution_order(["summarize"]).unwrap_err();
        assert_eq!(
            err,
            RegistryError::UnknownDependency(UnknownDependencyError {
                stage: "summarize".to_string(),
                dependency: "clean".to_string(),
            })
        );
    }

    #[test]
    fn test_unknown_requested_stage() {
        let registry = transcript_registry();
        let err = registry.build_execution_order(["narrative"]).unwrap_err();
        assert_eq!(err, RegistryError::UnknownStage("narrative".to_string()));
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let mut registry = StageRegistry::new();
        registry.register(def("parse", &[])).unwrap();
        registry.register(def("a", &["parse", "c"])).unwrap();
        registry.register(def("b", &["a"])).unwrap();
        registry.register(def("c", &["b"])).unwrap();

        let err = registry.build_execution_order(["c"]).unwrap_err();
        let RegistryError::Cycle(cycle) = &err else {
            panic!("expected a cycle error, got {err:?}");
        };
        assert_eq!(cycle.cycle_path, vec!["a", "c", "b", "a"]);
        assert!(registry.validate().is_err());
    }

    #[test]
    fn test_builder_rejects_cycle_at_build() {
        let result = StageRegistry::builder()
            .stage(def("x", &["y"]))
            .and_then(|b| b.stage(def("y", &["x"])))
            .and_then(RegistryBuilder::build);
        assert!(matches!(result, Err(RegistryError::Cycle(_))));
    }

    #[test]
    fn test_forward_references_allowed() {
        let mut registry = StageRegistry::new();
        registry.register(def("clean", &["transcribe"])).unwrap();
        registry.register(def("transcribe", &[])).unwrap();
        let order = registry.build_execution_order(["clean"]).unwrap();
        assert_eq!(names(&order), vec!["transcribe", "clean"]);
    }
}
