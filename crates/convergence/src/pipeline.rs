//! Ordered step pipelines

use crate::error::{Error, Result};
use crate::step::Step;
use std::collections::HashSet;
use std::fmt;

/// An immutable, validated, ordered list of steps
///
/// Steps in the deferred tail run after every main step, in the same pass.
pub struct Pipeline<E> {
    name: String,
    steps: Vec<Step<E>>,
    deferred_start: usize,
}

impl<E> Pipeline<E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step<E>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Index of the step with the given id
    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id() == id)
    }

    /// Index of the first deferred step (equals `len()` if there is none)
    pub fn deferred_start(&self) -> usize {
        self.deferred_start
    }

    /// Whether the step at `index` belongs to the deferred tail
    pub fn is_deferred(&self, index: usize) -> bool {
        index >= self.deferred_start && index < self.steps.len()
    }
}

impl<E> fmt::Debug for Pipeline<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("deferred_start", &self.deferred_start)
            .finish()
    }
}

/// Builder that collects main and deferred steps
pub struct PipelineBuilder<E> {
    name: String,
    main: Vec<Step<E>>,
    deferred: Vec<Step<E>>,
}

impl<E> PipelineBuilder<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            main: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Append a step to the main phase
    pub fn step(&mut self, step: Step<E>) -> &mut Self {
        self.main.push(step);
        self
    }

    /// Append several steps to the main phase
    pub fn steps(&mut self, steps: impl IntoIterator<Item = Step<E>>) -> &mut Self {
        self.main.extend(steps);
        self
    }

    /// Append a step to the deferred phase
    pub fn defer(&mut self, step: Step<E>) -> &mut Self {
        self.deferred.push(step);
        self
    }

    /// Validate step ids and freeze the pipeline
    pub fn build(self) -> Result<Pipeline<E>> {
        let deferred_start = self.main.len();
        let mut steps = self.main;
        steps.extend(self.deferred);

        let mut seen = HashSet::new();
        for step in &steps {
            if step.id().trim().is_empty() {
                return Err(Error::InvalidPipeline {
                    pipeline: self.name,
                    message: format!("step '{}' has an empty id", step.description()),
                });
            }
            if !seen.insert(step.id()) {
                return Err(Error::InvalidPipeline {
                    pipeline: self.name,
                    message: format!("duplicate step id '{}'", step.id()),
                });
            }
        }

        Ok(Pipeline {
            name: self.name,
            steps,
            deferred_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionResult;

    fn step(id: &str) -> Step<()> {
        Step::new(id, format!("step {id}"), |_| Ok(ActionResult::Done))
    }

    #[test]
    fn test_deferred_steps_follow_main() {
        let mut builder = PipelineBuilder::new("compute-node");
        builder.defer(step("bring-online"));
        builder.step(step("install")).step(step("register"));
        let pipeline = builder.build().unwrap();

        let ids: Vec<_> = pipeline.steps().iter().map(Step::id).collect();
        assert_eq!(ids, vec!["install", "register", "bring-online"]);
        assert_eq!(pipeline.deferred_start(), 2);
        assert!(pipeline.is_deferred(2));
        assert!(!pipeline.is_deferred(1));
        assert_eq!(pipeline.position("register"), Some(1));
        assert_eq!(pipeline.position("missing"), None);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut builder = PipelineBuilder::new("head-node");
        builder.step(step("install")).defer(step("install"));
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("duplicate step id 'install'"));
    }

    #[test]
    fn test_empty_id_rejected() {
        let mut builder = PipelineBuilder::new("head-node");
        builder.step(step(" "));
        assert!(matches!(
            builder.build(),
            Err(Error::InvalidPipeline { .. })
        ));
    }

    #[test]
    fn test_debug_does_not_need_debug_env() {
        struct Machine;

        let mut builder = PipelineBuilder::new("broker-node");
        builder.step(Step::new("install", "install", |_: &Machine| {
            Ok(ActionResult::Done)
        }));
        let pipeline = builder.build().unwrap();
        assert!(format!("{pipeline:?}").contains("broker-node"));

        let mut builder = PipelineBuilder::new("broker-node");
        builder
            .step(Step::new("a", "a", |_: &Machine| Ok(ActionResult::Done)))
            .step(Step::new("a", "a", |_: &Machine| Ok(ActionResult::Done)));
        assert!(matches!(
            builder.build().unwrap_err(),
            Error::InvalidPipeline { .. }
        ));
    }
}
