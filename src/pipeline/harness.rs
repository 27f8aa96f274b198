//! Runs pipelines against a fake node with an in-memory state store

use crate::node::{NodeEnv, NodeStep};
use crate::platform::fake::FakeNode;
use convergence::{
    Driver, DriverOptions, ManualClock, MemoryStateStore, NoProgress, PassOutcome, Pipeline,
    PipelineBuilder, PassSummary,
};
use tempfile::TempDir;

pub struct Harness {
    _dir: TempDir,
    pub options: DriverOptions,
    pub store: MemoryStateStore,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let options = DriverOptions::new(dir.path().join("hpcnode.lock"));
        Self {
            _dir: dir,
            options,
            store: MemoryStateStore::new(),
            clock: ManualClock::new(),
        }
    }

    pub fn run(
        &self,
        pipeline: &Pipeline<NodeEnv>,
        env: &NodeEnv,
        fake: &FakeNode,
    ) -> convergence::Result<PassOutcome> {
        Driver::new(
            pipeline,
            env,
            &self.store,
            fake,
            &self.clock,
            self.options.clone(),
        )
        .run(&mut NoProgress)
    }

    /// Run a pass that must complete and return its summary
    pub fn converge(
        &self,
        pipeline: &Pipeline<NodeEnv>,
        env: &NodeEnv,
        fake: &FakeNode,
    ) -> PassSummary {
        match self.run(pipeline, env, fake).unwrap() {
            PassOutcome::Completed(summary) => summary,
            other => panic!("pass did not complete: {other:?}"),
        }
    }

    /// Run passes until one completes, as re-entry after each reboot would
    pub fn converge_across_reboots(
        &self,
        pipeline: &Pipeline<NodeEnv>,
        env: &NodeEnv,
        fake: &FakeNode,
    ) -> PassSummary {
        for _ in 0..10 {
            if let PassOutcome::Completed(summary) = self.run(pipeline, env, fake).unwrap() {
                return summary;
            }
        }
        panic!("pipeline did not converge within 10 passes");
    }
}

pub fn pipeline(name: &str, steps: Vec<NodeStep>) -> Pipeline<NodeEnv> {
    let mut builder = PipelineBuilder::new(name);
    builder.steps(steps);
    builder.build().unwrap()
}
