//! Synchronous table-driven pipeline for base-rootfs mutation.
//!
//! Generalizes `boxlite::pipeline`'s `Stage`/`PipelineTask`/`ExecutionMode`
//! abstraction from async VM-init stages to synchronous filesystem mutation
//! steps: spec.md §5 states there is no in-process async scheduler in this
//! core, so `PipelineTask::run` is a plain blocking function and
//! `ExecutionMode::Parallel` uses `std::thread::scope` rather than
//! `tokio::join!`.

use ctr_types::CtrError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

pub trait PipelineTask<Ctx>: Send + Sync {
    fn run(&self, ctx: &Ctx) -> Result<(), CtrError>;
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;

pub struct Stage<Ctx> {
    tasks: Vec<BoxedTask<Ctx>>,
    execution: ExecutionMode,
}

impl<Ctx> Stage<Ctx> {
    pub fn parallel(tasks: Vec<BoxedTask<Ctx>>) -> Self {
        Self {
            tasks,
            execution: ExecutionMode::Parallel,
        }
    }

    pub fn sequential(tasks: Vec<BoxedTask<Ctx>>) -> Self {
        Self {
            tasks,
            execution: ExecutionMode::Sequential,
        }
    }
}

/// Runs every stage in order; within a stage, runs its tasks per its
/// `ExecutionMode`. The first task error aborts the whole pipeline; tasks
/// already run are not rolled back here (the caller's scoped tmp dir is
/// the rollback unit).
pub fn run<Ctx: Sync>(stages: Vec<Stage<Ctx>>, ctx: &Ctx) -> Result<(), CtrError> {
    for stage in stages {
        match stage.execution {
            ExecutionMode::Sequential => {
                for task in &stage.tasks {
                    tracing::debug!(task = task.name(), "running pipeline task");
                    task.run(ctx)?;
                }
            }
            ExecutionMode::Parallel => {
                let result: Result<(), CtrError> = std::thread::scope(|scope| {
                    let handles: Vec<_> = stage
                        .tasks
                        .iter()
                        .map(|task| {
                            scope.spawn(move || {
                                tracing::debug!(task = task.name(), "running pipeline task");
                                task.run(ctx)
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().expect("pipeline task panicked")?;
                    }
                    Ok(())
                });
                result?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        name: &'static str,
        counter: &'static AtomicUsize,
    }

    impl PipelineTask<()> for CountingTask {
        fn run(&self, _ctx: &()) -> Result<(), CtrError> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    #[test]
    fn sequential_stage_runs_all_tasks() {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        COUNTER.store(0, Ordering::SeqCst);
        let stage = Stage::sequential(vec![
            Box::new(CountingTask { name: "a", counter: &COUNTER }) as BoxedTask<()>,
            Box::new(CountingTask { name: "b", counter: &COUNTER }) as BoxedTask<()>,
        ]);
        run(vec![stage], &()).unwrap();
        assert_eq!(COUNTER.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn parallel_stage_runs_all_tasks() {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        COUNTER.store(0, Ordering::SeqCst);
        let stage = Stage::parallel(vec![
            Box::new(CountingTask { name: "a", counter: &COUNTER }) as BoxedTask<()>,
            Box::new(CountingTask { name: "b", counter: &COUNTER }) as BoxedTask<()>,
            Box::new(CountingTask { name: "c", counter: &COUNTER }) as BoxedTask<()>,
        ]);
        run(vec![stage], &()).unwrap();
        assert_eq!(COUNTER.load(Ordering::SeqCst), 3);
    }
}
