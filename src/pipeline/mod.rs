//! Sequential task pipeline.
//!
//! The build is table-driven: a plan is an ordered list of named tasks
//! sharing one context. Execution is strictly sequential and fail-fast; the
//! executor records per-task durations for the build summary.

use crate::errors::VmforgeResult;
use async_trait::async_trait;
use std::time::Instant;

/// A named unit of pipeline work.
///
/// Tasks run with a shared context, cloned per task (use interior mutability
/// for writes).
#[async_trait]
pub trait BuildTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> VmforgeResult<()>;

    /// Human-readable task name for logging and metrics.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn BuildTask<Ctx>>;

/// Ordered task list making up one pipeline phase.
pub struct Plan<Ctx> {
    tasks: Vec<BoxedTask<Ctx>>,
}

impl<Ctx> Plan<Ctx> {
    pub fn new(tasks: Vec<BoxedTask<Ctx>>) -> Self {
        Self { tasks }
    }
}

#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub name: String,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Default)]
pub struct PlanMetrics {
    pub total_duration_ms: u128,
    pub tasks: Vec<TaskMetrics>,
}

impl PlanMetrics {
    pub fn task_duration_ms(&self, name: &str) -> Option<u128> {
        self.tasks
            .iter()
            .find(|task| task.name == name)
            .map(|task| task.duration_ms)
    }

    pub fn log(&self) {
        for task in &self.tasks {
            tracing::info!(task = %task.name, duration_ms = task.duration_ms as u64, "Stage finished");
        }
        tracing::info!(total_ms = self.total_duration_ms as u64, "Phase finished");
    }
}

/// Executes a plan task by task. The first task error aborts the plan and
/// propagates; remaining tasks are not run.
pub struct Executor;

impl Executor {
    pub async fn execute<Ctx>(plan: Plan<Ctx>, ctx: Ctx) -> VmforgeResult<PlanMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut task_metrics = Vec::with_capacity(plan.tasks.len());

        for task in plan.tasks {
            let name = task.name().to_string();
            tracing::info!(task = %name, "Running stage");
            let task_start = Instant::now();
            task.run(ctx.clone()).await?;
            task_metrics.push(TaskMetrics {
                name,
                duration_ms: task_start.elapsed().as_millis(),
            });
        }

        Ok(PlanMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            tasks: task_metrics,
        })
    }
}
