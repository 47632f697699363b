//! Cross-cutting hooks wrapping step execution.
//!
//! The pipeline around a step body is: flow-level middleware (in
//! registration order), then step-level middleware (in registration
//! order), then the body. A middleware may observe, short-circuit with a
//! failure, or transform the result; failures obey the step's
//! critical/allow-failure policy like body failures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::engine::context::ExecutionContext;
use crate::engine::types::StepResult;

/// Boxed future returned by step bodies and middleware.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<StepResult>> + Send + 'a>>;

/// A step body: receives the execution context, returns a result.
/// Raised errors are converted by the executor into typed failures.
pub type StepBody =
    Arc<dyn for<'a> Fn(&'a mut ExecutionContext) -> StepFuture<'a> + Send + Sync>;

/// Trait all middleware must implement.
pub trait Middleware: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Wrap the rest of the pipeline. Call `next.run(ctx)` to continue, or
    /// return early to short-circuit.
    fn handle<'a>(&'a self, ctx: &'a mut ExecutionContext, next: Next<'a>) -> StepFuture<'a>;
}

/// Continuation handle for the remainder of the pipeline.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    body: &'a StepBody,
}

impl<'a> Next<'a> {
    pub fn run(self, ctx: &'a mut ExecutionContext) -> StepFuture<'a> {
        match self.chain.split_first() {
            Some((mw, rest)) => mw.handle(
                ctx,
                Next {
                    chain: rest,
                    body: self.body,
                },
            ),
            None => (self.body)(ctx),
        }
    }
}

/// Run `body` under the given middleware chain.
pub(crate) fn run_pipeline<'a>(
    chain: &'a [Arc<dyn Middleware>],
    body: &'a StepBody,
    ctx: &'a mut ExecutionContext,
) -> StepFuture<'a> {
    Next { chain, body }.run(ctx)
}

/// Middleware that records each step's wall-clock duration.
pub struct TimingMiddleware;

impl Middleware for TimingMiddleware {
    fn name(&self) -> &str {
        "timing"
    }

    fn handle<'a>(&'a self, ctx: &'a mut ExecutionContext, next: Next<'a>) -> StepFuture<'a> {
        Box::pin(async move {
            let started = std::time::Instant::now();
            let step = ctx.current_step().to_string();
            let result = next.run(ctx).await;
            info!(
                step = %step,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Step pipeline finished"
            );
            result
        })
    }
}

/// Middleware that fails the step when a required data key is absent,
/// before the body runs.
pub struct RequireDataMiddleware {
    pub keys: Vec<String>,
}

impl Middleware for RequireDataMiddleware {
    fn name(&self) -> &str {
        "require_data"
    }

    fn handle<'a>(&'a self, ctx: &'a mut ExecutionContext, next: Next<'a>) -> StepFuture<'a> {
        Box::pin(async move {
            for key in &self.keys {
                if !ctx.has_data(key) {
                    return Ok(StepResult::failure(format!(
                        "required data key '{}' is missing",
                        key
                    )));
                }
            }
            next.run(ctx).await
        })
    }
}
