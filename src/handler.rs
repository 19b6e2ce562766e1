//! The interface user code plugs into: a typed handler per job name plus an
//! optional middleware chain run in registration order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::job::{Job, JobOptions, default_backoff};

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, job: &Job) -> Result<()> {
        (self.0)(job.clone()).await
    }
}

/// Wraps an async closure as a handler, for registrations that don't need
/// their own type.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, job: &Job, next: Next<'_>) -> Result<()>;
}

/// The remainder of the chain. Calling `run` advances to the next
/// middleware, or to the handler once the chain is exhausted.
pub struct Next<'a> {
    pub(crate) chain: &'a [Arc<dyn Middleware>],
    pub(crate) handler: &'a dyn JobHandler,
}

impl Next<'_> {
    pub async fn run(self, job: &Job) -> Result<()> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.call(
                    job,
                    Next {
                        chain: rest,
                        handler: self.handler,
                    },
                )
                .await
            }
            None => self.handler.handle(job).await,
        }
    }
}

pub(crate) struct JobType {
    pub name: String,
    pub options: JobOptions,
    pub handler: Arc<dyn JobHandler>,
}

impl JobType {
    pub(crate) fn calc_backoff(&self, job: &Job) -> i64 {
        match &self.options.backoff {
            Some(backoff) => backoff(job),
            None => default_backoff(job),
        }
    }
}

pub(crate) type Registry = HashMap<String, Arc<JobType>>;

/// Runs the middleware chain and handler for one job.
pub(crate) async fn invoke(middleware: &[Arc<dyn Middleware>], job_type: &JobType, job: &Job) -> Result<()> {
    Next {
        chain: middleware,
        handler: job_type.handler.as_ref(),
    }
    .run(job)
    .await
}
