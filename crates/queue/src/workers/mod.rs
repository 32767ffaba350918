//! Job workers.

mod publish;

pub use publish::{Outcome, PublishWorker, WorkerContext};
