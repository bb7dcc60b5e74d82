mod api;
#[allow(clippy::module_inception)]
mod worker;

pub use api::{ApiErrorResponse, WorkerApi};
pub use worker::{Worker, WorkerError};
