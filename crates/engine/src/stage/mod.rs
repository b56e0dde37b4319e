//! Stage abstraction and the runner that executes one stage for one task.
//!
//! - `traits`: the [`Stage`] trait implemented by pipeline steps
//! - `registry`: name → stage lookup and binding of `[[stages]]` config
//! - `retry`: backoff policy for transient failures
//! - `event`: the per-invocation report consumed by statistics
//! - `runner`: cache lookup, resource borrowing, timeouts and retries

pub mod event;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod traits;

pub use event::{CacheProbe, StageEvent, StageEventOutcome};
pub use registry::{BoundPipeline, BoundStage, StageRegistry};
pub use retry::RetryPolicy;
pub use runner::{StageFailure, StageRun, StageRunner};
pub use traits::{NoConfig, Stage, StageContext, StageError, StageErrorKind};
