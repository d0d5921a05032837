//! Execution engine: kernel, controllers, and the services they share.
//!
//! - `kernel` -- running-execution registry, start/restart/stop, sub-job builders
//! - `operator` -- authorization-scoped operator API over the kernel
//! - `job` / `flow` / `decision` / `split` -- navigation of the element graph
//! - `step` -- per-step state machine
//! - `chunk` / `checkpoint` -- read/process/write loop and its commit boundaries
//! - `partition` -- partition fan-out and the coordinator hand-off channel
//! - `pool`, `security`, `callback`, `loader`, `services` -- injected collaborators

pub mod callback;
pub mod checkpoint;
mod chunk;
pub mod context;
mod decision;
mod flow;
pub mod handle;
pub mod job;
pub mod kernel;
pub mod loader;
pub mod operator;
mod partition;
pub mod pool;
pub mod security;
pub mod services;
mod split;
mod step;
pub mod transition;

pub use callback::{JobEndCallback, JobEndCallbacks};
pub use context::{InjectionContext, JobContext, StepContext};
pub use handle::JobExecutionHandle;
pub use kernel::BatchKernel;
pub use loader::{InMemoryJobLoader, JobLoader};
pub use operator::JobOperator;
pub use pool::{BatchThreadPool, TokioThreadPool};
pub use security::{ConfiguredSecurity, SecurityService};
pub use services::ServiceContext;
