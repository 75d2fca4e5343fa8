//! Sandboxed code execution for the test-runner plugin.
//!
//! - [`go_judge`]: job submission to the external sandbox service
//! - [`machine`]: the durable, callback-driven attempt state machine
//! - [`compare`]: expected-vs-actual output rules
//! - [`execution`]: timeout, retry and circuit breaker for service calls

pub mod compare;
pub mod error;
pub mod execution;
pub mod go_judge;
pub mod machine;

pub use compare::OutputComparison;
pub use error::{SandboxError, SandboxResult};
pub use execution::{execute_with_controls, CircuitBreaker, ExecutionControls};
pub use go_judge::{CallbackKind, GoJudgeClient, JudgeResult, JudgeStatus, SandboxClient};
pub use machine::{
    Callback, CallbackDisposition, SandboxMachine, SandboxSettings, SandboxStateRecord, SandboxStep,
    StartAttempt, UnknownCallbackPolicy,
};
