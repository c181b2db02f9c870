//! Calculation node runtime.
//!
//! - **Connection**: [`CalculationNode`] says Hello, follows Init with a
//!   reload and Ready, and reconnects after a drop
//! - **Execution**: each Execute runs on its own task through a [`JobInvoker`]
//! - **Scaling**: [`InvocationStatistics`] feeds the periodic Scaling report
//! - **Safeguards**: [`ExecutionGuards`] bound each item's run time and skip
//!   functions a [`FunctionBlacklistQuery`] has suppressed
//!
//! # Execution Flow
//!
//! 1. Execute arrives; JobAccepted is queued and the job task spawned
//! 2. Items run in order; an item may query dependent values through its
//!    [`InvocationContext`]
//! 3. The task queues JobResult with one result per item
//! 4. Cancel aborts the task; nothing is reported for it

pub mod blacklist;
pub mod client;
pub mod executor;
pub mod statistics;

pub use blacklist::{
    FailureCountBlacklist, FunctionBlacklistMaintainer, FunctionBlacklistQuery, NoBlacklist,
};
pub use client::CalculationNode;
pub use executor::{
    execute_job, DependencyRequester, ExecutionGuards, InvocationContext, JobInvoker,
    SimulatedInvoker, EXECUTION_TIME_EXCEEDED,
};
pub use statistics::{InvocationStatistics, ScalingReporter};
