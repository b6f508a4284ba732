//! The purpose of this module is to alleviate the need to import many of the `[chronos]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use chronos::prelude::*;
//! ```
pub use crate::admin::Admin;
pub use crate::backend::{Backend, Statistics, StoreError};
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::config::EngineConfig;
pub use crate::execution_log::{ExecutionLogEntry, LogLevel};
pub use crate::executor::{ExecutionContext, ExecutionError, ExecutionResult, Executor};
pub use crate::job::builder::{JobDescriptor, JobUpdate, ValidationError};
pub use crate::job::query::{JobFilter, JobQuery, Page, Pagination, Sort, SortDirection, SortField};
pub use crate::job::{Job, JobId, JobStatus, JobType, Priority};
pub use crate::notifier::{BroadcastNotifier, JobEvent, Notifier, TracingNotifier};
pub use crate::retry::RetryPolicy;
pub use crate::sweeper::{Sweep, SweeperConfig};
pub use crate::{Chronos, ChronosError, JobDetails};
