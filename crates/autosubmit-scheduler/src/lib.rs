//! `autosubmit-scheduler`: leased, crash-safe dispatch of time-triggered jobs.
//!
//! # Overview
//!
//! Jobs live in a single SQLite `jobs` table ([`store::JobStore`]). Three
//! stateless components move them through their lifecycle, coordinating only
//! through conditional single-row updates, so any number of replicas may run
//! against the same database:
//!
//! | Component                     | Transition                                 |
//! |-------------------------------|--------------------------------------------|
//! | [`claim::ClaimEngine`]        | `pending → claimed` (fresh token + lease)  |
//! | [`dispatch::Dispatcher`]      | `claimed → completed \| pending \| failed` |
//! | [`reconcile::Reconciler`]     | expired `claimed → pending \| failed`      |
//!
//! [`worker::DispatchWorker`] and [`worker::ReconcileWorker`] drive them on
//! independent cadences.
//!
//! Delivery to the [`executor::Executor`] is at-least-once: a crash between a
//! successful execution and the status write replays the job once its lease
//! expires. The claim token is passed along so executors can deduplicate.

pub mod claim;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod reconcile;
pub mod store;
pub mod types;
pub mod worker;

pub use claim::ClaimEngine;
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::{Result, SchedulerError};
pub use executor::{ExecutionReport, ExecutionRequest, Executor, ExecutorError, HttpExecutor};
pub use reconcile::{ReconcileReport, Reconciler};
pub use store::{JobStore, OwnerJobs};
pub use types::{Job, JobStatus, StatusCounts, Transition};
pub use worker::{DispatchWorker, ReconcileWorker, TickSummary};
