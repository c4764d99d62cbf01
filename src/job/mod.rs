//! Job roles
//!
//! Rank 0 runs the [`Distributor`]; every other rank runs a [`Receiver`]
//! that feeds its local workers, each of which runs a [`PackageWorker`].
//! [`runtime`] wires the roles to transports, processes and signals.

pub mod checkpoint;
pub mod distributor;
pub mod package_worker;
pub mod pool;
pub mod receiver;
pub mod runtime;

pub use checkpoint::Checkpoint;
pub use distributor::{DistributionStats, DistributionSummary, Distributor};
pub use package_worker::PackageWorker;
pub use pool::{SupervisedPool, WorkerPool};
pub use receiver::{Receiver, ReceiverOutcome};
