//! biodist - Distributed Record Processing with Supervised Workers
//!
//! Splits a large record store into work packages and spreads them over
//! many nodes, each running a pool of worker processes. Built for long
//! batch jobs that must survive interruption.
//!
//! # Features
//!
//! - **Pull-based distribution**: Receivers only ask for a package once a
//!   local worker is idle, so no work sits queued on a busy node.
//!
//! - **Process supervision**: Workers are separate processes with their
//!   own state. A crashed worker is reaped and excluded without taking its
//!   node down.
//!
//! - **Checkpoint/resume**: The distributor records the last distributed
//!   key after every package and resumes right after it.
//!
//! - **Escalating shutdown**: SIGINT finishes in-flight work, SIGQUIT
//!   interrupts workers, SIGTERM kills them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Distributor (rank 0)                          │
//! │   Record store cursor ──► Work packages ──► Distributor.chk      │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ Control / Data / Out-of-band
//!              ┌────────────────┼────────────────┐
//!              ▼                ▼                ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │ Receiver rank 1  │ │ Receiver rank 2  │ │ Receiver rank N  │
//! │   Supervisor     │ │   Supervisor     │ │   Supervisor     │
//! └──┬─────┬─────┬───┘ └──┬─────┬─────┬───┘ └──┬─────┬─────┬───┘
//!    │     │     │ pipes  │     │     │        │     │     │
//!    ▼     ▼     ▼        ▼     ▼     ▼        ▼     ▼     ▼
//!  ┌───┐ ┌───┐ ┌───┐    ┌───┐ ┌───┐ ┌───┐    ┌───┐ ┌───┐ ┌───┐
//!  │ W │ │ W │ │ W │    │ W │ │ W │ │ W │    │ W │ │ W │ │ W │
//!  └───┘ └───┘ └───┘    └───┘ └───┘ └───┘    └───┘ └───┘ └───┘
//!        Worker processes running a WorkPackageProcessor
//! ```
//!
//! # Example
//!
//! ```bash
//! # Whole job on one machine, two receivers
//! biodist run -P job.properties --receivers 2 -o out/ -p
//!
//! # Across machines
//! biodist distribute -P job.properties --receivers 4 --checkpoint
//! biodist receive -P job.properties --connect head-node:7466 -o out/
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod logsheet;
pub mod package;
pub mod process;
pub mod processor;
pub mod progress;
pub mod properties;
pub mod protocol;
pub mod signals;
pub mod store;
pub mod transport;

pub use config::{CliArgs, Resources, WorkersPerNode};
pub use error::{DistError, Result};
pub use job::{Distributor, Receiver};
pub use package::WorkPackage;
pub use protocol::{TaskCommand, TaskStatus};
