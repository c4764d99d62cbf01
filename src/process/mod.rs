//! Worker process management
//!
//! Workers are separate processes spawned from a [`WorkerSpec`]. The parent
//! side is the [`Supervisor`]; the child side is a [`WorkerContext`].
//!
//! ```text
//!   Receiver process                         Worker process
//! ┌──────────────────┐   stdin  (frames)   ┌──────────────────┐
//! │    Supervisor    │ ──────────────────▶ │  WorkerContext   │
//! │  slots + reaper  │ ◀────────────────── │  PackageWorker   │
//! └──────────────────┘   stdout (frames)   └──────────────────┘
//!          │  SIGUSR1 stop / SIGINT / SIGKILL        ▲
//!          └─────────────────────────────────────────┘
//! ```

pub mod pipe;
pub mod supervisor;
pub mod worker;

pub use supervisor::{ExitCallback, Supervisor, WorkerExit, WorkerHandle, WorkerSpec};
pub use worker::WorkerContext;
