//! Supervision of per-user bridge workers.
//!
//! A [`Supervisor`] turns a user's record into a running worker process:
//! it materializes the worker's capability config, launches the process,
//! keeps exactly one live instance per user and mirrors the outcome into the
//! record's `status`/`pid`. The [`ExitReconciler`] runs next to it and
//! reconciles workers that terminate on their own.
//!
//! ```ignore
//! let supervisor = Supervisor::spawn(store, Arc::new(HostEnvironment::new()),
//!     Materializer::default(), ConfigArtifacts::new(state_dir.join("configs")),
//!     SupervisorSettings::default());
//! let pid = supervisor.start("u1").await?;
//! supervisor.stop("u1").await?;
//! ```

pub mod environment;
pub mod error;
pub mod materialize;
mod projector;
pub mod reconciler;
mod registry;
pub mod store;
pub mod supervisor;

pub use environment::{
    ExitOutcome, HostEnvironment, LaunchCommand, ProcessEnvironment, SpawnedWorker, StopSignal,
};
pub use error::{StoreError, SupervisorError};
pub use materialize::{
    CapabilityCatalog, CapabilityDescriptor, CapabilitySource, ConfigArtifacts,
    GeneratedWorkerConfig, Materializer,
};
pub use reconciler::{ExitNotice, ExitReconciler};
pub use store::{JsonFileStore, MemoryStore, RecordStore};
pub use supervisor::{Supervisor, SupervisorSettings, WorkerLaunch};
