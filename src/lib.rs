//! Parallel file system client I/O engine
//!
//! Re-exports the workspace crates under one name.
//!
//! # Key Components
//!
//! - [`dist`]: striping strategies mapping logical offsets to targets
//! - [`request`]: request trees and the resumable segment walker
//! - [`orch`]: fan-out orchestration of one call across targets
//! - [`config`]: configuration loading, validation and logging setup

pub use pario_config as config;
pub use pario_dist as dist;
pub use pario_orch as orch;
pub use pario_request as request;

pub use pario_config::{ConfigLoader, IoConfig, ParioConfig, init_logging};
pub use pario_dist::{Distribution, DistributionSpec, DistributionView};
pub use pario_orch::{FileLayout, IoMode, IoOutcome, LoopbackFabric, Orchestrator};
pub use pario_request::{Request, RequestTree, RequestWalker, TraversalState};
