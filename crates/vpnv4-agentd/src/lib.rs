//! VPNv4 export agent
//!
//! Exposes per-namespace prefixes to an external BGP/MPLS VPN fabric: every
//! tenant gets a deterministic RD/RT pair, a kernel VRF and a stanza in the
//! routing daemon configuration, and routes learned back from the fabric are
//! handed to the network controller.

pub mod allocator;
pub mod applier;
pub mod commands;
pub mod config;
pub mod engine;
pub mod importer;
pub mod render;
pub mod source;
pub mod store;
pub mod types;

pub use allocator::{allocate, Allocation, AllocationTable, AllocatorSettings};
pub use applier::{DaemonOps, FrrDaemon, IpKernel, KernelOps};
pub use config::AgentConfig;
pub use engine::{AppliedView, CycleReport, CycleState, Engine, EngineSettings};
pub use importer::{JsonFileController, LoggingController, NetworkController, RouteImporter};
pub use render::{render, RenderSettings, Rendered};
pub use source::{spawn_source, ChangeSource};
pub use store::{Snapshot, TenantStore};
pub use types::*;
