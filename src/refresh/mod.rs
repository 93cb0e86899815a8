//! The refresh pipeline.
//!
//! Scheduler → RefreshOrchestrator → FreshnessGate → Fetcher, then per table
//! SchemaIntrospector → ShadowLoader → Swapper. Each production table is
//! only ever replaced by a fully loaded and indexed shadow, in one rename.

pub mod artifact;
pub mod fetcher;
pub mod freshness;
pub mod introspect;
pub mod loader;
pub mod orchestrator;
pub mod scheduler;
pub mod swapper;

pub use artifact::SourceArtifact;
pub use fetcher::{Fetcher, HttpTransport, Transport};
pub use freshness::{needs_download, ArtifactState, FreshnessGate, FreshnessReport};
pub use introspect::{SchemaIntrospector, TableShape};
pub use loader::{LoadOutcome, ShadowLoader, ShadowState};
pub use orchestrator::{CycleReport, RefreshOrchestrator};
pub use scheduler::Scheduler;
pub use swapper::{plan_swap, Swapper};
