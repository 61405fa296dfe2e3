//! Decay Reconstruction Library
//!
//! A stateless, reusable library that turns per-event particle-collision
//! records into a flat table of physics observables for one decay hypothesis.
//!
//! # Architecture
//!
//! The library compiles a declarative pipeline once and then runs it on every
//! event independently:
//! - Fills final-state candidate lists from tracks, clusters or generated particles
//! - Assembles composite candidates level by level (`D+ -> K- pi+ pi+`)
//! - Classifies candidates against the generated reference (truth matching)
//! - Fits decay vertices, with optional mass constraint
//! - Builds the rest of event and continuum-suppression variables
//! - Flattens every surviving top-level candidate into one output row
//!
//! The library does NOT:
//! - Read or write files (beyond the serde input record)
//! - Generate or simulate events
//! - Fit physics distributions
//!
//! File handling, parallel execution and reports are in the application layer
//! (decay-reco-cli).
//!
//! # Example Usage
//!
//! ```no_run
//! use decay_reco::{EventRecord, MemorySink, Pipeline, PipelineConfig, TableConfig};
//!
//! let table = TableConfig::new("B-:ch1")
//!     .with_descriptor("^B-:ch1 -> ^D+ ^pi- ^pi-", &["B1", "Dplus", "pim11", "pim12"])
//!     .with_role_variables(&["M", "@kinematics"])
//!     .with_variables(&["Mbc", "deltaE", "isSignal"]);
//!
//! let config = PipelineConfig::new(table)
//!     .fill("pi+", "pionID > 0.3")
//!     .fill("pi-", "pionID > 0.3")
//!     .fill("K-", "kaonID > 0.6")
//!     .reconstruct("D+ -> K- pi+ pi+", "1.83965 < M < 1.89965")
//!     .reconstruct("B-:ch1 -> D+ pi- pi-", "Mbc > 5.24 and abs(deltaE) < 0.25")
//!     .match_truth("B-:ch1");
//!
//! let pipeline = Pipeline::new(&config).unwrap();
//! let events: Vec<EventRecord> = Vec::new();
//! let mut sink = MemorySink::new();
//! let stats = pipeline.run(events, &mut sink).unwrap();
//! println!("{} rows from {} events", stats.rows, stats.events);
//! ```

// Public modules
pub mod assembler;
pub mod config;
pub mod continuum;
pub mod cut;
pub mod descriptor;
pub mod event;
pub mod filler;
pub mod fitter;
pub mod flatten;
pub mod kinematics;
pub mod output;
pub mod particles;
pub mod pipeline;
pub mod roe;
pub mod store;
pub mod truth;
pub mod types;
pub mod variables;

// Re-export main types for convenience
pub use config::{PipelineConfig, StepConfig};
pub use event::{ClusterRecord, Event, EventRecord, McParticle, TrackRecord};
pub use fitter::FitOptions;
pub use flatten::{OutputRow, RoleConfig, TableConfig, Tabulator};
pub use kinematics::{Beam, LorentzVector};
pub use output::{MemorySink, RowSink};
pub use pipeline::{EventOutput, Pipeline, RunStatistics, StepStatistics};
pub use roe::RoeMaskConfig;
pub use types::{Candidate, CandidateId, MatchClass, PipelineError, Result};
pub use variables::{VariableManager, VariableProvider, VariablesConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: an empty pipeline over a list nobody fills is rejected
        let config = PipelineConfig::new(TableConfig::new("pi+"));
        assert!(matches!(Pipeline::new(&config), Err(PipelineError::UnknownList(_))));
        assert!(!VERSION.is_empty());
    }
}
