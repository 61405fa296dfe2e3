//! Pipeline configuration types
//!
//! This module defines the declarative pipeline definition: beam parameters,
//! variable aliases, the ordered list of processing steps, and the output
//! table. It is plain data; [`crate::Pipeline::new`] compiles and validates it.

use crate::fitter::FitOptions;
use crate::flatten::TableConfig;
use crate::kinematics::Beam;
use crate::roe::RoeMaskConfig;
use crate::variables::manager::VariablesConfig;
use serde::{Deserialize, Serialize};

/// Configuration for the reconstruction pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Collider beam parameters (defaults to nominal SuperKEKB)
    #[serde(default)]
    pub beam: Beam,

    /// Extra input attributes and variable aliases
    #[serde(default)]
    pub variables: VariablesConfig,

    /// Processing steps, run in order for every event
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Output table
    pub output: TableConfig,
}

/// One processing step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepConfig {
    /// Fill a final-state list from tracks or clusters
    Fill {
        list: String,
        #[serde(default)]
        cut: String,
    },
    /// Fill a final-state list from generated particles
    FillFromMc {
        list: String,
        #[serde(default)]
        cut: String,
    },
    /// Combine daughter lists into a parent list
    Reconstruct {
        decay: String,
        #[serde(default)]
        cut: String,
        /// Also build the charge-conjugate decay into the same list
        #[serde(default)]
        charge_conjugate: bool,
    },
    /// Combine generated lists, keeping exactly matched combinations only
    ReconstructMc {
        decay: String,
        #[serde(default)]
        cut: String,
        #[serde(default)]
        charge_conjugate: bool,
    },
    /// Drop candidates of a list that fail a cut
    Select { list: String, cut: String },
    /// Classify every candidate of a list against the generated reference
    MatchTruth { list: String },
    /// Fit every candidate of a list and drop failed fits
    VertexFit {
        list: String,
        #[serde(default)]
        options: FitOptions,
    },
    /// Attach the rest of event to every candidate of a list
    RestOfEvent {
        list: String,
        #[serde(default)]
        masks: Vec<RoeMaskConfig>,
    },
    /// Compute event-shape features from the rest of event
    ContinuumSuppression {
        list: String,
        #[serde(default)]
        mask: Option<String>,
    },
}

impl StepConfig {
    /// Short human-readable name used in logs and run statistics
    pub fn describe(&self) -> String {
        match self {
            StepConfig::Fill { list, .. } => format!("fill {}", list),
            StepConfig::FillFromMc { list, .. } => format!("fill_from_mc {}", list),
            StepConfig::Reconstruct { decay, charge_conjugate, .. } => {
                format!("reconstruct {}{}", decay, cc_suffix(*charge_conjugate))
            }
            StepConfig::ReconstructMc { decay, charge_conjugate, .. } => {
                format!("reconstruct_mc {}{}", decay, cc_suffix(*charge_conjugate))
            }
            StepConfig::Select { list, .. } => format!("select {}", list),
            StepConfig::MatchTruth { list } => format!("match_truth {}", list),
            StepConfig::VertexFit { list, .. } => format!("vertex_fit {}", list),
            StepConfig::RestOfEvent { list, .. } => format!("rest_of_event {}", list),
            StepConfig::ContinuumSuppression { list, .. } => {
                format!("continuum_suppression {}", list)
            }
        }
    }
}

fn cc_suffix(charge_conjugate: bool) -> &'static str {
    if charge_conjugate {
        " + c.c."
    } else {
        ""
    }
}

impl PipelineConfig {
    /// Create a configuration writing the given table, with no steps yet
    pub fn new(output: TableConfig) -> Self {
        Self {
            beam: Beam::default(),
            variables: VariablesConfig::default(),
            steps: Vec::new(),
            output,
        }
    }

    /// Builder method: set the beam
    pub fn with_beam(mut self, beam: Beam) -> Self {
        self.beam = beam;
        self
    }

    /// Builder method: add a variable alias
    pub fn with_alias(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.variables.aliases.insert(alias.into(), target.into());
        self
    }

    /// Builder method: declare an extra input attribute
    pub fn with_attribute(mut self, name: impl Into<String>) -> Self {
        self.variables.attributes.push(name.into());
        self
    }

    /// Builder method: append a step
    pub fn with_step(mut self, step: StepConfig) -> Self {
        self.steps.push(step);
        self
    }

    /// Builder method: fill a list from detector objects
    pub fn fill(self, list: &str, cut: &str) -> Self {
        self.with_step(StepConfig::Fill { list: list.to_string(), cut: cut.to_string() })
    }

    /// Builder method: fill a list from generated particles
    pub fn fill_from_mc(self, list: &str, cut: &str) -> Self {
        self.with_step(StepConfig::FillFromMc { list: list.to_string(), cut: cut.to_string() })
    }

    /// Builder method: reconstruct a decay
    pub fn reconstruct(self, decay: &str, cut: &str) -> Self {
        self.with_step(StepConfig::Reconstruct {
            decay: decay.to_string(),
            cut: cut.to_string(),
            charge_conjugate: false,
        })
    }

    /// Builder method: reconstruct a decay and its charge conjugate into one list
    pub fn reconstruct_cc(self, decay: &str, cut: &str) -> Self {
        self.with_step(StepConfig::Reconstruct {
            decay: decay.to_string(),
            cut: cut.to_string(),
            charge_conjugate: true,
        })
    }

    /// Builder method: reconstruct a decay from generated lists
    pub fn reconstruct_mc(self, decay: &str, cut: &str) -> Self {
        self.with_step(StepConfig::ReconstructMc {
            decay: decay.to_string(),
            cut: cut.to_string(),
            charge_conjugate: false,
        })
    }

    /// Builder method: truth-match a list
    pub fn match_truth(self, list: &str) -> Self {
        self.with_step(StepConfig::MatchTruth { list: list.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_builder() {
        let config = PipelineConfig::new(TableConfig::new("D+"))
            .with_beam(Beam::symmetric(5.29))
            .with_alias("D_M", "M")
            .fill("pi+", "pionID > 0.3")
            .fill("K-", "")
            .reconstruct("D+ -> K- pi+ pi+", "1.83965 < M < 1.89965")
            .match_truth("D+")
            .reconstruct_cc("B-:ch1 -> D+ pi- pi-", "");

        assert_eq!(config.steps.len(), 5);
        assert_eq!(config.variables.aliases["D_M"], "M");
        assert_eq!(config.steps[2].describe(), "reconstruct D+ -> K- pi+ pi+");
        assert_eq!(config.steps[4].describe(), "reconstruct B-:ch1 -> D+ pi- pi- + c.c.");
        assert_eq!(config.beam.crossing_angle, 0.0);
    }

    #[test]
    fn test_step_deserialization() {
        let json = r#"[
            {"kind": "fill", "list": "pi+", "cut": "pionID > 0.3"},
            {"kind": "reconstruct_mc", "decay": "D+ -> K- pi+ pi+", "charge_conjugate": true},
            {"kind": "vertex_fit", "list": "D+", "options": {"min_confidence": 0.001, "tree_fit": true}},
            {"kind": "rest_of_event", "list": "D+", "masks": [{"name": "clean", "track_cut": "p > 0.1"}]},
            {"kind": "continuum_suppression", "list": "D+", "mask": "clean"}
        ]"#;
        let steps: Vec<StepConfig> = serde_json::from_str(json).unwrap();
        assert_eq!(
            steps[1],
            StepConfig::ReconstructMc {
                decay: "D+ -> K- pi+ pi+".to_string(),
                cut: String::new(),
                charge_conjugate: true,
            }
        );
        match &steps[2] {
            StepConfig::VertexFit { options, .. } => {
                assert_eq!(options.min_confidence, Some(0.001));
                assert!(options.tree_fit);
                assert_eq!(options.mass_resolution, 0.005);
            }
            other => panic!("unexpected step {:?}", other),
        }
        match &steps[3] {
            StepConfig::RestOfEvent { masks, .. } => assert_eq!(masks[0].cluster_cut, ""),
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let json = r#"{"output": {"list": "B-:ch1"}}"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.beam, Beam::default());
        assert_eq!(config.output.name, "tree");
        assert!(config.steps.is_empty());
    }
}
