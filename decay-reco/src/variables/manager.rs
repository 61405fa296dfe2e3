//! Standard variable provider
//!
//! Resolves names (built-ins, input attributes, aliases) into [`Variable`]s and
//! evaluates them against candidates of an [`Event`], memoizing results on the
//! candidate.

use super::{Kinematic, Shape, Truth, Variable};
use crate::event::Event;
use crate::kinematics::LorentzVector;
use crate::particles;
use crate::types::{CandidateId, MatchClass, PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Input attributes every track or cluster may carry
pub const DEFAULT_ATTRIBUTES: [&str; 9] = [
    "pionID",
    "kaonID",
    "protonID",
    "electronID",
    "muonID",
    "deuteronID",
    "nCDCHits",
    "thetaInCDCAcceptance",
    "clusterE9E21",
];

/// Maximum alias nesting depth before a cycle is assumed
const MAX_ALIAS_DEPTH: usize = 16;

/// Resolves variable names and evaluates variables on candidates
///
/// Resolution happens at configuration load and is the only place an unknown
/// name is reported. Evaluation is pure apart from memoization and returns NaN
/// for values that are undefined for a candidate.
pub trait VariableProvider: Send + Sync {
    /// Compile a variable name
    fn resolve(&self, name: &str) -> Result<Variable>;

    /// Evaluate a compiled variable on a candidate
    fn value(&self, event: &Event, id: CandidateId, variable: &Variable) -> f64;

    /// Resolve and evaluate in one step
    fn value_of(&self, event: &Event, id: CandidateId, name: &str) -> Result<f64> {
        let variable = self.resolve(name)?;
        Ok(self.value(event, id, &variable))
    }
}

/// Variable configuration: declared input attributes and aliases
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariablesConfig {
    /// Input attributes in addition to [`DEFAULT_ATTRIBUTES`]
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Alias name → variable name
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

/// The standard variable catalogue
#[derive(Debug, Clone)]
pub struct VariableManager {
    attributes: BTreeSet<String>,
    aliases: BTreeMap<String, String>,
}

impl Default for VariableManager {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableManager {
    /// Create a manager knowing the default input attributes and no aliases
    pub fn new() -> Self {
        Self {
            attributes: DEFAULT_ATTRIBUTES.iter().map(|s| s.to_string()).collect(),
            aliases: BTreeMap::new(),
        }
    }

    /// Create a manager from configuration, validating every alias
    pub fn from_config(config: &VariablesConfig) -> Result<Self> {
        let mut manager = Self::new();
        for attribute in &config.attributes {
            manager = manager.with_attribute(attribute.clone());
        }
        for (alias, target) in &config.aliases {
            manager = manager.with_alias(alias.clone(), target.clone())?;
        }
        Ok(manager)
    }

    /// Builder method: declare an input attribute
    pub fn with_attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes.insert(name.into());
        self
    }

    /// Builder method: add an alias; the target must resolve
    pub fn with_alias(mut self, alias: impl Into<String>, target: impl Into<String>) -> Result<Self> {
        let alias = alias.into();
        let target = target.into();
        if Variable::parse(&alias, &|_: &str| Err(PipelineError::UnknownVariable(String::new()))).is_ok()
            || self.attributes.contains(&alias)
        {
            return Err(PipelineError::InvalidConfig(format!(
                "alias '{}' shadows an existing variable",
                alias
            )));
        }
        self.aliases.insert(alias.clone(), target);
        self.resolve_depth(&alias, 0)?;
        Ok(self)
    }

    fn resolve_depth(&self, name: &str, depth: usize) -> Result<Variable> {
        if depth > MAX_ALIAS_DEPTH {
            return Err(PipelineError::InvalidConfig(format!(
                "alias '{}' nests too deeply or is cyclic",
                name
            )));
        }
        Variable::parse(name, &|other: &str| {
            if let Some(target) = self.aliases.get(other) {
                self.resolve_depth(target, depth + 1)
            } else if self.attributes.contains(other) {
                Ok(Variable::Attribute(other.to_string()))
            } else {
                Err(PipelineError::UnknownVariable(other.to_string()))
            }
        })
    }

    fn compute(&self, event: &Event, id: CandidateId, variable: &Variable) -> f64 {
        let candidate = event.store.candidate(id);
        match variable {
            Variable::Kinematic(k) => kinematic(candidate.p4(), *k),
            Variable::Cms(inner) => match inner.as_ref() {
                Variable::Kinematic(k) => kinematic(&event.beam.to_cms(candidate.p4()), *k),
                Variable::Daughter(index, nested) => match candidate.daughters().get(*index) {
                    Some(daughter) => {
                        self.value(event, *daughter, &Variable::Cms(nested.clone()))
                    }
                    None => f64::NAN,
                },
                other => self.value(event, id, other),
            },
            Variable::Daughter(index, inner) => match candidate.daughters().get(*index) {
                Some(daughter) => self.value(event, *daughter, inner),
                None => f64::NAN,
            },
            Variable::Charge => candidate.charge() as f64,
            Variable::Pdg => candidate.pdg() as f64,
            Variable::NDaughters => candidate.daughters().len() as f64,
            Variable::Mbc => {
                let cms = event.beam.to_cms(candidate.p4());
                let e_beam = event.beam.cms_beam_energy();
                (e_beam * e_beam - cms.momentum().norm_squared()).max(0.0).sqrt()
            }
            Variable::DeltaE => event.beam.to_cms(candidate.p4()).e - event.beam.cms_beam_energy(),
            Variable::X => candidate.position().map_or(f64::NAN, |p| p.x),
            Variable::Y => candidate.position().map_or(f64::NAN, |p| p.y),
            Variable::Z | Variable::Dz => candidate.position().map_or(f64::NAN, |p| p.z),
            Variable::Dr => candidate.position().map_or(f64::NAN, |p| p.x.hypot(p.y)),
            Variable::ChiProb => candidate.vertex().map_or(f64::NAN, |v| v.p_value),
            Variable::Truth(t) => self.truth(event, id, *t),
            Variable::IsContinuumEvent => {
                if event.is_simulated() {
                    let has_b = event.mc.iter().any(|(_, p)| particles::is_b_meson(p.pdg));
                    if has_b {
                        0.0
                    } else {
                        1.0
                    }
                } else {
                    f64::NAN
                }
            }
            Variable::Shape(shape) => {
                let Some(features) = candidate.continuum() else {
                    return f64::NAN;
                };
                match shape {
                    Shape::R2 => features.r2,
                    Shape::ThrustBm => features.thrust_bm,
                    Shape::ThrustOm => features.thrust_om,
                    Shape::CosTbto => features.cos_tbto,
                    Shape::CosTbz => features.cos_tbz,
                    Shape::CleoCone(i) => features.cleo_cones[(*i as usize) - 1],
                    Shape::Ksfw(name) => features.ksfw.get(name).copied().unwrap_or(f64::NAN),
                }
            }
            Variable::RoeNTracks => candidate
                .rest_of_event()
                .map_or(f64::NAN, |roe| roe.tracks.len() as f64),
            Variable::RoeNClusters => candidate
                .rest_of_event()
                .map_or(f64::NAN, |roe| roe.clusters.len() as f64),
            Variable::RoeE | Variable::RoeM => match candidate.rest_of_event() {
                Some(roe) => {
                    let total: LorentzVector =
                        roe.iter().map(|o| *event.store.candidate(o).p4()).sum();
                    if matches!(variable, Variable::RoeE) {
                        total.e
                    } else {
                        total.mass()
                    }
                }
                None => f64::NAN,
            },
            Variable::Attribute(name) => candidate.attribute(name).unwrap_or(f64::NAN),
        }
    }

    fn truth(&self, event: &Event, id: CandidateId, quantity: Truth) -> f64 {
        let Some(truth) = event.store.candidate(id).truth() else {
            return f64::NAN;
        };
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        let mc = truth.mc_index.and_then(|i| event.mc.get(i));
        match quantity {
            Truth::IsSignal => flag(truth.class == MatchClass::Exact),
            Truth::IsSignalAcceptMissing => flag(matches!(
                truth.class,
                MatchClass::Exact | MatchClass::MissingDaughters
            )),
            Truth::McErrors => truth.flags as f64,
            Truth::McPdg => mc.map_or(f64::NAN, |p| p.pdg as f64),
            Truth::GenMotherPdg => truth
                .mc_index
                .and_then(|i| event.mc.mother(i))
                .and_then(|m| event.mc.get(m))
                .map_or(f64::NAN, |p| p.pdg as f64),
            Truth::McE => mc.map_or(f64::NAN, |p| p.p4().e),
            Truth::McP => mc.map_or(f64::NAN, |p| p.p4().p()),
            Truth::McPx => mc.map_or(f64::NAN, |p| p.momentum[0]),
            Truth::McPy => mc.map_or(f64::NAN, |p| p.momentum[1]),
            Truth::McPz => mc.map_or(f64::NAN, |p| p.momentum[2]),
            Truth::McPt => mc.map_or(f64::NAN, |p| p.p4().pt()),
        }
    }
}

fn kinematic(p4: &LorentzVector, k: Kinematic) -> f64 {
    match k {
        Kinematic::Px => p4.px,
        Kinematic::Py => p4.py,
        Kinematic::Pz => p4.pz,
        Kinematic::P => p4.p(),
        Kinematic::Pt => p4.pt(),
        Kinematic::E => p4.e,
        Kinematic::M => p4.mass(),
        Kinematic::M2 => p4.m2(),
        Kinematic::CosTheta => p4.cos_theta(),
        Kinematic::Phi => p4.phi(),
    }
}

impl VariableProvider for VariableManager {
    fn resolve(&self, name: &str) -> Result<Variable> {
        self.resolve_depth(name, 0)
    }

    fn value(&self, event: &Event, id: CandidateId, variable: &Variable) -> f64 {
        // Daughter lookups are memoized on the daughter itself
        if let Variable::Daughter(..) = variable {
            return self.compute(event, id, variable);
        }
        let key = variable.to_string();
        if let Some(v) = event.store.candidate(id).cached(&key) {
            return v;
        }
        let v = self.compute(event, id, variable);
        event.store.candidate(id).memoize(key, v);
        v
    }
}
