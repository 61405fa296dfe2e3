//! Vertex and kinematic fitting
//!
//! The common vertex of a candidate's daughters is found by a weighted
//! least-squares fit of straight-line trajectories: each constraining daughter
//! contributes the line through its position along its momentum. Minimising the
//! summed squared perpendicular distances has a closed-form 3×3 solution.
//!
//! A failed fit never removes anything: the candidate is marked `Failed` and the
//! caller decides what to do with it.

use crate::event::Event;
use crate::kinematics::LorentzVector;
use crate::particles;
use crate::types::{CandidateId, FitStatus, Result, VertexFit};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::fmt;

/// Variance floor so a zero position error cannot produce an infinite weight
const MIN_VARIANCE: f64 = 1e-12;

/// Options for one fit step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitOptions {
    /// Fits with a p-value below this are failures; `None` accepts any converged fit
    #[serde(default)]
    pub min_confidence: Option<f64>,

    /// Constrain the invariant mass
    #[serde(default)]
    pub mass_constraint: bool,

    /// Constraint target; the nominal species mass when absent
    #[serde(default)]
    pub mass: Option<f64>,

    /// Resolution of the mass constraint term in GeV
    #[serde(default = "default_mass_resolution")]
    pub mass_resolution: f64,

    /// Fit composite daughters first, bottom-up
    #[serde(default)]
    pub tree_fit: bool,

    /// Give the candidate copies of its daughters placed at the fitted vertex
    #[serde(default)]
    pub update_daughters: bool,
}

fn default_mass_resolution() -> f64 {
    0.005
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            min_confidence: None,
            mass_constraint: false,
            mass: None,
            mass_resolution: default_mass_resolution(),
            tree_fit: false,
            update_daughters: false,
        }
    }
}

impl FitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: require a minimum p-value
    pub fn with_min_confidence(mut self, p: f64) -> Self {
        self.min_confidence = Some(p);
        self
    }

    /// Builder method: constrain the mass to `mass`, or the nominal mass if `None`
    pub fn with_mass_constraint(mut self, mass: Option<f64>) -> Self {
        self.mass_constraint = true;
        self.mass = mass;
        self
    }

    /// Builder method: fit composite daughters first
    pub fn with_tree_fit(mut self, enabled: bool) -> Self {
        self.tree_fit = enabled;
        self
    }

    /// Builder method: propagate the vertex to the daughters
    pub fn with_daughter_update(mut self, enabled: bool) -> Self {
        self.update_daughters = enabled;
        self
    }
}

/// Why a fit failed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FitFailure {
    /// Fewer than two daughters with a trajectory
    TooFewTracks(usize),
    /// The normal equations have no unique solution (parallel trajectories)
    Singular,
    /// p-value below the configured minimum
    LowConfidence(f64),
    /// A daughter failed in a tree fit
    DaughterFailed,
}

impl fmt::Display for FitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitFailure::TooFewTracks(n) => write!(f, "{} constraining daughters", n),
            FitFailure::Singular => write!(f, "singular system"),
            FitFailure::LowConfidence(p) => write!(f, "p-value {:.3e} below minimum", p),
            FitFailure::DaughterFailed => write!(f, "daughter fit failed"),
        }
    }
}

/// Result of fitting one candidate
#[derive(Debug, Clone, PartialEq)]
pub enum FitOutcome {
    Converged { chi2: f64, p_value: f64 },
    Failed(FitFailure),
}

impl FitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FitOutcome::Converged { .. })
    }
}

/// Converged and failed counts from fitting one list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FitSummary {
    pub converged: usize,
    pub failed: usize,
}

/// A trajectory constraint: line through `point` along unit `direction`
struct Line {
    point: Vector3<f64>,
    direction: Vector3<f64>,
    weight: f64,
}

impl Line {
    fn projector(&self) -> Matrix3<f64> {
        Matrix3::identity() - self.direction * self.direction.transpose()
    }
}

/// Fit one candidate, updating it in place
pub fn fit(event: &mut Event, id: CandidateId, options: &FitOptions) -> FitOutcome {
    let outcome = fit_inner(event, id, options);
    match &outcome {
        FitOutcome::Converged { chi2, p_value } => {
            log::trace!("Fit {}: chi2 {:.3}, p {:.3e}", id, chi2, p_value)
        }
        FitOutcome::Failed(reason) => log::trace!("Fit {} failed: {}", id, reason),
    }
    outcome
}

fn fit_inner(event: &mut Event, id: CandidateId, options: &FitOptions) -> FitOutcome {
    let daughters = event.store.candidate(id).daughters().to_vec();

    if options.tree_fit {
        // An explicit target belongs to the head; daughters use their nominal mass
        let daughter_options = FitOptions { mass: None, ..options.clone() };
        for daughter in &daughters {
            let candidate = event.store.candidate(*daughter);
            if candidate.is_final_state() {
                continue;
            }
            let ok = match candidate.fit_status() {
                FitStatus::Converged => true,
                FitStatus::Failed => false,
                FitStatus::NotFitted => fit(event, *daughter, &daughter_options).is_success(),
            };
            if !ok {
                return fail(event, id, FitFailure::DaughterFailed);
            }
        }
    }

    let lines: Vec<Line> = daughters
        .iter()
        .filter_map(|d| {
            let daughter = event.store.candidate(*d);
            let point = daughter.position()?;
            let momentum = daughter.p4().momentum();
            let norm = momentum.norm();
            if norm == 0.0 {
                return None;
            }
            let variance = daughter
                .vertex()
                .map_or(daughter.position_variance, |v| v.variance)
                .max(MIN_VARIANCE);
            Some(Line { point, direction: momentum / norm, weight: 1.0 / variance })
        })
        .collect();

    if lines.len() < 2 {
        return fail(event, id, FitFailure::TooFewTracks(lines.len()));
    }

    let mut a = Matrix3::zeros();
    let mut b = Vector3::zeros();
    for line in &lines {
        let projector = line.projector() * line.weight;
        a += projector;
        b += projector * line.point;
    }
    let Some(covariance) = a.try_inverse() else {
        return fail(event, id, FitFailure::Singular);
    };
    let vertex = covariance * b;

    let mut chi2: f64 = lines
        .iter()
        .map(|l| l.weight * (l.projector() * (vertex - l.point)).norm_squared())
        .sum();
    let mut ndf = 2 * lines.len() as u32 - 3;

    let mut p4 = *event.store.candidate(id).p4();
    if options.mass_constraint {
        let target = options
            .mass
            .or_else(|| particles::by_pdg(event.store.candidate(id).pdg()).map(|s| s.mass))
            .unwrap_or_else(|| p4.mass());
        let pull = (p4.mass() - target) / options.mass_resolution;
        chi2 += pull * pull;
        ndf += 1;
        p4 = LorentzVector::from_momentum_mass(p4.momentum(), target);
    }

    let p_value = match ChiSquared::new(ndf as f64) {
        Ok(dist) => dist.sf(chi2),
        Err(_) => 0.0,
    };
    if let Some(min) = options.min_confidence {
        if p_value < min {
            return fail(event, id, FitFailure::LowConfidence(p_value));
        }
    }

    let result = VertexFit {
        position: vertex,
        chi2,
        ndf,
        p_value,
        variance: covariance.trace() / 3.0,
    };
    let candidate = event.store.candidate_mut(id);
    candidate.set_fit(FitStatus::Converged, Some(result));
    if options.mass_constraint {
        candidate.set_p4(p4);
    }

    if options.update_daughters {
        // Daughters can be shared with other candidates: move private copies
        let copies: Vec<CandidateId> = daughters
            .iter()
            .map(|daughter| {
                let copy = event.store.duplicate(*daughter);
                event.store.candidate_mut(copy).set_position(vertex);
                copy
            })
            .collect();
        event.store.candidate_mut(id).set_daughters(copies);
    }

    FitOutcome::Converged { chi2, p_value }
}

fn fail(event: &mut Event, id: CandidateId, reason: FitFailure) -> FitOutcome {
    event.store.candidate_mut(id).set_fit(FitStatus::Failed, None);
    FitOutcome::Failed(reason)
}

/// Fit every candidate of a list; failures are marked, not removed
pub fn fit_list(event: &mut Event, label: &str, options: &FitOptions) -> Result<FitSummary> {
    let ids = event.store.get(label)?.to_vec();
    let mut summary = FitSummary::default();
    for id in ids {
        if fit(event, id, options).is_success() {
            summary.converged += 1;
        } else {
            summary.failed += 1;
        }
    }
    log::debug!(
        "Fitted '{}': {} converged, {} failed",
        label,
        summary.converged,
        summary.failed
    );
    Ok(summary)
}
