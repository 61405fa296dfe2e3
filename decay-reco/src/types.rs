//! Core types for the decay reconstruction library
//!
//! This module defines the candidate record every stage of the pipeline works on,
//! the identifiers that tie candidates into decay trees, and the error type shared
//! by the whole crate.

use crate::kinematics::LorentzVector;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while configuring or running the pipeline
///
/// Everything except `InvalidInput` and `IoError` describes a broken pipeline
/// definition and aborts the run. Failed cuts, failed fits and unmatched truth are
/// not errors at all.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Unknown candidate list: {0}")]
    UnknownList(String),

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Cannot resolve role '{role}': {reason}")]
    RoleResolution { role: String, reason: String },

    #[error("Malformed decay pattern: {0}")]
    MalformedPattern(String),

    #[error("Invalid cut expression: {0}")]
    Expression(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input record: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PipelineError {
    /// True if this error comes from the pipeline definition rather than the data
    pub fn is_configuration_error(&self) -> bool {
        !matches!(self, PipelineError::InvalidInput(_) | PipelineError::IoError(_))
    }
}

/// Index of a candidate inside an event's candidate arena
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CandidateId(u32);

impl CandidateId {
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Position of the candidate in the arena
    #[inline]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of the detector or generator object behind a final-state candidate
///
/// Two final-state candidates built from the same track (say a pion and a kaon
/// hypothesis) share a source and can never appear in the same decay tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Source {
    Track(u32),
    Cluster(u32),
    Generated(u32),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Track(i) => write!(f, "track {}", i),
            Source::Cluster(i) => write!(f, "cluster {}", i),
            Source::Generated(i) => write!(f, "generated {}", i),
        }
    }
}

/// Truth-match classification of a candidate against the generated reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchClass {
    /// Every leaf traces to a distinct particle of one reference decay with the same topology
    Exact,
    /// Some reference daughters have no reconstructed counterpart, nothing extraneous
    MissingDaughters,
    /// Leaves come from different reference decays or parent species disagree
    WrongCombination,
    /// No leaf traces to the reference at all
    NoMatch,
}

impl MatchClass {
    /// Rank used for monotonicity checks: higher is a better match
    pub fn quality(&self) -> u8 {
        match self {
            MatchClass::Exact => 3,
            MatchClass::MissingDaughters => 2,
            MatchClass::WrongCombination => 1,
            MatchClass::NoMatch => 0,
        }
    }
}

impl fmt::Display for MatchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchClass::Exact => write!(f, "exact"),
            MatchClass::MissingDaughters => write!(f, "missing-daughters"),
            MatchClass::WrongCombination => write!(f, "wrong-combination"),
            MatchClass::NoMatch => write!(f, "no-match"),
        }
    }
}

/// Result of truth matching one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruthMatch {
    pub class: MatchClass,
    /// Index of the matched generated particle, if one was identified
    pub mc_index: Option<usize>,
    /// Every condition seen while matching, see `truth::flags`
    pub flags: u32,
}

/// Fit state of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitStatus {
    #[default]
    NotFitted,
    Converged,
    Failed,
}

/// Vertex fit result stored on a candidate
#[derive(Debug, Clone, PartialEq)]
pub struct VertexFit {
    pub position: Vector3<f64>,
    pub chi2: f64,
    pub ndf: u32,
    pub p_value: f64,
    /// Mean positional variance of the fitted vertex, used when the candidate
    /// constrains a fit further up the tree
    pub variance: f64,
}

/// Rest of event attached to a signal candidate: event objects not used by it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestOfEvent {
    pub tracks: Vec<CandidateId>,
    pub clusters: Vec<CandidateId>,
}

impl RestOfEvent {
    pub fn len(&self) -> usize {
        self.tracks.len() + self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty() && self.clusters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = CandidateId> + '_ {
        self.tracks.iter().chain(self.clusters.iter()).copied()
    }
}

/// Event-shape features computed by the continuum-suppression extractor
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuumFeatures {
    pub r2: f64,
    pub thrust_bm: f64,
    pub thrust_om: f64,
    pub cos_tbto: f64,
    pub cos_tbz: f64,
    /// Momentum flow in 10 degree cones around the signal thrust axis
    pub cleo_cones: [f64; 9],
    /// Kakuno-Super-Fox-Wolfram moments keyed by their conventional names
    pub ksfw: BTreeMap<String, f64>,
}

/// One particle hypothesis, final-state or composite
///
/// Species and source are fixed at creation; daughters only change when a
/// vertex fit swaps them for updated copies. The fitter, the truth matcher and
/// the rest-of-event extractor write their own fields in place; each such write
/// clears the memoized variable values.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub(crate) species: String,
    pub(crate) pdg: i32,
    pub(crate) charge: i32,
    pub(crate) p4: LorentzVector,
    pub(crate) daughters: Vec<CandidateId>,
    pub(crate) source: Option<Source>,
    pub(crate) origin: Option<usize>,
    pub(crate) position: Option<Vector3<f64>>,
    pub(crate) position_variance: f64,
    pub(crate) attributes: HashMap<String, f64>,
    pub(crate) truth: Option<TruthMatch>,
    pub(crate) fit_status: FitStatus,
    pub(crate) vertex: Option<VertexFit>,
    pub(crate) rest_of_event: Option<RestOfEvent>,
    pub(crate) continuum: Option<ContinuumFeatures>,
    cache: RefCell<HashMap<String, f64>>,
}

impl Candidate {
    /// Create a final-state candidate
    pub fn final_state(
        species: impl Into<String>,
        pdg: i32,
        charge: i32,
        p4: LorentzVector,
        source: Source,
    ) -> Self {
        Self::blank(species.into(), pdg, charge, p4, Vec::new(), Some(source))
    }

    /// Create a composite candidate from its ordered daughters
    pub fn composite(
        species: impl Into<String>,
        pdg: i32,
        charge: i32,
        p4: LorentzVector,
        daughters: Vec<CandidateId>,
    ) -> Self {
        Self::blank(species.into(), pdg, charge, p4, daughters, None)
    }

    fn blank(
        species: String,
        pdg: i32,
        charge: i32,
        p4: LorentzVector,
        daughters: Vec<CandidateId>,
        source: Option<Source>,
    ) -> Self {
        Self {
            species,
            pdg,
            charge,
            p4,
            daughters,
            source,
            origin: None,
            position: None,
            position_variance: 0.0,
            attributes: HashMap::new(),
            truth: None,
            fit_status: FitStatus::NotFitted,
            vertex: None,
            rest_of_event: None,
            continuum: None,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Builder method: attach the reference-origin tag
    pub fn with_origin(mut self, origin: Option<usize>) -> Self {
        self.origin = origin;
        self
    }

    /// Builder method: attach a position and its per-coordinate variance
    pub fn with_position(mut self, position: Vector3<f64>, variance: f64) -> Self {
        self.position = Some(position);
        self.position_variance = variance;
        self
    }

    /// Builder method: attach precomputed input attributes
    pub fn with_attributes<I>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        self.attributes.extend(attributes);
        self
    }

    pub fn species(&self) -> &str {
        &self.species
    }

    pub fn pdg(&self) -> i32 {
        self.pdg
    }

    pub fn charge(&self) -> i32 {
        self.charge
    }

    pub fn p4(&self) -> &LorentzVector {
        &self.p4
    }

    pub fn daughters(&self) -> &[CandidateId] {
        &self.daughters
    }

    pub fn is_final_state(&self) -> bool {
        self.daughters.is_empty()
    }

    pub fn source(&self) -> Option<Source> {
        self.source
    }

    pub fn origin(&self) -> Option<usize> {
        self.origin
    }

    /// Fitted vertex if available, otherwise the input position
    pub fn position(&self) -> Option<Vector3<f64>> {
        self.vertex.as_ref().map(|v| v.position).or(self.position)
    }

    pub fn attribute(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).copied()
    }

    pub fn truth(&self) -> Option<&TruthMatch> {
        self.truth.as_ref()
    }

    pub fn fit_status(&self) -> FitStatus {
        self.fit_status
    }

    pub fn vertex(&self) -> Option<&VertexFit> {
        self.vertex.as_ref()
    }

    pub fn rest_of_event(&self) -> Option<&RestOfEvent> {
        self.rest_of_event.as_ref()
    }

    pub fn continuum(&self) -> Option<&ContinuumFeatures> {
        self.continuum.as_ref()
    }

    /// False once the fitter has rejected the candidate
    pub fn survives(&self) -> bool {
        self.fit_status != FitStatus::Failed
    }

    pub(crate) fn cached(&self, key: &str) -> Option<f64> {
        self.cache.borrow().get(key).copied()
    }

    pub(crate) fn memoize(&self, key: String, value: f64) {
        self.cache.borrow_mut().insert(key, value);
    }

    pub(crate) fn invalidate(&mut self) {
        self.cache.get_mut().clear();
    }

    pub(crate) fn set_truth(&mut self, truth: TruthMatch) {
        self.truth = Some(truth);
        self.invalidate();
    }

    pub(crate) fn set_fit(&mut self, status: FitStatus, vertex: Option<VertexFit>) {
        self.fit_status = status;
        if vertex.is_some() {
            self.vertex = vertex;
        }
        self.invalidate();
    }

    pub(crate) fn set_p4(&mut self, p4: LorentzVector) {
        self.p4 = p4;
        self.invalidate();
    }

    pub(crate) fn set_daughters(&mut self, daughters: Vec<CandidateId>) {
        self.daughters = daughters;
        self.invalidate();
    }

    pub(crate) fn set_position(&mut self, position: Vector3<f64>) {
        self.position = Some(position);
        self.invalidate();
    }

    pub(crate) fn set_rest_of_event(&mut self, roe: RestOfEvent) {
        self.rest_of_event = Some(roe);
        self.invalidate();
    }

    pub(crate) fn set_continuum(&mut self, features: ContinuumFeatures) {
        self.continuum = Some(features);
        self.invalidate();
    }
}
