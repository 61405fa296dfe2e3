//! Per-event input records and the event container
//!
//! [`EventRecord`] is what the input feed supplies for one collision: detector
//! tracks and clusters with precomputed attributes and, for simulated input, the
//! generated particle table they trace back to. [`Event`] owns everything the
//! pipeline derives from one record; nothing is shared between events.

use crate::kinematics::{Beam, LorentzVector};
use crate::particles;
use crate::store::CandidateStore;
use crate::types::{Candidate, CandidateId, PipelineError, Result, Source};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One event as supplied by the input feed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event sequence number; output rows are ordered by it
    pub event: u64,
    #[serde(default)]
    pub tracks: Vec<TrackRecord>,
    #[serde(default)]
    pub clusters: Vec<ClusterRecord>,
    /// Generated particles (simulated input only)
    #[serde(default)]
    pub mc_particles: Vec<McParticle>,
}

/// A reconstructed charged track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: u32,
    pub charge: i32,
    /// Momentum at the point of closest approach (GeV)
    pub momentum: [f64; 3],
    /// Point of closest approach to the origin (cm)
    #[serde(default)]
    pub position: [f64; 3],
    /// Per-coordinate position uncertainty (cm)
    #[serde(default = "default_position_error")]
    pub position_error: f64,
    /// Precomputed PID and quality attributes (`pionID`, `nCDCHits`, ...)
    #[serde(default)]
    pub attributes: BTreeMap<String, f64>,
    /// Index of the generated particle this track came from
    #[serde(default)]
    pub mc_index: Option<usize>,
}

fn default_position_error() -> f64 {
    0.01
}

/// A calorimeter cluster without an associated track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: u32,
    /// Photon-hypothesis momentum (GeV)
    pub momentum: [f64; 3],
    #[serde(default)]
    pub attributes: BTreeMap<String, f64>,
    #[serde(default)]
    pub mc_index: Option<usize>,
}

/// A generated particle of the reference decay tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McParticle {
    pub pdg: i32,
    /// Index of the mother in the same table
    #[serde(default)]
    pub mother: Option<usize>,
    pub momentum: [f64; 3],
    /// Energy; derived from the nominal mass when absent
    #[serde(default)]
    pub energy: Option<f64>,
    #[serde(default)]
    pub production_vertex: [f64; 3],
}

impl McParticle {
    pub fn p4(&self) -> LorentzVector {
        let p = Vector3::from(self.momentum);
        match self.energy {
            Some(e) => LorentzVector::new(p.x, p.y, p.z, e),
            None => {
                let mass = particles::by_pdg(self.pdg).map(|s| s.mass).unwrap_or(0.0);
                LorentzVector::from_momentum_mass(p, mass)
            }
        }
    }
}

/// Generated particle table with daughter links derived from the mother links
#[derive(Debug, Clone, Default)]
pub struct McTable {
    particles: Vec<McParticle>,
    daughters: Vec<Vec<usize>>,
}

impl McTable {
    pub fn new(particles: Vec<McParticle>) -> Result<Self> {
        let mut daughters = vec![Vec::new(); particles.len()];
        for (index, particle) in particles.iter().enumerate() {
            if let Some(mother) = particle.mother {
                if mother >= particles.len() || mother == index {
                    return Err(PipelineError::InvalidInput(format!(
                        "generated particle {} has invalid mother {}",
                        index, mother
                    )));
                }
                daughters[mother].push(index);
            }
        }
        Ok(Self { particles, daughters })
    }

    pub fn get(&self, index: usize) -> Option<&McParticle> {
        self.particles.get(index)
    }

    pub fn mother(&self, index: usize) -> Option<usize> {
        self.particles.get(index).and_then(|p| p.mother)
    }

    pub fn daughters(&self, index: usize) -> &[usize] {
        self.daughters.get(index).map(|d| d.as_slice()).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &McParticle)> {
        self.particles.iter().enumerate()
    }
}

/// Everything the pipeline knows about one event
#[derive(Debug, Clone)]
pub struct Event {
    pub number: u64,
    pub beam: Beam,
    pub store: CandidateStore,
    pub mc: McTable,
    pub(crate) tracks: Vec<TrackRecord>,
    pub(crate) clusters: Vec<ClusterRecord>,
    /// One pion-hypothesis candidate per track, outside any list
    pub(crate) track_objects: Vec<CandidateId>,
    /// One photon candidate per cluster, outside any list
    pub(crate) cluster_objects: Vec<CandidateId>,
}

impl Event {
    /// Build an event from an input record
    ///
    /// Every track and cluster is also entered into the arena once as an event
    /// object; the rest-of-event builder works on these.
    pub fn from_record(record: EventRecord, beam: Beam) -> Result<Self> {
        let mc = McTable::new(record.mc_particles)?;
        check_unique_ids("track", record.tracks.iter().map(|t| t.id))?;
        check_unique_ids("cluster", record.clusters.iter().map(|c| c.id))?;
        let mut store = CandidateStore::new();

        let mut track_objects = Vec::with_capacity(record.tracks.len());
        for track in &record.tracks {
            let species = match track.charge {
                1 => "pi+",
                -1 => "pi-",
                other => {
                    return Err(PipelineError::InvalidInput(format!(
                        "track {} has charge {}",
                        track.id, other
                    )))
                }
            };
            track_objects.push(store.insert(track_candidate(track, species)?));
        }

        let cluster_objects = record
            .clusters
            .iter()
            .map(|cluster| store.insert(cluster_candidate(cluster)))
            .collect();

        Ok(Self {
            number: record.event,
            beam,
            store,
            mc,
            tracks: record.tracks,
            clusters: record.clusters,
            track_objects,
            cluster_objects,
        })
    }

    /// True if this event carries a generated reference
    pub fn is_simulated(&self) -> bool {
        !self.mc.is_empty()
    }

    pub fn track_objects(&self) -> &[CandidateId] {
        &self.track_objects
    }

    pub fn cluster_objects(&self) -> &[CandidateId] {
        &self.cluster_objects
    }
}

/// Overlap checks key on object ids, so two objects may not share one
fn check_unique_ids(kind: &str, ids: impl Iterator<Item = u32>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(PipelineError::InvalidInput(format!("duplicate {} id {}", kind, id)));
        }
    }
    Ok(())
}

/// Final-state candidate for a track under a species hypothesis
pub(crate) fn track_candidate(track: &TrackRecord, species: &str) -> Result<Candidate> {
    let info = particles::lookup(species)
        .ok_or_else(|| PipelineError::MalformedPattern(format!("unknown species '{}'", species)))?;
    let p4 = LorentzVector::from_momentum_mass(Vector3::from(track.momentum), info.mass);
    let variance = track.position_error * track.position_error;
    Ok(Candidate::final_state(info.name, info.pdg, track.charge, p4, Source::Track(track.id))
        .with_origin(track.mc_index)
        .with_position(Vector3::from(track.position), variance)
        .with_attributes(track.attributes.iter().map(|(k, v)| (k.clone(), *v))))
}

/// Photon candidate for a cluster
pub(crate) fn cluster_candidate(cluster: &ClusterRecord) -> Candidate {
    let p4 = LorentzVector::from_momentum_mass(Vector3::from(cluster.momentum), 0.0);
    Candidate::final_state("gamma", 22, 0, p4, Source::Cluster(cluster.id))
        .with_origin(cluster.mc_index)
        .with_attributes(cluster.attributes.iter().map(|(k, v)| (k.clone(), *v)))
}
