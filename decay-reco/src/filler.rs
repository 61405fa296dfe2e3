//! Final-state list filling
//!
//! Turns the event's tracks, clusters or generated particles into a list of
//! final-state candidates of one species, keeping those that pass a cut.
//! Charged species come from tracks of matching charge under that mass
//! hypothesis; photons come from clusters.

use crate::cut::Cut;
use crate::event::{cluster_candidate, track_candidate, Event};
use crate::particles::{self, Species};
use crate::types::{Candidate, PipelineError, Result, Source};
use crate::variables::VariableProvider;
use nalgebra::Vector3;

/// Position variance given to generated particles, whose vertex is exact
const GENERATED_POSITION_VARIANCE: f64 = 1e-8;

/// What a list is filled from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillSource {
    Detector,
    Generated,
}

/// A compiled list-filling step
#[derive(Debug, Clone)]
pub struct ListFill {
    label: String,
    species: &'static Species,
    cut: Cut,
    source: FillSource,
}

impl ListFill {
    /// Fill `label` from detector objects
    pub fn new(label: &str, cut: &str, provider: &dyn VariableProvider) -> Result<Self> {
        let species = particles::lookup(label).ok_or_else(|| {
            PipelineError::MalformedPattern(format!("unknown species in list '{}'", label))
        })?;
        if species.charge == 0 && species.pdg != 22 {
            return Err(PipelineError::MalformedPattern(format!(
                "'{}' is neutral and not a photon; reconstruct it from its daughters",
                label
            )));
        }
        Ok(Self {
            label: label.to_string(),
            species,
            cut: Cut::compile(cut, provider)?,
            source: FillSource::Detector,
        })
    }

    /// Fill `label` from generated particles of its species
    pub fn generated(label: &str, cut: &str, provider: &dyn VariableProvider) -> Result<Self> {
        let species = particles::lookup(label).ok_or_else(|| {
            PipelineError::MalformedPattern(format!("unknown species in list '{}'", label))
        })?;
        Ok(Self {
            label: label.to_string(),
            species,
            cut: Cut::compile(cut, provider)?,
            source: FillSource::Generated,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn source(&self) -> FillSource {
        self.source
    }

    fn make_candidates(&self, event: &Event) -> Result<Vec<Candidate>> {
        match self.source {
            FillSource::Detector if self.species.pdg == 22 => {
                Ok(event.clusters.iter().map(cluster_candidate).collect())
            }
            FillSource::Detector => event
                .tracks
                .iter()
                .filter(|t| t.charge == self.species.charge)
                .map(|t| track_candidate(t, self.species.name))
                .collect(),
            FillSource::Generated => Ok(event
                .mc
                .iter()
                .filter(|(_, p)| p.pdg == self.species.pdg)
                .map(|(index, p)| {
                    Candidate::final_state(
                        self.species.name,
                        self.species.pdg,
                        self.species.charge,
                        p.p4(),
                        Source::Generated(index as u32),
                    )
                    .with_origin(Some(index))
                    .with_position(Vector3::from(p.production_vertex), GENERATED_POSITION_VARIANCE)
                })
                .collect()),
        }
    }
}

/// Create the list and fill it; returns `(created, accepted)`
pub fn fill(
    step: &ListFill,
    event: &mut Event,
    provider: &dyn VariableProvider,
) -> Result<(usize, usize)> {
    event.store.create_list(&step.label)?;
    let candidates = step.make_candidates(event)?;
    let created = candidates.len();

    let mut accepted = Vec::new();
    for candidate in candidates {
        let id = event.store.insert(candidate);
        if step.cut.passes(provider, event, id) {
            accepted.push(id);
        } else {
            event.store.discard_last(id);
        }
    }
    let kept = accepted.len();
    event.store.append(&step.label, accepted);
    log::debug!("Filled '{}': {} of {} kept", step.label, kept, created);
    Ok((created, kept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ClusterRecord, EventRecord, McParticle, TrackRecord};
    use crate::kinematics::Beam;
    use crate::variables::VariableManager;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn event() -> Event {
        let track = |id: u32, charge: i32, kaon_id: f64| TrackRecord {
            id,
            charge,
            momentum: [0.6, 0.0, 0.8],
            position: [0.0; 3],
            position_error: 0.01,
            attributes: BTreeMap::from([("kaonID".to_string(), kaon_id)]),
            mc_index: Some(id as usize + 1),
        };
        let record = EventRecord {
            event: 1,
            tracks: vec![track(0, 1, 0.9), track(1, -1, 0.8), track(2, 1, 0.1)],
            clusters: vec![ClusterRecord {
                id: 0,
                momentum: [0.0, 0.3, 0.4],
                attributes: BTreeMap::new(),
                mc_index: None,
            }],
            mc_particles: vec![
                McParticle {
                    pdg: 113,
                    mother: None,
                    momentum: [0.0, 0.0, 1.0],
                    energy: None,
                    production_vertex: [0.0; 3],
                },
                McParticle {
                    pdg: 211,
                    mother: Some(0),
                    momentum: [0.3, 0.0, 0.4],
                    energy: None,
                    production_vertex: [0.1, 0.0, 0.0],
                },
            ],
        };
        Event::from_record(record, Beam::default()).unwrap()
    }

    #[test]
    fn test_fill_charged_with_cut() {
        let vm = VariableManager::new();
        let mut event = event();
        let step = ListFill::new("K+", "kaonID > 0.6", &vm).unwrap();
        let before = event.store.len();
        assert_eq!(fill(&step, &mut event, &vm).unwrap(), (2, 1));
        assert_eq!(event.store.len(), before + 1);

        let kaon = event.store.candidate(event.store.get("K+").unwrap()[0]);
        assert_eq!(kaon.species(), "K+");
        assert_relative_eq!(kaon.p4().mass(), 0.493_677, epsilon = 1e-9);
        assert_eq!(kaon.source(), Some(Source::Track(0)));
        assert_eq!(kaon.origin(), Some(1));
    }

    #[test]
    fn test_fill_photons() {
        let vm = VariableManager::new();
        let mut event = event();
        let step = ListFill::new("gamma", "", &vm).unwrap();
        assert_eq!(fill(&step, &mut event, &vm).unwrap(), (1, 1));
        assert!(ListFill::new("pi0", "", &vm).is_err());
    }

    #[test]
    fn test_fill_generated() {
        let vm = VariableManager::new();
        let mut event = event();
        let step = ListFill::generated("pi+:gen", "", &vm).unwrap();
        assert_eq!(fill(&step, &mut event, &vm).unwrap(), (1, 1));
        let pion = event.store.candidate(event.store.get("pi+:gen").unwrap()[0]);
        assert_eq!(pion.source(), Some(Source::Generated(1)));
        assert_eq!(pion.origin(), Some(1));
        assert_relative_eq!(pion.position().unwrap().x, 0.1);
    }

    #[test]
    fn test_fill_twice_is_an_error() {
        let vm = VariableManager::new();
        let mut event = event();
        let step = ListFill::new("pi-", "", &vm).unwrap();
        fill(&step, &mut event, &vm).unwrap();
        assert!(matches!(fill(&step, &mut event, &vm), Err(PipelineError::InvalidConfig(_))));
    }
}
