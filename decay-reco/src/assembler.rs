//! Decay assembler: builds composite candidates from daughter lists
//!
//! The product of the daughter lists is walked depth-first, one slot at a time,
//! so a combination is abandoned as soon as one slot fails its cut or reuses a
//! detector object. Nothing beyond the current branch is ever held in memory.

use crate::cut::Cut;
use crate::descriptor;
use crate::event::Event;
use crate::kinematics::LorentzVector;
use crate::particles::{self, Species};
use crate::truth;
use crate::types::{Candidate, CandidateId, MatchClass, PipelineError, Result, Source};
use crate::variables::VariableProvider;
use std::collections::HashSet;
use std::fmt;

/// Where the daughter lists of a pattern come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssemblyMode {
    /// Detector-level candidates; every combination passing the cut is kept
    #[default]
    Reconstructed,
    /// Generated candidates; only exactly truth-matched combinations are kept
    Generated,
}

/// A compiled decay pattern: `parent -> daughters` with a cut
///
/// Each slot reads one daughter list and takes only the candidates of the
/// slot's species from it, so a list holding both charges can feed a slot.
#[derive(Debug, Clone)]
pub struct DecayPattern {
    parent: String,
    species: &'static Species,
    daughters: Vec<String>,
    daughter_species: Vec<&'static Species>,
    slot_cuts: Vec<Cut>,
    residual: Cut,
    mode: AssemblyMode,
}

impl DecayPattern {
    /// Compile a pattern from a decay string such as `"D+:kpipi -> K- pi+ pi+"`
    pub fn parse(decay: &str, cut: &str, provider: &dyn VariableProvider) -> Result<Self> {
        let node = descriptor::parse(decay)?;
        if node.daughters.iter().any(|d| !d.daughters.is_empty()) {
            return Err(PipelineError::MalformedPattern(format!(
                "'{}': nested decays are reconstructed in their own step",
                decay
            )));
        }
        let daughters = node.daughters.iter().map(|d| d.label.clone()).collect();
        Self::new(&node.label, daughters, Cut::compile(cut, provider)?)
    }

    /// Build a pattern from its parts, checking species and charge conservation
    pub fn new(parent: &str, daughters: Vec<String>, cut: Cut) -> Result<Self> {
        let species = particles::lookup(parent).ok_or_else(|| {
            PipelineError::MalformedPattern(format!("unknown parent species '{}'", parent))
        })?;
        if daughters.is_empty() {
            return Err(PipelineError::MalformedPattern(format!("'{}' has no daughters", parent)));
        }

        let mut charge = 0;
        let mut daughter_species = Vec::with_capacity(daughters.len());
        for label in &daughters {
            let daughter = particles::lookup(label).ok_or_else(|| {
                PipelineError::MalformedPattern(format!("unknown daughter species '{}'", label))
            })?;
            charge += daughter.charge;
            daughter_species.push(daughter);
        }
        if charge != species.charge {
            return Err(PipelineError::MalformedPattern(format!(
                "'{}' has charge {} but its daughters sum to {}",
                parent, species.charge, charge
            )));
        }

        let (slot_cuts, residual) = cut.split_slot_cuts(daughters.len());
        Ok(Self {
            parent: parent.to_string(),
            species,
            daughters,
            daughter_species,
            slot_cuts,
            residual,
            mode: AssemblyMode::Reconstructed,
        })
    }

    /// Builder method: assemble in generated mode
    pub fn generated(mut self) -> Self {
        self.mode = AssemblyMode::Generated;
        self
    }

    /// The charge-conjugate decay, filling the same parent list
    ///
    /// A conjugate daughter is read from the conjugate list when `has_list`
    /// knows it, otherwise from the original list, which then has to hold both
    /// charges. `None` when the decay is its own conjugate.
    pub fn conjugate(&self, has_list: impl Fn(&str) -> bool) -> Option<DecayPattern> {
        let species = particles::antiparticle(self.species);
        let daughter_species: Vec<&'static Species> =
            self.daughter_species.iter().map(|s| particles::antiparticle(*s)).collect();

        let mut original: Vec<i32> = self.daughter_species.iter().map(|s| s.pdg).collect();
        let mut flipped: Vec<i32> = daughter_species.iter().map(|s| s.pdg).collect();
        original.sort_unstable();
        flipped.sort_unstable();
        if species.pdg == self.species.pdg && original == flipped {
            return None;
        }

        let daughters = self
            .daughters
            .iter()
            .map(|label| {
                let conjugate = particles::conjugate_label(label);
                if has_list(&conjugate) {
                    conjugate
                } else {
                    label.clone()
                }
            })
            .collect();

        Some(DecayPattern {
            parent: self.parent.clone(),
            species,
            daughters,
            daughter_species,
            slot_cuts: self.slot_cuts.clone(),
            residual: self.residual.clone(),
            mode: self.mode,
        })
    }

    pub fn parent(&self) -> &str {
        &self.parent
    }

    pub fn daughters(&self) -> &[String] {
        &self.daughters
    }

    pub fn species(&self) -> &'static Species {
        self.species
    }

    /// Species taken from each daughter list
    pub fn daughter_species(&self) -> &[&'static Species] {
        &self.daughter_species
    }

    pub fn mode(&self) -> AssemblyMode {
        self.mode
    }

    /// Cuts applied to each slot before combining
    pub fn slot_cuts(&self) -> &[Cut] {
        &self.slot_cuts
    }

    /// Cut applied to the assembled candidate
    pub fn residual_cut(&self) -> &Cut {
        &self.residual
    }

    /// For each slot, the nearest earlier slot with the same label
    fn tie_slots(&self) -> Vec<Option<usize>> {
        (0..self.daughters.len())
            .map(|i| (0..i).rev().find(|&j| self.daughters[j] == self.daughters[i]))
            .collect()
    }
}

impl fmt::Display for DecayPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parent)?;
        if particles::species_name(&self.parent) != self.species.name {
            write!(f, " ({})", self.species.name)?;
        }
        write!(f, " ->")?;
        for (label, species) in self.daughters.iter().zip(&self.daughter_species) {
            write!(f, " {}", label)?;
            if particles::species_name(label) != species.name {
                write!(f, " ({})", species.name)?;
            }
        }
        Ok(())
    }
}

/// Counters from one assembly step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    /// Slot candidates removed by per-slot cuts
    pub slot_rejected: usize,
    /// Branches pruned because a detector object was reused
    pub overlaps: usize,
    /// Complete combinations rejected as duplicates
    pub duplicates: usize,
    /// Candidates built and tested against the residual cut
    pub built: usize,
    /// Candidates rejected by the residual cut or by truth in generated mode
    pub rejected: usize,
    /// Candidates appended to the parent list
    pub accepted: usize,
}

impl AssemblyStats {
    /// Add the counters of another pass into the same list
    pub fn merge(&mut self, other: &AssemblyStats) {
        self.slot_rejected += other.slot_rejected;
        self.overlaps += other.overlaps;
        self.duplicates += other.duplicates;
        self.built += other.built;
        self.rejected += other.rejected;
        self.accepted += other.accepted;
    }
}

/// Assemble a pattern and append the survivors to the parent list
///
/// Daughter lists are read, never modified. The parent list is created even when
/// nothing survives.
pub fn assemble(
    pattern: &DecayPattern,
    event: &mut Event,
    provider: &dyn VariableProvider,
) -> Result<AssemblyStats> {
    let mut stats = AssemblyStats::default();

    let mut slots = Vec::with_capacity(pattern.daughters.len());
    for ((label, species), cut) in
        pattern.daughters.iter().zip(&pattern.daughter_species).zip(&pattern.slot_cuts)
    {
        let ids: Vec<CandidateId> = event
            .store
            .get(label)?
            .iter()
            .copied()
            .filter(|id| event.store.candidate(*id).pdg() == species.pdg)
            .collect();
        let kept: Vec<CandidateId> = ids
            .iter()
            .copied()
            .filter(|id| event.store.candidate(*id).survives())
            .filter(|id| cut.passes(provider, event, *id))
            .collect();
        stats.slot_rejected += ids.len() - kept.len();
        let with_sources = kept
            .into_iter()
            .map(|id| (id, event.store.leaf_sources(id)))
            .collect();
        slots.push(with_sources);
    }

    let mut combiner = Combiner {
        pattern,
        provider,
        slots,
        ties: pattern.tie_slots(),
        chosen: Vec::with_capacity(pattern.daughters.len()),
        used: HashSet::new(),
        seen: HashSet::new(),
        accepted: Vec::new(),
        stats,
    };
    combiner.descend(event, 0);

    let Combiner { accepted, mut stats, .. } = combiner;
    stats.accepted = accepted.len();
    event.store.append(&pattern.parent, accepted);

    log::debug!(
        "Assembled {}: {} built, {} accepted, {} overlaps, {} duplicates",
        pattern,
        stats.built,
        stats.accepted,
        stats.overlaps,
        stats.duplicates
    );
    Ok(stats)
}

struct Combiner<'a> {
    pattern: &'a DecayPattern,
    provider: &'a dyn VariableProvider,
    /// Pre-filtered candidates per slot with their leaf sources
    slots: Vec<Vec<(CandidateId, Vec<Source>)>>,
    ties: Vec<Option<usize>>,
    chosen: Vec<CandidateId>,
    /// Leaf sources used by the current branch
    used: HashSet<Source>,
    /// Sorted daughter ids of every complete combination so far
    seen: HashSet<Vec<CandidateId>>,
    accepted: Vec<CandidateId>,
    stats: AssemblyStats,
}

impl Combiner<'_> {
    fn descend(&mut self, event: &mut Event, depth: usize) {
        if depth == self.slots.len() {
            self.build(event);
            return;
        }

        for k in 0..self.slots[depth].len() {
            let id = self.slots[depth][k].0;
            if let Some(tie) = self.ties[depth] {
                if id <= self.chosen[tie] {
                    continue;
                }
            }
            let sources = &self.slots[depth][k].1;
            if sources.iter().any(|s| self.used.contains(s)) {
                self.stats.overlaps += 1;
                log::trace!("{}: {} overlaps the current branch", self.pattern, id);
                continue;
            }

            let sources = sources.clone();
            self.used.extend(sources.iter().copied());
            self.chosen.push(id);
            self.descend(event, depth + 1);
            self.chosen.pop();
            for s in &sources {
                self.used.remove(s);
            }
        }
    }

    fn build(&mut self, event: &mut Event) {
        let mut key = self.chosen.clone();
        key.sort_unstable();
        if !self.seen.insert(key) {
            self.stats.duplicates += 1;
            return;
        }

        let mut p4 = LorentzVector::default();
        let mut charge = 0;
        for id in &self.chosen {
            let daughter = event.store.candidate(*id);
            p4 += *daughter.p4();
            charge += daughter.charge();
        }
        let species = self.pattern.species;
        let candidate = Candidate::composite(species.name, species.pdg, charge, p4, self.chosen.clone());
        let id = event.store.insert(candidate);
        self.stats.built += 1;

        let keep = self.pattern.residual.passes(self.provider, event, id)
            && match self.pattern.mode {
                AssemblyMode::Reconstructed => true,
                AssemblyMode::Generated => truth::classify(event, id).class == MatchClass::Exact,
            };

        if keep {
            log::trace!("{}: accepted {} from {:?}", self.pattern, id, self.chosen);
            self.accepted.push(id);
        } else {
            self.stats.rejected += 1;
            event.store.discard_last(id);
        }
    }
}
