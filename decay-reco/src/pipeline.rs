//! Main pipeline API
//!
//! A [`Pipeline`] is a [`PipelineConfig`] compiled once: every cut parsed,
//! every variable resolved, every decay pattern validated against the lists
//! produced by earlier steps. It is immutable afterwards and can be shared
//! between threads; each call to [`Pipeline::process_event`] works on its own
//! [`Event`].

use crate::assembler::{self, DecayPattern};
use crate::config::{PipelineConfig, StepConfig};
use crate::continuum;
use crate::cut::Cut;
use crate::descriptor::DescriptorNode;
use crate::event::{Event, EventRecord};
use crate::filler::{self, ListFill};
use crate::fitter::{self, FitOptions};
use crate::flatten::{OutputRow, Tabulator};
use crate::kinematics::Beam;
use crate::output::RowSink;
use crate::particles;
use crate::roe::{self, RoeMask};
use crate::truth;
use crate::types::{PipelineError, Result};
use crate::variables::VariableManager;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// A compiled processing step
#[derive(Debug, Clone)]
enum Stage {
    Fill(ListFill),
    Reconstruct { pattern: DecayPattern, conjugate: Option<DecayPattern> },
    Select { list: String, cut: Cut },
    MatchTruth { list: String },
    VertexFit { list: String, options: FitOptions },
    RestOfEvent { list: String },
    ContinuumSuppression { list: String, mask: Option<RoeMask> },
}

#[derive(Debug, Clone)]
struct Step {
    name: String,
    stage: Stage,
}

/// Candidates going into and coming out of one step for one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCount {
    pub input: usize,
    pub output: usize,
    pub elapsed: Duration,
}

/// Result of processing one event
#[derive(Debug, Clone)]
pub struct EventOutput {
    pub event: u64,
    pub rows: Vec<OutputRow>,
    /// One entry per pipeline step, in step order
    pub counts: Vec<StepCount>,
}

/// Accumulated statistics for one step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepStatistics {
    pub name: String,
    pub calls: usize,
    pub candidates_in: usize,
    pub candidates_out: usize,
    pub elapsed: Duration,
}

/// Statistics for a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStatistics {
    /// Events processed successfully
    pub events: usize,
    /// Events skipped because their input record was invalid
    pub skipped: usize,
    pub rows: usize,
    pub steps: Vec<StepStatistics>,
}

impl RunStatistics {
    /// Empty statistics with one entry per step of the pipeline
    pub fn new(pipeline: &Pipeline) -> Self {
        Self {
            steps: pipeline
                .step_names()
                .map(|name| StepStatistics { name: name.to_string(), ..Default::default() })
                .collect(),
            ..Default::default()
        }
    }

    /// Add the counts of one processed event
    pub fn record(&mut self, output: &EventOutput) {
        self.events += 1;
        self.rows += output.rows.len();
        for (step, count) in self.steps.iter_mut().zip(&output.counts) {
            step.calls += 1;
            step.candidates_in += count.input;
            step.candidates_out += count.output;
            step.elapsed += count.elapsed;
        }
    }

    /// Count an event skipped for invalid input
    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    /// Take the result of one event: write its rows, or skip it if its input
    /// was invalid
    ///
    /// Any other error is returned and should end the run.
    pub fn consume(
        &mut self,
        event: u64,
        result: Result<EventOutput>,
        sink: &mut dyn RowSink,
    ) -> Result<()> {
        match result {
            Ok(output) => {
                for row in &output.rows {
                    sink.write(row)?;
                }
                self.record(&output);
                Ok(())
            }
            Err(e) if !e.is_configuration_error() => {
                log::warn!("Skipping event {}: {}", event, e);
                self.record_skipped();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// The compiled reconstruction pipeline
#[derive(Debug, Clone)]
pub struct Pipeline {
    beam: Beam,
    variables: VariableManager,
    steps: Vec<Step>,
    tabulator: Tabulator,
}

impl Pipeline {
    /// Compile a pipeline configuration
    ///
    /// Every configuration problem is reported here, before any event is read:
    /// unknown variables, malformed cuts and patterns, steps reading lists that
    /// no earlier step produces, and roles the output template cannot resolve.
    ///
    /// # Example
    /// ```no_run
    /// use decay_reco::{Pipeline, PipelineConfig, TableConfig};
    ///
    /// let config = PipelineConfig::new(TableConfig::new("D+").with_variables(&["M"]))
    ///     .fill("K-", "kaonID > 0.6")
    ///     .fill("pi+", "pionID > 0.3")
    ///     .reconstruct("D+ -> K- pi+ pi+", "1.83965 < M < 1.89965");
    /// let pipeline = Pipeline::new(&config).unwrap();
    /// assert_eq!(pipeline.columns(), &["M"]);
    /// ```
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let variables = VariableManager::from_config(&config.variables)?;

        let mut known: HashSet<String> = HashSet::new();
        // Lists holding a species and its antiparticle
        let mut mixed: HashSet<String> = HashSet::new();
        let mut with_roe: HashSet<String> = HashSet::new();
        let mut patterns: Vec<DecayPattern> = Vec::new();
        let mut masks: HashMap<String, Vec<RoeMask>> = HashMap::new();
        let mut steps = Vec::with_capacity(config.steps.len());

        for step in &config.steps {
            let stage = match step {
                StepConfig::Fill { list, cut } | StepConfig::FillFromMc { list, cut } => {
                    let fill = match step {
                        StepConfig::Fill { .. } => ListFill::new(list, cut, &variables)?,
                        _ => ListFill::generated(list, cut, &variables)?,
                    };
                    produce(&mut known, list)?;
                    Stage::Fill(fill)
                }
                StepConfig::Reconstruct { decay, cut, charge_conjugate }
                | StepConfig::ReconstructMc { decay, cut, charge_conjugate } => {
                    let mut pattern = DecayPattern::parse(decay, cut, &variables)?;
                    if matches!(step, StepConfig::ReconstructMc { .. }) {
                        pattern = pattern.generated();
                    }
                    if let Some(missing) = pattern.daughters().iter().find(|d| !known.contains(*d)) {
                        return Err(PipelineError::MalformedPattern(format!(
                            "'{}' needs list '{}', which no earlier step produces",
                            decay, missing
                        )));
                    }
                    let conjugate = if *charge_conjugate {
                        pattern.conjugate(|label| known.contains(label))
                    } else {
                        None
                    };
                    if let Some(conjugate) = &conjugate {
                        check_conjugate_lists(conjugate, &mixed)?;
                    }
                    produce(&mut known, pattern.parent())?;
                    if conjugate.is_some() {
                        mixed.insert(pattern.parent().to_string());
                    }
                    patterns.push(pattern.clone());
                    Stage::Reconstruct { pattern, conjugate }
                }
                StepConfig::Select { list, cut } => {
                    require(&known, list)?;
                    Stage::Select { list: list.clone(), cut: Cut::compile(cut, &variables)? }
                }
                StepConfig::MatchTruth { list } => {
                    require(&known, list)?;
                    Stage::MatchTruth { list: list.clone() }
                }
                StepConfig::VertexFit { list, options } => {
                    require(&known, list)?;
                    Stage::VertexFit { list: list.clone(), options: options.clone() }
                }
                StepConfig::RestOfEvent { list, masks: configs } => {
                    require(&known, list)?;
                    let registered = masks.entry(list.clone()).or_default();
                    for mask in configs {
                        if registered.iter().any(|m| m.name() == mask.name) {
                            return Err(PipelineError::InvalidConfig(format!(
                                "mask '{}' registered twice on '{}'",
                                mask.name, list
                            )));
                        }
                        registered.push(RoeMask::compile(mask, &variables)?);
                    }
                    with_roe.insert(list.clone());
                    Stage::RestOfEvent { list: list.clone() }
                }
                StepConfig::ContinuumSuppression { list, mask } => {
                    require(&known, list)?;
                    if !with_roe.contains(list) {
                        return Err(PipelineError::InvalidConfig(format!(
                            "continuum suppression on '{}' needs an earlier rest_of_event step",
                            list
                        )));
                    }
                    let mask = match mask {
                        Some(name) => Some(
                            masks
                                .get(list)
                                .and_then(|m| m.iter().find(|m| m.name() == name))
                                .cloned()
                                .ok_or_else(|| {
                                    PipelineError::InvalidConfig(format!(
                                        "no mask '{}' registered on '{}'",
                                        name, list
                                    ))
                                })?,
                        ),
                        None => None,
                    };
                    Stage::ContinuumSuppression { list: list.clone(), mask }
                }
            };
            log::debug!("Compiled step: {}", step.describe());
            steps.push(Step { name: step.describe(), stage });
        }

        require(&known, &config.output.list)?;
        let tabulator = Tabulator::new(&config.output, &variables)?;
        if let Some(root) = tabulator.descriptor() {
            check_descriptor(root, &patterns)?;
        }

        log::info!(
            "Pipeline compiled: {} steps, table '{}' with {} columns",
            steps.len(),
            tabulator.table(),
            tabulator.columns().len()
        );

        Ok(Self { beam: config.beam, variables, steps, tabulator })
    }

    /// Output table name
    pub fn table(&self) -> &str {
        self.tabulator.table()
    }

    /// Output value columns, in row order
    pub fn columns(&self) -> &[String] {
        self.tabulator.columns()
    }

    pub fn beam(&self) -> &Beam {
        &self.beam
    }

    pub fn variables(&self) -> &VariableManager {
        &self.variables
    }

    /// Step names, in execution order
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    /// Run every step on one event and flatten the output list
    ///
    /// Invalid input records fail with [`PipelineError::InvalidInput`]; any
    /// other error means the configuration cannot be applied and should abort
    /// the run.
    pub fn process_event(&self, record: EventRecord) -> Result<EventOutput> {
        let mut event = Event::from_record(record, self.beam)?;
        let mut counts = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let started = Instant::now();
            let (input, output) = self.run_step(&step.stage, &mut event)?;
            log::trace!("event {}: {}: {} -> {}", event.number, step.name, input, output);
            counts.push(StepCount { input, output, elapsed: started.elapsed() });
        }

        let rows = self.tabulator.rows(&event, &self.variables)?;
        Ok(EventOutput { event: event.number, rows, counts })
    }

    fn run_step(&self, stage: &Stage, event: &mut Event) -> Result<(usize, usize)> {
        let provider = &self.variables;
        match stage {
            Stage::Fill(fill) => filler::fill(fill, event, provider),
            Stage::Reconstruct { pattern, conjugate } => {
                let mut stats = assembler::assemble(pattern, event, provider)?;
                if let Some(conjugate) = conjugate {
                    stats.merge(&assembler::assemble(conjugate, event, provider)?);
                }
                Ok((stats.built, stats.accepted))
            }
            Stage::Select { list, cut } => {
                let ids = event.store.get(list)?;
                let before = ids.len();
                let kept: Vec<_> =
                    ids.iter().copied().filter(|id| cut.passes(provider, event, *id)).collect();
                let after = kept.len();
                event.store.replace(list, kept)?;
                Ok((before, after))
            }
            Stage::MatchTruth { list } => {
                let summary = truth::match_list(event, list)?;
                Ok((summary.total(), summary.exact))
            }
            Stage::VertexFit { list, options } => {
                let summary = fitter::fit_list(event, list, options)?;
                event.store.retain(list, |c| c.survives())?;
                Ok((summary.converged + summary.failed, summary.converged))
            }
            Stage::RestOfEvent { list } => {
                let built = roe::build_rest_of_event(event, list)?;
                Ok((built, built))
            }
            Stage::ContinuumSuppression { list, mask } => {
                let total = event.store.get(list)?.len();
                let built =
                    continuum::build_continuum_suppression(event, list, mask.as_ref(), provider)?;
                Ok((total, built))
            }
        }
    }

    /// Process a sequence of events, writing rows to a sink in event order
    ///
    /// Events with invalid input are skipped with a warning; configuration
    /// errors abort the run.
    pub fn run<I>(&self, events: I, sink: &mut dyn RowSink) -> Result<RunStatistics>
    where
        I: IntoIterator<Item = EventRecord>,
    {
        sink.begin(self.table(), self.columns())?;
        let mut stats = RunStatistics::new(self);

        for record in events {
            let number = record.event;
            stats.consume(number, self.process_event(record), sink)?;
        }

        sink.finish()?;
        log::info!(
            "Processed {} events ({} skipped), wrote {} rows",
            stats.events,
            stats.skipped,
            stats.rows
        );
        Ok(stats)
    }
}

fn produce(known: &mut HashSet<String>, list: &str) -> Result<()> {
    if !known.insert(list.to_string()) {
        return Err(PipelineError::InvalidConfig(format!(
            "list '{}' is produced by more than one step",
            list
        )));
    }
    Ok(())
}

/// A conjugate slot reading the original list needs that list to hold both charges
fn check_conjugate_lists(conjugate: &DecayPattern, mixed: &HashSet<String>) -> Result<()> {
    for (label, species) in conjugate.daughters().iter().zip(conjugate.daughter_species()) {
        if particles::species_name(label) != species.name && !mixed.contains(label) {
            return Err(PipelineError::MalformedPattern(format!(
                "the conjugate of '{}' needs list '{}', which no earlier step produces",
                conjugate.parent(),
                particles::conjugate_label(label)
            )));
        }
    }
    Ok(())
}

fn require(known: &HashSet<String>, list: &str) -> Result<()> {
    if known.contains(list) {
        Ok(())
    } else {
        Err(PipelineError::UnknownList(list.to_string()))
    }
}

/// Every expanded node of the descriptor must correspond to a reconstructed
/// pattern with the same daughter species
fn check_descriptor(node: &DescriptorNode, patterns: &[DecayPattern]) -> Result<()> {
    if node.daughters.is_empty() {
        return Ok(());
    }
    let pattern = patterns.iter().find(|p| p.parent() == node.label).ok_or_else(|| {
        PipelineError::RoleResolution {
            role: node.label.clone(),
            reason: "no step reconstructs this list".to_string(),
        }
    })?;

    let mut expected: Vec<&str> =
        pattern.daughters().iter().map(|d| particles::species_name(d)).collect();
    let mut written: Vec<&str> = node.daughters.iter().map(|d| d.species()).collect();
    expected.sort_unstable();
    written.sort_unstable();
    if expected != written {
        return Err(PipelineError::RoleResolution {
            role: node.label.clone(),
            reason: format!("descriptor daughters do not match '{}'", pattern),
        });
    }

    node.daughters.iter().try_for_each(|d| check_descriptor(d, patterns))
}
