//! Builds the runtime graph from a declarative analysis model.
//!
//! The per-event operator arrays must end up sorted by (rank, kind).
//! Ranks follow from the model alone, but validating and wiring happens
//! in two passes the same way the arenas are meant to be used:
//!
//! 1. build into a scratch arena, recording each produced operator's kind;
//! 2. sort the build order by (rank, kind);
//! 3. reset the scratch arena and rebuild in sorted order into the
//!    destination arena.
//!
//! Operators missing a required input, referencing unknown nodes or
//! participating in a reference cycle are dropped together with all
//! transitively dependent operators.
//!
//! Histogram storage is allocated from a separate long-lived arena and
//! reused across rebuilds via the [`HistoRegistry`], keyed by
//! `(operator id, slot)`.

use std::collections::HashMap;

use core_arena::{Arena, ArenaError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::datafilter::{make_filter, FilterError, MultiWordFilter};
use crate::extractor::Extractor;
use crate::histo::{H1D, H2D};
use crate::model::{
    AggregateOpModel, AnalysisModel, InputModel, OperatorKindModel, OperatorModel, RectOpModel,
};
use crate::operators::{
    make_aggregate_max, make_aggregate_mean, make_aggregate_min, make_aggregate_multiplicity,
    make_aggregate_sigma, make_aggregate_sum, make_array_map, make_binary_equation,
    make_calibration, make_condition_filter, make_difference, make_difference_idx, make_h1d_sink,
    make_h2d_sink, make_keep_previous, make_range_filter, make_rect_filter, ConditionOp, Mapping,
    Operator, Thresholds, BINARY_EQUATION_COUNT,
};
use crate::param::{ParamVec, PipeVectors};
use crate::runtime::Runtime;
use crate::MAX_EVENTS;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Arena(#[from] ArenaError),

    #[error("node {id}: {source}")]
    Filter { id: u32, source: FilterError },

    #[error("duplicate node id {0}")]
    DuplicateId(u32),

    #[error("node {id}: event index {event_index} exceeds the supported maximum")]
    EventIndexOutOfRange { id: u32, event_index: usize },

    #[error("operator {id}: expected {expected} inputs, got {got}")]
    InputCountMismatch { id: u32, expected: usize, got: usize },

    #[error("operator {id}: input sizes do not match")]
    InputSizeMismatch { id: u32 },

    #[error("operator {id}: parameter index {param_index} out of range")]
    ParamIndexOutOfRange { id: u32, param_index: usize },

    #[error("operator {id}: equation index {equation} outside the equation table")]
    BadEquationIndex { id: u32, equation: usize },

    #[error("operator {id}: output index {output} out of range")]
    OutputIndexOutOfRange { id: u32, output: usize },

    #[error("operator {id}: histogram bin count must be non-zero")]
    BadBinCount { id: u32 },
}

/// Keeps histogram backing storage alive across analysis rebuilds so the
/// accumulated contents survive.
#[derive(Default)]
pub struct HistoRegistry {
    entries: HashMap<(u32, u32), ParamVec>,
}

impl HistoRegistry {
    pub fn new() -> HistoRegistry {
        HistoRegistry::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn storage(
        &mut self,
        arena: &mut Arena,
        op_id: u32,
        slot: u32,
        len: usize,
    ) -> Result<ParamVec, ArenaError> {
        if let Some(pv) = self.entries.get(&(op_id, slot)) {
            if pv.len() == len {
                return Ok(*pv);
            }
        }

        let pv = ParamVec::push(arena, len, 0.0)?;
        self.entries.insert((op_id, slot), pv);
        Ok(pv)
    }
}

/// Builds the runtime from `model`.
///
/// `arena` receives the final graph's parameter storage, `scratch_arena`
/// is used for the first build pass and left reset, `histo_arena` holds
/// histogram contents across rebuilds (paired with `registry`).
pub fn build_runtime(
    model: &AnalysisModel,
    arena: &mut Arena,
    scratch_arena: &mut Arena,
    histo_arena: &mut Arena,
    registry: &mut HistoRegistry,
) -> Result<Runtime, AdapterError> {
    check_ids(model)?;

    let event_count = required_event_count(model)?;
    let mut runtime = Runtime::new(event_count);

    // -------------------------------------------
    // Sources -> extractors, grouped per event and sorted by module.
    // -------------------------------------------

    let mut source_order: Vec<usize> = (0..model.sources.len()).collect();
    source_order.sort_by_key(|&i| (model.sources[i].event_index, model.sources[i].module_index));

    let mut source_pipes: HashMap<u32, PipeVectors> = HashMap::new();

    for &i in &source_order {
        let src = &model.sources[i];

        let mut filter = MultiWordFilter::new();
        for pattern in &src.filters {
            filter
                .add_subfilter(
                    make_filter(pattern).map_err(|source| AdapterError::Filter { id: src.id, source })?,
                )
                .map_err(|source| AdapterError::Filter { id: src.id, source })?;
        }

        // A missing seed derives from the stable node id, keeping runs
        // reproducible without forcing the model to carry seeds.
        let seed = src.rng_seed.unwrap_or(0x9E3779B9 ^ src.id as u64);

        let ex = Extractor::new(
            arena,
            filter,
            src.required_completions,
            seed,
            src.module_index,
        )?;

        source_pipes.insert(src.id, ex.output);
        runtime.extractors[src.event_index].push(ex);
    }

    // -------------------------------------------
    // Operators: rank, drop, two-pass build.
    // -------------------------------------------

    let ranks = compute_ranks(model, &source_pipes);

    let kept: Vec<usize> = (0..model.operators.len())
        .filter(|&i| {
            let op = &model.operators[i];
            let keep = ranks.contains_key(&op.id);
            if !keep {
                warn!(target: "analysis", id = op.id, "dropping operator with unresolved inputs");
            }
            keep
        })
        .collect();

    // Pass 1: scratch build in rank order, recording produced kinds.
    let mut order = kept.clone();
    order.sort_by_key(|&i| (ranks[&model.operators[i].id], i));

    let kinds: HashMap<u32, u8> = {
        let built = build_operators(model, &order, scratch_arena, histo_arena, registry, &source_pipes)?;

        order
            .iter()
            .zip(&built)
            .map(|(&i, op)| (model.operators[i].id, op.kind as u8))
            .collect()
        // The scratch operators drop here; their storage dies with the
        // scratch reset below.
    };

    scratch_arena.reset();

    // Pass 2: final build into the destination arena in (rank, kind)
    // order.
    order.sort_by_key(|&i| {
        let id = model.operators[i].id;
        (ranks[&id], kinds[&id], i)
    });

    let built = build_operators(model, &order, arena, histo_arena, registry, &source_pipes)?;

    for (&i, op) in order.iter().zip(built) {
        let m = &model.operators[i];
        runtime.operators[m.event_index].push(op);
        runtime.ranks[m.event_index].push(ranks[&m.id]);
    }

    debug!(
        target: "analysis",
        events = event_count,
        sources = model.sources.len(),
        operators = kept.len(),
        dropped = model.operators.len() - kept.len(),
        "analysis built"
    );

    Ok(runtime)
}

fn check_ids(model: &AnalysisModel) -> Result<(), AdapterError> {
    let mut seen = std::collections::HashSet::new();

    for id in model
        .sources
        .iter()
        .map(|s| s.id)
        .chain(model.operators.iter().map(|o| o.id))
    {
        if !seen.insert(id) {
            return Err(AdapterError::DuplicateId(id));
        }
    }

    Ok(())
}

fn required_event_count(model: &AnalysisModel) -> Result<usize, AdapterError> {
    let mut count = 0usize;

    for (id, ei) in model
        .sources
        .iter()
        .map(|s| (s.id, s.event_index))
        .chain(model.operators.iter().map(|o| (o.id, o.event_index)))
    {
        if ei >= MAX_EVENTS {
            return Err(AdapterError::EventIndexOutOfRange { id, event_index: ei });
        }
        count = count.max(ei + 1);
    }

    Ok(count)
}

/// Rank per operator id: sources are rank 0, an operator is one above its
/// highest input. Operators with unresolved inputs or inside a reference
/// cycle get no rank and are dropped.
fn compute_ranks(
    model: &AnalysisModel,
    source_pipes: &HashMap<u32, PipeVectors>,
) -> HashMap<u32, u32> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Visiting,
        Done(u32),
        Dropped,
    }

    let by_id: HashMap<u32, &OperatorModel> =
        model.operators.iter().map(|o| (o.id, o)).collect();

    fn rank_of(
        id: u32,
        by_id: &HashMap<u32, &OperatorModel>,
        source_pipes: &HashMap<u32, PipeVectors>,
        states: &mut HashMap<u32, State>,
    ) -> Option<u32> {
        if source_pipes.contains_key(&id) {
            return Some(0);
        }

        match states.get(&id) {
            Some(State::Done(r)) => return Some(*r),
            Some(State::Dropped) | Some(State::Visiting) => return None,
            None => {}
        }

        let Some(op) = by_id.get(&id) else {
            return None;
        };

        if op.inputs.is_empty() {
            states.insert(id, State::Dropped);
            return None;
        }

        states.insert(id, State::Visiting);

        let mut max_input_rank = 0u32;

        for input in &op.inputs {
            match rank_of(input.source, by_id, source_pipes, states) {
                Some(r) => max_input_rank = max_input_rank.max(r),
                None => {
                    states.insert(id, State::Dropped);
                    return None;
                }
            }
        }

        let rank = max_input_rank + 1;
        states.insert(id, State::Done(rank));
        Some(rank)
    }

    let mut states = HashMap::new();
    let mut ranks = HashMap::new();

    for op in &model.operators {
        if let Some(r) = rank_of(op.id, &by_id, source_pipes, &mut states) {
            ranks.insert(op.id, r);
        }
    }

    ranks
}

/// Builds the operators named by `order` into `arena`, wiring inputs from
/// extractor outputs and previously built operators of the same pass.
fn build_operators(
    model: &AnalysisModel,
    order: &[usize],
    arena: &mut Arena,
    histo_arena: &mut Arena,
    registry: &mut HistoRegistry,
    source_pipes: &HashMap<u32, PipeVectors>,
) -> Result<Vec<Operator>, AdapterError> {
    let mut built: Vec<Operator> = Vec::with_capacity(order.len());
    let mut outputs: HashMap<u32, Vec<PipeVectors>> = HashMap::new();

    for (&id, &pipe) in source_pipes {
        outputs.insert(id, vec![pipe]);
    }

    for &i in order {
        let m = &model.operators[i];
        let op = build_one(m, arena, histo_arena, registry, &outputs)?;
        outputs.insert(m.id, op.outputs.clone());
        built.push(op);
    }

    Ok(built)
}

fn resolve_pipe(
    m: &OperatorModel,
    input: &InputModel,
    outputs: &HashMap<u32, Vec<PipeVectors>>,
) -> Result<PipeVectors, AdapterError> {
    let pipes = outputs
        .get(&input.source)
        .expect("inputs were resolved during rank computation");

    pipes
        .get(input.output)
        .copied()
        .ok_or(AdapterError::OutputIndexOutOfRange {
            id: m.id,
            output: input.output,
        })
}

fn expect_inputs(m: &OperatorModel, expected: usize) -> Result<(), AdapterError> {
    if m.inputs.len() != expected {
        return Err(AdapterError::InputCountMismatch {
            id: m.id,
            expected,
            got: m.inputs.len(),
        });
    }
    Ok(())
}

fn slot_index(m: &OperatorModel, input: &InputModel, pipe: &PipeVectors) -> Result<usize, AdapterError> {
    let index = input.param_index.unwrap_or(0);

    if index >= pipe.len() {
        return Err(AdapterError::ParamIndexOutOfRange {
            id: m.id,
            param_index: index,
        });
    }

    Ok(index)
}

fn build_one(
    m: &OperatorModel,
    arena: &mut Arena,
    histo_arena: &mut Arena,
    registry: &mut HistoRegistry,
    outputs: &HashMap<u32, Vec<PipeVectors>>,
) -> Result<Operator, AdapterError> {
    let op = match &m.kind {
        OperatorKindModel::Calibration { unit_min, unit_max } => {
            expect_inputs(m, 1)?;
            let input = resolve_pipe(m, &m.inputs[0], outputs)?;
            make_calibration(arena, input, *unit_min, *unit_max)?
        }

        OperatorKindModel::KeepPrevious { keep_valid } => {
            expect_inputs(m, 1)?;
            let input = resolve_pipe(m, &m.inputs[0], outputs)?;
            make_keep_previous(arena, input, *keep_valid)?
        }

        OperatorKindModel::Difference => {
            expect_inputs(m, 2)?;
            let a = resolve_pipe(m, &m.inputs[0], outputs)?;
            let b = resolve_pipe(m, &m.inputs[1], outputs)?;

            let indexed = m.inputs[0].param_index.is_some() || m.inputs[1].param_index.is_some();

            if indexed {
                let ia = slot_index(m, &m.inputs[0], &a)?;
                let ib = slot_index(m, &m.inputs[1], &b)?;
                make_difference_idx(arena, a, b, ia, ib)?
            } else {
                if a.len() != b.len() {
                    return Err(AdapterError::InputSizeMismatch { id: m.id });
                }
                make_difference(arena, a, b)?
            }
        }

        OperatorKindModel::ArrayMap { mappings } => {
            if m.inputs.is_empty() {
                return Err(AdapterError::InputCountMismatch { id: m.id, expected: 1, got: 0 });
            }

            let inputs: Vec<PipeVectors> = m
                .inputs
                .iter()
                .map(|input| resolve_pipe(m, input, outputs))
                .collect::<Result<_, _>>()?;

            for mapping in mappings {
                let pipe = inputs.get(mapping.input_index).ok_or(
                    AdapterError::InputCountMismatch {
                        id: m.id,
                        expected: mapping.input_index + 1,
                        got: inputs.len(),
                    },
                )?;

                if mapping.param_index >= pipe.len() {
                    return Err(AdapterError::ParamIndexOutOfRange {
                        id: m.id,
                        param_index: mapping.param_index,
                    });
                }
            }

            let mappings = mappings
                .iter()
                .map(|mm| Mapping {
                    input_index: mm.input_index,
                    param_index: mm.param_index,
                })
                .collect();

            make_array_map(arena, inputs, mappings)?
        }

        OperatorKindModel::BinaryEquation { equation, output_lower, output_upper } => {
            expect_inputs(m, 2)?;

            if *equation >= BINARY_EQUATION_COUNT {
                return Err(AdapterError::BadEquationIndex { id: m.id, equation: *equation });
            }

            let a = resolve_pipe(m, &m.inputs[0], outputs)?;
            let b = resolve_pipe(m, &m.inputs[1], outputs)?;

            if a.len() != b.len() {
                return Err(AdapterError::InputSizeMismatch { id: m.id });
            }

            make_binary_equation(arena, a, b, *equation, *output_lower, *output_upper)?
        }

        OperatorKindModel::Aggregate { op, threshold_min, threshold_max } => {
            expect_inputs(m, 1)?;
            let input = resolve_pipe(m, &m.inputs[0], outputs)?;

            let thresholds = Thresholds {
                min: threshold_min.unwrap_or(f64::NAN),
                max: threshold_max.unwrap_or(f64::NAN),
            };

            match op {
                AggregateOpModel::Sum => make_aggregate_sum(arena, input, thresholds)?,
                AggregateOpModel::Mean => make_aggregate_mean(arena, input, thresholds)?,
                AggregateOpModel::Sigma => make_aggregate_sigma(arena, input, thresholds)?,
                AggregateOpModel::Min => make_aggregate_min(arena, input, thresholds)?,
                AggregateOpModel::Max => make_aggregate_max(arena, input, thresholds)?,
                AggregateOpModel::Multiplicity => {
                    make_aggregate_multiplicity(arena, input, thresholds)?
                }
            }
        }

        OperatorKindModel::RangeFilter { min, max, keep_outside } => {
            expect_inputs(m, 1)?;
            let input = resolve_pipe(m, &m.inputs[0], outputs)?;
            make_range_filter(arena, input, *min, *max, *keep_outside)?
        }

        OperatorKindModel::RectFilter { x_min, x_max, y_min, y_max, op } => {
            expect_inputs(m, 2)?;
            let x = resolve_pipe(m, &m.inputs[0], outputs)?;
            let y = resolve_pipe(m, &m.inputs[1], outputs)?;
            let xi = slot_index(m, &m.inputs[0], &x)?;
            let yi = slot_index(m, &m.inputs[1], &y)?;

            let op = match op {
                RectOpModel::And => ConditionOp::And,
                RectOpModel::Or => ConditionOp::Or,
            };

            make_rect_filter(arena, x, y, xi, yi, *x_min, *x_max, *y_min, *y_max, op)?
        }

        OperatorKindModel::ConditionFilter { inverted } => {
            expect_inputs(m, 2)?;
            let data = resolve_pipe(m, &m.inputs[0], outputs)?;
            let condition = resolve_pipe(m, &m.inputs[1], outputs)?;

            if condition.len() != data.len() && condition.len() != 1 {
                return Err(AdapterError::InputSizeMismatch { id: m.id });
            }

            make_condition_filter(arena, data, condition, *inverted)?
        }

        OperatorKindModel::H1DSink { bin_count } => {
            expect_inputs(m, 1)?;

            if *bin_count == 0 {
                return Err(AdapterError::BadBinCount { id: m.id });
            }

            let input = resolve_pipe(m, &m.inputs[0], outputs)?;

            let mut histos = Vec::with_capacity(input.len());

            for slot in 0..input.len() {
                let storage = registry.storage(histo_arena, m.id, slot as u32, *bin_count)?;
                histos.push(H1D::with_storage(
                    storage,
                    input.lower_limits.get(slot),
                    input.upper_limits.get(slot),
                ));
            }

            make_h1d_sink(input, histos)
        }

        OperatorKindModel::H2DSink { x_bins, y_bins } => {
            expect_inputs(m, 2)?;

            if *x_bins == 0 || *y_bins == 0 {
                return Err(AdapterError::BadBinCount { id: m.id });
            }

            let x = resolve_pipe(m, &m.inputs[0], outputs)?;
            let y = resolve_pipe(m, &m.inputs[1], outputs)?;
            let xi = slot_index(m, &m.inputs[0], &x)?;
            let yi = slot_index(m, &m.inputs[1], &y)?;

            let storage = registry.storage(histo_arena, m.id, 0, x_bins * y_bins)?;

            let histo = H2D::with_storage(
                storage,
                *x_bins,
                x.lower_limits.get(xi),
                x.upper_limits.get(xi),
                *y_bins,
                y.lower_limits.get(yi),
                y.upper_limits.get(yi),
            );

            make_h2d_sink(x, y, xi, yi, histo)
        }
    };

    Ok(op)
}
