//! The closed set of dataflow operators.
//!
//! An operator owns its output pipes and holds copyable handles to the
//! pipes of its producers. Stepping is a bounded computation over those
//! arrays; invalid inputs propagate to invalid outputs throughout.

use core_arena::{Arena, ArenaError};

use crate::histo::{H1D, H2D};
use crate::param::{invalid_param, is_param_valid, ParamVec, PipeVectors};

/// Kind tag. The discriminant is the secondary sort key of the per-event
/// operator array (after rank), keeping equal-kind operators adjacent for
/// the step loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum OperatorKind {
    Calibration = 0,
    KeepPrevious = 1,
    Difference = 2,
    ArrayMap = 3,
    BinaryEquation = 4,
    AggregateSum = 5,
    AggregateMean = 6,
    AggregateSigma = 7,
    AggregateMin = 8,
    AggregateMax = 9,
    AggregateMultiplicity = 10,
    RangeFilter = 11,
    RectFilter = 12,
    ConditionFilter = 13,
    H1DSink = 14,
    H2DSink = 15,
}

/// Inclusive value window restricting which slots participate in an
/// aggregation.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub min: f64,
    pub max: f64,
}

#[inline]
fn is_valid_and_inside(param: f64, thresholds: Thresholds) -> bool {
    is_param_valid(param) && thresholds.min <= param && param <= thresholds.max
}

/// One output slot assignment of an array map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub input_index: usize,
    pub param_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOp {
    And,
    Or,
}

/// Kind-specific immutable state.
#[derive(Debug)]
pub enum OperatorData {
    None,
    Calibration {
        factors: ParamVec,
    },
    KeepPrevious {
        previous: ParamVec,
        keep_valid: bool,
    },
    Difference {
        /// `None` steps the full arrays elementwise; `Some((a, b))` takes
        /// one slot from each side into a single output slot.
        indices: Option<(usize, usize)>,
    },
    ArrayMap {
        mappings: Vec<Mapping>,
    },
    BinaryEquation {
        equation: usize,
    },
    Aggregate {
        thresholds: Thresholds,
    },
    RangeFilter {
        min: f64,
        max: f64,
        keep_outside: bool,
    },
    RectFilter {
        x_index: usize,
        y_index: usize,
        x_min: f64,
        x_max: f64,
        y_min: f64,
        y_max: f64,
        op: ConditionOp,
    },
    ConditionFilter {
        inverted: bool,
    },
    H1DSink {
        histos: Vec<H1D>,
    },
    H2DSink {
        histo: H2D,
        x_index: usize,
        y_index: usize,
    },
}

#[derive(Debug)]
pub struct Operator {
    pub kind: OperatorKind,
    pub inputs: Vec<PipeVectors>,
    pub outputs: Vec<PipeVectors>,
    pub data: OperatorData,
}

/* ===============================================
 * Construction
 * =============================================== */

/// y = (x - xLo) * k + cLo with k = (cHi - cLo) / (xHi - xLo), precomputed
/// per slot.
pub fn make_calibration(
    arena: &mut Arena,
    input: PipeVectors,
    unit_min: f64,
    unit_max: f64,
) -> Result<Operator, ArenaError> {
    let size = input.len();
    let output = PipeVectors::push(arena, size, unit_min, unit_max)?;
    let factors = ParamVec::push(arena, size, 0.0)?;

    let calib_range = unit_max - unit_min;

    for i in 0..size {
        let param_range = input.upper_limits.get(i) - input.lower_limits.get(i);
        factors.set(i, calib_range / param_range);
    }

    Ok(Operator {
        kind: OperatorKind::Calibration,
        inputs: vec![input],
        outputs: vec![output],
        data: OperatorData::Calibration { factors },
    })
}

/// Output holds the input of the previous event. With `keep_valid`, valid
/// previous values are not overwritten by invalid current ones.
pub fn make_keep_previous(
    arena: &mut Arena,
    input: PipeVectors,
    keep_valid: bool,
) -> Result<Operator, ArenaError> {
    let size = input.len();
    let output = PipeVectors::push(arena, size, 0.0, 0.0)?;

    copy_limits(&input, &output);

    let previous = ParamVec::push_invalid(arena, size)?;

    Ok(Operator {
        kind: OperatorKind::KeepPrevious,
        inputs: vec![input],
        outputs: vec![output],
        data: OperatorData::KeepPrevious { previous, keep_valid },
    })
}

fn copy_limits(from: &PipeVectors, to: &PipeVectors) {
    for i in 0..from.len() {
        to.lower_limits.set(i, from.lower_limits.get(i));
        to.upper_limits.set(i, from.upper_limits.get(i));
    }
}

pub fn make_difference(
    arena: &mut Arena,
    input_a: PipeVectors,
    input_b: PipeVectors,
) -> Result<Operator, ArenaError> {
    debug_assert_eq!(input_a.len(), input_b.len());

    let size = input_a.len();
    let output = PipeVectors::push(arena, size, 0.0, 0.0)?;

    for i in 0..size {
        output
            .lower_limits
            .set(i, input_a.lower_limits.get(i) - input_b.upper_limits.get(i));
        output
            .upper_limits
            .set(i, input_a.upper_limits.get(i) - input_b.lower_limits.get(i));
    }

    Ok(Operator {
        kind: OperatorKind::Difference,
        inputs: vec![input_a, input_b],
        outputs: vec![output],
        data: OperatorData::Difference { indices: None },
    })
}

pub fn make_difference_idx(
    arena: &mut Arena,
    input_a: PipeVectors,
    input_b: PipeVectors,
    index_a: usize,
    index_b: usize,
) -> Result<Operator, ArenaError> {
    debug_assert!(index_a < input_a.len());
    debug_assert!(index_b < input_b.len());

    let output = PipeVectors::push(arena, 1, 0.0, 0.0)?;

    output.lower_limits.set(
        0,
        input_a.lower_limits.get(index_a) - input_b.upper_limits.get(index_b),
    );
    output.upper_limits.set(
        0,
        input_a.upper_limits.get(index_a) - input_b.lower_limits.get(index_b),
    );

    Ok(Operator {
        kind: OperatorKind::Difference,
        inputs: vec![input_a, input_b],
        outputs: vec![output],
        data: OperatorData::Difference {
            indices: Some((index_a, index_b)),
        },
    })
}

/// Concatenates and/or permutes slots of one or more inputs. Mappings are
/// copied; inputs are referenced.
pub fn make_array_map(
    arena: &mut Arena,
    inputs: Vec<PipeVectors>,
    mappings: Vec<Mapping>,
) -> Result<Operator, ArenaError> {
    let output = PipeVectors::push(arena, mappings.len(), 0.0, 0.0)?;

    for (mi, m) in mappings.iter().enumerate() {
        output
            .lower_limits
            .set(mi, inputs[m.input_index].lower_limits.get(m.param_index));
        output
            .upper_limits
            .set(mi, inputs[m.input_index].upper_limits.get(m.param_index));
    }

    Ok(Operator {
        kind: OperatorKind::ArrayMap,
        inputs,
        outputs: vec![output],
        data: OperatorData::ArrayMap { mappings },
    })
}

type BinaryEquationFn = fn(f64, f64) -> f64;

/// The closed equation set, indexed by the model's equation number.
const BINARY_EQUATION_TABLE: [BinaryEquationFn; 6] = [
    |a, b| a + b,
    |a, b| a - b,
    |a, b| (a + b) / (a - b),
    |a, b| (a - b) / (a + b),
    |a, b| a / (a - b),
    |a, b| (a - b) / a,
];

pub const BINARY_EQUATION_COUNT: usize = BINARY_EQUATION_TABLE.len();

pub fn make_binary_equation(
    arena: &mut Arena,
    input_a: PipeVectors,
    input_b: PipeVectors,
    equation: usize,
    output_lower: f64,
    output_upper: f64,
) -> Result<Operator, ArenaError> {
    debug_assert!(equation < BINARY_EQUATION_COUNT);
    debug_assert_eq!(input_a.len(), input_b.len());

    let output = PipeVectors::push(arena, input_a.len(), output_lower, output_upper)?;

    Ok(Operator {
        kind: OperatorKind::BinaryEquation,
        inputs: vec![input_a, input_b],
        outputs: vec![output],
        data: OperatorData::BinaryEquation { equation },
    })
}

/// Shared part of the aggregate constructors. NaN threshold bounds fall
/// back to the tightest limits of the input, which saves the NaN test in
/// the step loop.
fn make_aggregate(
    arena: &mut Arena,
    input: PipeVectors,
    kind: OperatorKind,
    mut thresholds: Thresholds,
) -> Result<Operator, ArenaError> {
    if thresholds.min.is_nan() {
        thresholds.min = input.lower_limits.min_element();
    }

    if thresholds.max.is_nan() {
        thresholds.max = input.upper_limits.max_element();
    }

    let output = PipeVectors::push(arena, 1, 0.0, 0.0)?;

    Ok(Operator {
        kind,
        inputs: vec![input],
        outputs: vec![output],
        data: OperatorData::Aggregate { thresholds },
    })
}

pub fn make_aggregate_sum(
    arena: &mut Arena,
    input: PipeVectors,
    thresholds: Thresholds,
) -> Result<Operator, ArenaError> {
    let result = make_aggregate(arena, input, OperatorKind::AggregateSum, thresholds)?;

    let mut lower = 0.0;
    let mut upper = 0.0;

    for i in 0..input.len() {
        let lo = input.lower_limits.get(i);
        let hi = input.upper_limits.get(i);
        lower += lo.min(hi);
        upper += lo.max(hi);
    }

    result.outputs[0].lower_limits.set(0, lower);
    result.outputs[0].upper_limits.set(0, upper);

    Ok(result)
}

pub fn make_aggregate_multiplicity(
    arena: &mut Arena,
    input: PipeVectors,
    thresholds: Thresholds,
) -> Result<Operator, ArenaError> {
    let result = make_aggregate(arena, input, OperatorKind::AggregateMultiplicity, thresholds)?;

    result.outputs[0].lower_limits.set(0, 0.0);
    result.outputs[0].upper_limits.set(0, input.len() as f64);

    Ok(result)
}

fn limit_extrema(input: &PipeVectors) -> (f64, f64) {
    let lo = input
        .lower_limits
        .min_element()
        .min(input.upper_limits.min_element());
    let hi = input
        .lower_limits
        .max_element()
        .max(input.upper_limits.max_element());
    (lo, hi)
}

pub fn make_aggregate_max(
    arena: &mut Arena,
    input: PipeVectors,
    thresholds: Thresholds,
) -> Result<Operator, ArenaError> {
    let result = make_aggregate(arena, input, OperatorKind::AggregateMax, thresholds)?;
    let (lo, hi) = limit_extrema(&input);
    result.outputs[0].lower_limits.set(0, lo);
    result.outputs[0].upper_limits.set(0, hi);
    Ok(result)
}

pub fn make_aggregate_min(
    arena: &mut Arena,
    input: PipeVectors,
    thresholds: Thresholds,
) -> Result<Operator, ArenaError> {
    let result = make_aggregate(arena, input, OperatorKind::AggregateMin, thresholds)?;
    let (lo, hi) = limit_extrema(&input);
    result.outputs[0].lower_limits.set(0, lo);
    result.outputs[0].upper_limits.set(0, hi);
    Ok(result)
}

pub fn make_aggregate_mean(
    arena: &mut Arena,
    input: PipeVectors,
    thresholds: Thresholds,
) -> Result<Operator, ArenaError> {
    let result = make_aggregate(arena, input, OperatorKind::AggregateMean, thresholds)?;
    let (lo, hi) = limit_extrema(&input);
    result.outputs[0].lower_limits.set(0, lo);
    result.outputs[0].upper_limits.set(0, hi);
    Ok(result)
}

pub fn make_aggregate_sigma(
    arena: &mut Arena,
    input: PipeVectors,
    thresholds: Thresholds,
) -> Result<Operator, ArenaError> {
    let result = make_aggregate(arena, input, OperatorKind::AggregateSigma, thresholds)?;
    let (lo, hi) = limit_extrema(&input);
    result.outputs[0].lower_limits.set(0, 0.0);
    result.outputs[0].upper_limits.set(0, hi - lo);
    Ok(result)
}

/// Values inside `[min, max)` pass through, others become invalid. With
/// `keep_outside` the test is inverted.
pub fn make_range_filter(
    arena: &mut Arena,
    input: PipeVectors,
    min: f64,
    max: f64,
    keep_outside: bool,
) -> Result<Operator, ArenaError> {
    let size = input.len();
    let output = if keep_outside {
        let out = PipeVectors::push(arena, size, 0.0, 0.0)?;
        copy_limits(&input, &out);
        out
    } else {
        PipeVectors::push(arena, size, min, max)?
    };

    Ok(Operator {
        kind: OperatorKind::RangeFilter,
        inputs: vec![input],
        outputs: vec![output],
        data: OperatorData::RangeFilter { min, max, keep_outside },
    })
}

/// Tests one (x, y) point against a rectangle; the per-axis interval
/// checks combine under `op`. The single output slot holds a valid marker
/// when the test passes.
#[allow(clippy::too_many_arguments)]
pub fn make_rect_filter(
    arena: &mut Arena,
    x_input: PipeVectors,
    y_input: PipeVectors,
    x_index: usize,
    y_index: usize,
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
    op: ConditionOp,
) -> Result<Operator, ArenaError> {
    debug_assert!(x_index < x_input.len());
    debug_assert!(y_index < y_input.len());

    let output = PipeVectors::push(arena, 1, 0.0, 1.0)?;

    Ok(Operator {
        kind: OperatorKind::RectFilter,
        inputs: vec![x_input, y_input],
        outputs: vec![output],
        data: OperatorData::RectFilter {
            x_index,
            y_index,
            x_min,
            x_max,
            y_min,
            y_max,
            op,
        },
    })
}

/// Gates a data array on a condition array: slots whose condition is
/// invalid become invalid. A single-slot condition gates the whole array.
pub fn make_condition_filter(
    arena: &mut Arena,
    data_input: PipeVectors,
    condition_input: PipeVectors,
    inverted: bool,
) -> Result<Operator, ArenaError> {
    let size = data_input.len();
    let output = PipeVectors::push(arena, size, 0.0, 0.0)?;
    copy_limits(&data_input, &output);

    Ok(Operator {
        kind: OperatorKind::ConditionFilter,
        inputs: vec![data_input, condition_input],
        outputs: vec![output],
        data: OperatorData::ConditionFilter { inverted },
    })
}

/// One histogram per input slot. Histogram storage is the caller's
/// concern; the sink only accumulates into it.
pub fn make_h1d_sink(input: PipeVectors, histos: Vec<H1D>) -> Operator {
    debug_assert_eq!(input.len(), histos.len());

    Operator {
        kind: OperatorKind::H1DSink,
        inputs: vec![input],
        outputs: Vec::new(),
        data: OperatorData::H1DSink { histos },
    }
}

pub fn make_h2d_sink(
    x_input: PipeVectors,
    y_input: PipeVectors,
    x_index: usize,
    y_index: usize,
    histo: H2D,
) -> Operator {
    debug_assert!(x_index < x_input.len());
    debug_assert!(y_index < y_input.len());

    Operator {
        kind: OperatorKind::H2DSink,
        inputs: vec![x_input, y_input],
        outputs: Vec::new(),
        data: OperatorData::H2DSink { histo, x_index, y_index },
    }
}

/* ===============================================
 * Stepping
 * =============================================== */

#[inline]
fn calibrate(param: f64, param_min: f64, calib_min: f64, calib_factor: f64) -> f64 {
    if is_param_valid(param) {
        (param - param_min) * calib_factor + calib_min
    } else {
        param
    }
}

impl Operator {
    pub fn step(&mut self) {
        match &mut self.data {
            OperatorData::None => {}

            OperatorData::Calibration { factors } => {
                let input = &self.inputs[0];
                let output = &self.outputs[0];

                for i in 0..input.len() {
                    output.data.set(
                        i,
                        calibrate(
                            input.data.get(i),
                            input.lower_limits.get(i),
                            output.lower_limits.get(i),
                            factors.get(i),
                        ),
                    );
                }
            }

            OperatorData::KeepPrevious { previous, keep_valid } => {
                let input = self.inputs[0].data;
                let output = self.outputs[0].data;

                for i in 0..input.len() {
                    output.set(i, previous.get(i));
                }

                for i in 0..input.len() {
                    let v = input.get(i);
                    if !*keep_valid || is_param_valid(v) {
                        previous.set(i, v);
                    }
                }
            }

            OperatorData::Difference { indices } => {
                let a = self.inputs[0].data;
                let b = self.inputs[1].data;
                let out = self.outputs[0].data;

                match indices {
                    None => {
                        for i in 0..a.len() {
                            let (va, vb) = (a.get(i), b.get(i));
                            if is_param_valid(va) && is_param_valid(vb) {
                                out.set(i, va - vb);
                            } else {
                                out.set(i, invalid_param());
                            }
                        }
                    }
                    Some((ia, ib)) => {
                        let (va, vb) = (a.get(*ia), b.get(*ib));
                        if is_param_valid(va) && is_param_valid(vb) {
                            out.set(0, va - vb);
                        } else {
                            out.set(0, invalid_param());
                        }
                    }
                }
            }

            OperatorData::ArrayMap { mappings } => {
                let out = self.outputs[0].data;

                for (mi, m) in mappings.iter().enumerate() {
                    out.set(mi, self.inputs[m.input_index].data.get(m.param_index));
                }
            }

            OperatorData::BinaryEquation { equation } => {
                let a = self.inputs[0].data;
                let b = self.inputs[1].data;
                let out = self.outputs[0].data;
                let eq = BINARY_EQUATION_TABLE[*equation];

                for i in 0..a.len() {
                    let (va, vb) = (a.get(i), b.get(i));
                    if is_param_valid(va) && is_param_valid(vb) {
                        out.set(i, eq(va, vb));
                    } else {
                        out.set(i, invalid_param());
                    }
                }
            }

            OperatorData::Aggregate { thresholds } => {
                let input = self.inputs[0].data;
                let out = self.outputs[0].data;
                let t = *thresholds;

                out.set(0, aggregate(self.kind, input, t));
            }

            OperatorData::RangeFilter { min, max, keep_outside } => {
                let input = self.inputs[0].data;
                let out = self.outputs[0].data;

                for i in 0..input.len() {
                    let v = input.get(i);
                    let inside = is_param_valid(v) && *min <= v && v < *max;

                    if is_param_valid(v) && (inside != *keep_outside) {
                        out.set(i, v);
                    } else {
                        out.set(i, invalid_param());
                    }
                }
            }

            OperatorData::RectFilter {
                x_index,
                y_index,
                x_min,
                x_max,
                y_min,
                y_max,
                op,
            } => {
                let x = self.inputs[0].data.get(*x_index);
                let y = self.inputs[1].data.get(*y_index);

                let x_inside = is_param_valid(x) && *x_min <= x && x < *x_max;
                let y_inside = is_param_valid(y) && *y_min <= y && y < *y_max;

                let passes = match op {
                    ConditionOp::And => x_inside && y_inside,
                    ConditionOp::Or => x_inside || y_inside,
                };

                self.outputs[0]
                    .data
                    .set(0, if passes { 1.0 } else { invalid_param() });
            }

            OperatorData::ConditionFilter { inverted } => {
                let data = self.inputs[0].data;
                let condition = self.inputs[1].data;
                let out = self.outputs[0].data;

                for i in 0..data.len() {
                    let ci = if condition.len() == data.len() { i } else { 0 };
                    let pass = is_param_valid(condition.get(ci)) != *inverted;

                    if pass {
                        out.set(i, data.get(i));
                    } else {
                        out.set(i, invalid_param());
                    }
                }
            }

            OperatorData::H1DSink { histos } => {
                let input = self.inputs[0].data;

                for (i, histo) in histos.iter_mut().enumerate() {
                    histo.fill(input.get(i));
                }
            }

            OperatorData::H2DSink { histo, x_index, y_index } => {
                let x = self.inputs[0].data.get(*x_index);
                let y = self.inputs[1].data.get(*y_index);
                histo.fill(x, y);
            }
        }
    }
}

fn aggregate(kind: OperatorKind, input: ParamVec, t: Thresholds) -> f64 {
    match kind {
        OperatorKind::AggregateSum => {
            let mut sum = 0.0;
            for i in 0..input.len() {
                let v = input.get(i);
                if is_valid_and_inside(v, t) {
                    sum += v;
                }
            }
            sum
        }

        OperatorKind::AggregateMultiplicity => {
            let mut count = 0u32;
            for i in 0..input.len() {
                if is_valid_and_inside(input.get(i), t) {
                    count += 1;
                }
            }
            count as f64
        }

        OperatorKind::AggregateMax => {
            let mut max = f64::MIN;
            for i in 0..input.len() {
                let v = input.get(i);
                if is_valid_and_inside(v, t) {
                    max = max.max(v);
                }
            }
            max
        }

        OperatorKind::AggregateMin => {
            let mut min = f64::MAX;
            for i in 0..input.len() {
                let v = input.get(i);
                if is_valid_and_inside(v, t) {
                    min = min.min(v);
                }
            }
            min
        }

        OperatorKind::AggregateMean => match mean_and_count(input, t) {
            Some((mean, _)) => mean,
            None => invalid_param(),
        },

        OperatorKind::AggregateSigma => match mean_and_count(input, t) {
            Some((mean, count)) => {
                let mut sq_sum = 0.0;
                for i in 0..input.len() {
                    let v = input.get(i);
                    if is_valid_and_inside(v, t) {
                        let d = v - mean;
                        sq_sum += d * d;
                    }
                }
                (sq_sum / count as f64).sqrt()
            }
            None => invalid_param(),
        },

        _ => unreachable!("not an aggregate kind"),
    }
}

fn mean_and_count(input: ParamVec, t: Thresholds) -> Option<(f64, u32)> {
    let mut sum = 0.0;
    let mut count = 0u32;

    for i in 0..input.len() {
        let v = input.get(i);
        if is_valid_and_inside(v, t) {
            sum += v;
            count += 1;
        }
    }

    if count == 0 {
        None
    } else {
        Some((sum / count as f64, count))
    }
}
