//! Declarative analysis description.
//!
//! Nodes carry stable integer ids; edges reference them as
//! `(source id, output index)` plus an optional parameter index for
//! operators that select a single slot. The model serializes as JSON and
//! is what the adapter turns into a runtime graph.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisModel {
    #[serde(default)]
    pub sources: Vec<SourceModel>,
    #[serde(default)]
    pub operators: Vec<OperatorModel>,
}

impl AnalysisModel {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<AnalysisModel> {
        serde_json::from_str(json)
    }
}

/// A filter-based data source (extractor) attached to one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceModel {
    pub id: u32,
    pub event_index: usize,
    pub module_index: usize,
    /// Sub-filter patterns, e.g. `"xxxx aaaa xxxx dddd"`.
    pub filters: Vec<String>,
    #[serde(default = "default_required_completions")]
    pub required_completions: u32,
    /// Fixed PRNG seed; derived from the id when absent.
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

fn default_required_completions() -> u32 {
    1
}

/// One input edge of an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputModel {
    pub source: u32,
    #[serde(default)]
    pub output: usize,
    /// Selects a single slot of the referenced pipe where the operator
    /// kind works on indexed values.
    #[serde(default)]
    pub param_index: Option<usize>,
}

impl InputModel {
    pub fn pipe(source: u32) -> InputModel {
        InputModel { source, output: 0, param_index: None }
    }

    pub fn slot(source: u32, param_index: usize) -> InputModel {
        InputModel {
            source,
            output: 0,
            param_index: Some(param_index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorModel {
    pub id: u32,
    pub event_index: usize,
    pub inputs: Vec<InputModel>,
    pub kind: OperatorKindModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOpModel {
    Sum,
    Mean,
    Sigma,
    Min,
    Max,
    Multiplicity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RectOpModel {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorKindModel {
    Calibration {
        unit_min: f64,
        unit_max: f64,
    },
    KeepPrevious {
        #[serde(default)]
        keep_valid: bool,
    },
    /// Full-array difference, or single-slot when both inputs carry a
    /// `param_index`.
    Difference,
    ArrayMap {
        mappings: Vec<MappingModel>,
    },
    BinaryEquation {
        equation: usize,
        output_lower: f64,
        output_upper: f64,
    },
    Aggregate {
        op: AggregateOpModel,
        /// `None` uses the tightest bound from the input limits.
        #[serde(default)]
        threshold_min: Option<f64>,
        #[serde(default)]
        threshold_max: Option<f64>,
    },
    RangeFilter {
        min: f64,
        max: f64,
        #[serde(default)]
        keep_outside: bool,
    },
    RectFilter {
        x_min: f64,
        x_max: f64,
        y_min: f64,
        y_max: f64,
        op: RectOpModel,
    },
    ConditionFilter {
        #[serde(default)]
        inverted: bool,
    },
    H1DSink {
        bin_count: usize,
    },
    H2DSink {
        x_bins: usize,
        y_bins: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingModel {
    pub input_index: usize,
    pub param_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> AnalysisModel {
        AnalysisModel {
            sources: vec![SourceModel {
                id: 1,
                event_index: 0,
                module_index: 0,
                filters: vec!["xxxx aaaa xxxx dddd".into()],
                required_completions: 1,
                rng_seed: Some(1234),
            }],
            operators: vec![
                OperatorModel {
                    id: 2,
                    event_index: 0,
                    inputs: vec![InputModel::pipe(1)],
                    kind: OperatorKindModel::Calibration { unit_min: 0.0, unit_max: 10.0 },
                },
                OperatorModel {
                    id: 3,
                    event_index: 0,
                    inputs: vec![InputModel::pipe(2)],
                    kind: OperatorKindModel::H1DSink { bin_count: 100 },
                },
            ],
        }
    }

    #[test]
    fn json_round_trip() {
        let model = sample_model();
        let json = model.to_json().unwrap();
        let back = AnalysisModel::from_json(&json).unwrap();
        assert_eq!(model, back);
    }

    #[test]
    fn kind_tags_are_snake_case() {
        let json = sample_model().to_json().unwrap();
        assert!(json.contains("\"type\": \"calibration\""));
    }

    #[test]
    fn defaults_fill_in_missing_fields() {
        let json = r#"{
            "sources": [
                { "id": 1, "event_index": 0, "module_index": 0, "filters": ["dddd"] }
            ]
        }"#;

        let model = AnalysisModel::from_json(json).unwrap();
        assert_eq!(model.sources[0].required_completions, 1);
        assert_eq!(model.sources[0].rng_seed, None);
        assert!(model.operators.is_empty());
    }
}
