//! The per-event dataflow analysis engine.
//!
//! Raw module words enter through extractors, flow through a rank-ordered
//! pipeline of operators and end in histogram sinks. All parameter storage
//! is allocated from an arena at build time and stays immutable in shape
//! during processing; per event only the contained values change.
//!
//! Processing hot path, driven by the readout side:
//!
//! ```text
//! begin_event(ei)                      reset extractor outputs
//! process_module_data(ei, mi, words)   feed extractors of module mi
//! end_event(ei)                        step operators in rank order
//! ```

pub mod adapter;
pub mod datafilter;
pub mod extractor;
pub mod histo;
pub mod model;
pub mod operators;
pub mod param;
pub mod runtime;
pub mod workqueue;

pub use adapter::{build_runtime, AdapterError, HistoRegistry};
pub use datafilter::{make_filter, DataFilter, FilterError, MultiWordFilter};
pub use extractor::Extractor;
pub use histo::{Binning, H1D, H2D};
pub use model::AnalysisModel;
pub use operators::{Operator, OperatorKind};
pub use param::{invalid_param, is_param_valid, ParamVec, PipeVectors};
pub use runtime::Runtime;
pub use workqueue::WorkerPool;

/// Upper bound on VME event configurations addressed by stack number.
pub const MAX_EVENTS: usize = 12;

/// Upper bound on modules per event.
pub const MAX_MODULES: usize = 20;

/// Alignment in bytes of all double vectors created by the system. Matches
/// a cache line; wide vector units want at most 64 bytes.
pub const PARAM_VEC_ALIGNMENT: usize = 64;

/// Operators handed to one worker task when stepping in parallel.
pub const OPERATORS_PER_TASK: usize = 6;
