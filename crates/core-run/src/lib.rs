//! Run orchestration: the readout worker thread pulling buffers from the
//! controller, the stream worker driving the parser and the analysis
//! runtime, and the controller owning arenas, worker pool and stop flag.
//!
//! Data flow during a run:
//!
//! ```text
//! ReadoutSource -> readout worker -> bounded buffer queue -> stream worker
//!                      |                                          |
//!                  listfile                                  parser -> runtime
//! ```
//!
//! Only the two queue endpoints couple the threads; timeouts on the data
//! pipe are absorbed by the readout worker until the stop flag is raised.

pub mod controller;
pub mod logging;
pub mod source;
pub mod worker;

pub use controller::{DaqController, RunStats};
pub use source::{EthReadoutSource, ReadoutSource, UsbReadoutSource};
pub use worker::{spawn_readout_worker, ReadoutBuffer, ReadoutWorkerStats};
