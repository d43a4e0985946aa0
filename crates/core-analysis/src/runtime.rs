//! The per-event analysis runtime.
//!
//! Holds extractors sorted by source module and operators sorted by
//! (rank, kind) for each event index. The rank sort guarantees that when
//! operators are stepped in array order, every input has already been
//! updated; rank-equal ranges are independent and may step in parallel.

use tracing::trace;

use crate::extractor::Extractor;
use crate::histo::{H1D, H2D};
use crate::operators::{Operator, OperatorData};
use crate::workqueue::WorkerPool;

#[derive(Debug)]
pub struct Runtime {
    pub extractors: Vec<Vec<Extractor>>,
    pub operators: Vec<Vec<Operator>>,
    /// Parallel to `operators`: the rank of each entry. Non-decreasing per
    /// event; `end_event_parallel` derives its barrier boundaries from
    /// equal-rank runs, so the values are never narrowed or clamped.
    pub ranks: Vec<Vec<u32>>,
}

impl Runtime {
    pub fn new(event_count: usize) -> Runtime {
        Runtime {
            extractors: (0..event_count).map(|_| Vec::new()).collect(),
            operators: (0..event_count).map(|_| Vec::new()).collect(),
            ranks: (0..event_count).map(|_| Vec::new()).collect(),
        }
    }

    pub fn event_count(&self) -> usize {
        self.extractors.len()
    }

    /// Zeroes all histogram contents and counters. Called once at run
    /// start; the backing storage itself is long-lived.
    pub fn begin_run(&mut self) {
        for ops in &mut self.operators {
            for op in ops {
                match &mut op.data {
                    OperatorData::H1DSink { histos } => {
                        for h in histos {
                            h.clear();
                        }
                    }
                    OperatorData::H2DSink { histo, .. } => {
                        histo.data.fill(0.0);
                        histo.entry_count = 0.0;
                        histo.underflow = 0.0;
                        histo.overflow = 0.0;
                    }
                    _ => {}
                }
            }
        }
    }

    /// Resets all extractors of the event.
    pub fn begin_event(&mut self, event_index: usize) {
        for ex in &mut self.extractors[event_index] {
            ex.begin_event();
        }
    }

    /// Feeds module data to the extractors listening on `module_index`.
    /// The extractor array is sorted by module index, so the scan stops at
    /// the first higher index.
    pub fn process_module_data(&mut self, event_index: usize, module_index: usize, data: &[u32]) {
        for ex in &mut self.extractors[event_index] {
            if ex.module_index == module_index {
                ex.process_module_data(data);
            } else if ex.module_index > module_index {
                break;
            }
        }
    }

    /// Steps all operators of the event in array order.
    pub fn end_event(&mut self, event_index: usize) {
        let ops = &mut self.operators[event_index];

        trace!(target: "analysis", event = event_index, operators = ops.len(), "end_event");

        for op in ops {
            op.step();
        }
    }

    /// Steps the event's operators through the worker pool, one rank-equal
    /// range at a time. Rank boundaries are hard barriers.
    pub fn end_event_parallel(&mut self, event_index: usize, pool: &WorkerPool) {
        let ops = &mut self.operators[event_index];
        let ranks = &self.ranks[event_index];

        debug_assert_eq!(ops.len(), ranks.len());

        let mut begin = 0usize;

        while begin < ops.len() {
            let rank = ranks[begin];
            let mut end = begin;

            while end < ops.len() && ranks[end] == rank {
                end += 1;
            }

            trace!(target: "analysis", event = event_index, rank, count = end - begin, "stepping rank");

            pool.step_operator_range(&mut ops[begin..end]);
            begin = end;
        }
    }

    /// All 1-d histograms of the event, in operator order.
    pub fn h1d_histos(&self, event_index: usize) -> Vec<&H1D> {
        self.operators[event_index]
            .iter()
            .filter_map(|op| match &op.data {
                OperatorData::H1DSink { histos } => Some(histos.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn h2d_histos(&self, event_index: usize) -> Vec<&H2D> {
        self.operators[event_index]
            .iter()
            .filter_map(|op| match &op.data {
                OperatorData::H2DSink { histo, .. } => Some(histo),
                _ => None,
            })
            .collect()
    }
}
