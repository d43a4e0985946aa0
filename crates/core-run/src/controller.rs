//! The DAQ controller: owns the analysis arenas, runtime, worker pool and
//! stop flag, and drives begin/process/end per event for everything the
//! readout worker delivers.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use core_analysis::model::AnalysisModel;
use core_analysis::{build_runtime, AdapterError, HistoRegistry, Runtime, WorkerPool};
use core_arena::Arena;
use core_config::ConfigFile;
use core_proto::listfile::ListfileWriter;
use core_proto::ConnectionType;
use core_readout::{ReadoutConsumer, ReadoutParser, ReadoutParserCounters, ReadoutStructure};
use crossbeam_channel::RecvTimeoutError;
use tracing::{info, warn};

use crate::source::ReadoutSource;
use crate::worker::{spawn_readout_worker, ReadoutWorkerStats};

const RUN_ARENA_SEGMENT_SIZE: usize = 1 << 20;
const HISTO_ARENA_SEGMENT_SIZE: usize = 4 << 20;

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunStats {
    pub worker: ReadoutWorkerStats,
    pub parser: ReadoutParserCounters,
}

impl RunStats {
    pub fn events_processed(&self) -> u64 {
        self.parser.events_dispatched
    }
}

/// Bridges parser callbacks into the analysis runtime. Every declared part
/// of a module's readout feeds the extractors; filters decide which words
/// matter.
struct AnalysisConsumer<'a> {
    runtime: &'a mut Runtime,
    pool: Option<&'a WorkerPool>,
}

impl ReadoutConsumer for AnalysisConsumer<'_> {
    fn begin_event(&mut self, ei: usize) {
        if ei < self.runtime.event_count() {
            self.runtime.begin_event(ei);
        }
    }

    fn module_prefix(&mut self, ei: usize, mi: usize, data: &[u32]) {
        if ei < self.runtime.event_count() {
            self.runtime.process_module_data(ei, mi, data);
        }
    }

    fn module_dynamic(&mut self, ei: usize, mi: usize, data: &[u32]) {
        if ei < self.runtime.event_count() {
            self.runtime.process_module_data(ei, mi, data);
        }
    }

    fn module_suffix(&mut self, ei: usize, mi: usize, data: &[u32]) {
        if ei < self.runtime.event_count() {
            self.runtime.process_module_data(ei, mi, data);
        }
    }

    fn end_event(&mut self, ei: usize) {
        if ei >= self.runtime.event_count() {
            return;
        }

        match self.pool {
            Some(pool) => self.runtime.end_event_parallel(ei, pool),
            None => self.runtime.end_event(ei),
        }
    }

    fn system_event(&mut self, subtype: u8, data: &[u32]) {
        tracing::trace!(target: "run", subtype, words = data.len(), "system event");
    }
}

pub struct DaqController {
    config: ConfigFile,
    model: AnalysisModel,
    structure: ReadoutStructure,

    // Double-buffered per-run arenas: rebuilds go to the inactive one, so
    // the previous runtime's storage stays valid until the swap completes.
    run_arenas: [Arena; 2],
    active_arena: usize,
    scratch_arena: Arena,
    histo_arena: Arena,
    registry: HistoRegistry,

    runtime: Runtime,
    stop: Arc<AtomicBool>,
}

impl DaqController {
    pub fn new(
        config: ConfigFile,
        model: AnalysisModel,
        structure: ReadoutStructure,
    ) -> Result<DaqController, AdapterError> {
        let mut run_arenas = [
            Arena::new(RUN_ARENA_SEGMENT_SIZE),
            Arena::new(RUN_ARENA_SEGMENT_SIZE),
        ];
        let mut scratch_arena = Arena::new(RUN_ARENA_SEGMENT_SIZE);
        let mut histo_arena = Arena::new(HISTO_ARENA_SEGMENT_SIZE);
        let mut registry = HistoRegistry::new();

        let runtime = build_runtime(
            &model,
            &mut run_arenas[0],
            &mut scratch_arena,
            &mut histo_arena,
            &mut registry,
        )?;

        Ok(DaqController {
            config,
            model,
            structure,
            run_arenas,
            active_arena: 0,
            scratch_arena,
            histo_arena,
            registry,
            runtime,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn model(&self) -> &AnalysisModel {
        &self.model
    }

    /// Shared stop flag; setting it ends a running `run()` at the next
    /// event boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Replaces the analysis model and rebuilds the runtime into the
    /// inactive arena. Histogram contents survive via the registry.
    pub fn rebuild_analysis(&mut self, model: AnalysisModel) -> Result<(), AdapterError> {
        let next = 1 - self.active_arena;
        self.run_arenas[next].reset();

        let runtime = build_runtime(
            &model,
            &mut self.run_arenas[next],
            &mut self.scratch_arena,
            &mut self.histo_arena,
            &mut self.registry,
        )?;

        // The old runtime drops here; only then is its arena reusable.
        self.runtime = runtime;
        self.active_arena = next;
        self.model = model;

        Ok(())
    }

    /// Processes the readout stream delivered by `source` until the source
    /// ends or the stop flag is raised.
    pub fn run(
        &mut self,
        source: Box<dyn ReadoutSource>,
        listfile: Option<Box<dyn Write + Send>>,
    ) -> anyhow::Result<RunStats> {
        let connection = source.connection_type();

        let listfile = match listfile {
            Some(writer) => Some(
                ListfileWriter::new(writer, connection)
                    .context("writing the listfile preamble")?,
            ),
            None => None,
        };

        let mut parser = ReadoutParser::new(self.structure.clone())
            .map_err(|e| anyhow::anyhow!("invalid readout structure: {e}"))?;

        let pool = WorkerPool::new(self.config.analysis.worker_threads);
        let pool_ref = (pool.worker_count() > 0).then_some(&pool);

        self.stop.store(false, Ordering::Relaxed);
        self.runtime.begin_run();

        let (buffer_tx, buffer_rx) =
            crossbeam_channel::bounded(self.config.readout.queue_capacity.max(1));
        let (recycle_tx, recycle_rx) =
            crossbeam_channel::bounded(self.config.readout.queue_capacity.max(1) * 2);

        let worker = spawn_readout_worker(
            source,
            self.config.readout.buffer_words,
            buffer_tx,
            recycle_rx,
            Arc::clone(&self.stop),
            listfile,
        );

        info!(target: "run", ?connection, "run started");

        let mut abort: Option<anyhow::Error> = None;

        loop {
            match buffer_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(buffer) => {
                    let mut consumer = AnalysisConsumer {
                        runtime: &mut self.runtime,
                        pool: pool_ref,
                    };

                    let result = match connection {
                        ConnectionType::Eth => parser.parse_buffer_eth(
                            &mut consumer,
                            buffer.number,
                            &buffer.words,
                        ),
                        ConnectionType::Usb => parser.parse_buffer_usb(
                            &mut consumer,
                            buffer.number,
                            &buffer.words,
                        ),
                    };

                    if let Err(e) = result {
                        if self.config.analysis.abort_on_error {
                            abort = Some(anyhow::anyhow!("parse error: {e}"));
                            self.stop.store(true, Ordering::Relaxed);
                        } else {
                            warn!(target: "run", buffer = buffer.number, error = %e, "parse error");
                        }
                    }

                    let _ = recycle_tx.try_send(buffer.words);
                }

                Err(RecvTimeoutError::Timeout) => {
                    if self.stop.load(Ordering::Relaxed) && buffer_rx.is_empty() {
                        break;
                    }
                }

                // Readout worker finished and the queue is drained.
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if abort.is_some() && buffer_rx.is_empty() {
                break;
            }
        }

        self.stop.store(true, Ordering::Relaxed);

        // Dropping the receiver unblocks a worker parked on a full queue.
        drop(buffer_rx);
        drop(recycle_tx);

        let worker_stats = worker
            .join()
            .map_err(|_| anyhow::anyhow!("readout worker panicked"))?;

        let stats = RunStats {
            worker: worker_stats,
            parser: parser.counters.clone(),
        };

        info!(
            target: "run",
            buffers = stats.parser.buffers_processed,
            events = stats.parser.events_dispatched,
            errors = stats.parser.total_parse_errors(),
            "run finished"
        );

        if let Some(e) = abort {
            return Err(e);
        }

        Ok(stats)
    }
}
