//! The readout worker thread: fills numbered buffers from the data pipe,
//! records them to the listfile and pushes them into the bounded buffer
//! queue.
//!
//! The bounded queue provides natural backpressure: when the stream worker
//! falls behind, the blocking send parks the readout worker rather than
//! dropping data. Consumed buffers return through a recycle channel so the
//! steady state allocates nothing.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use core_proto::listfile::ListfileWriter;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::source::ReadoutSource;

/// One filled readout buffer. Buffers are numbered from 1; the parser uses
/// the numbers for loss accounting.
#[derive(Debug)]
pub struct ReadoutBuffer {
    pub number: u32,
    pub words: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadoutWorkerStats {
    pub buffers_read: u64,
    pub words_read: u64,
    pub read_timeouts: u64,
}

/// Interval between timestamp system events written to the listfile.
const TIMETICK_INTERVAL: Duration = Duration::from_secs(1);

pub fn spawn_readout_worker(
    mut source: Box<dyn ReadoutSource>,
    buffer_words: usize,
    tx: Sender<ReadoutBuffer>,
    recycle: Receiver<Vec<u32>>,
    stop: Arc<AtomicBool>,
    mut listfile: Option<ListfileWriter<Box<dyn Write + Send>>>,
) -> JoinHandle<ReadoutWorkerStats> {
    std::thread::Builder::new()
        .name("mvlc_readout".into())
        .spawn(move || {
            let mut stats = ReadoutWorkerStats::default();
            let mut buffer_number = 1u32;
            let mut last_tick = Instant::now();

            info!(target: "run", "readout worker starting");

            while !stop.load(Ordering::Relaxed) {
                if let Some(writer) = listfile.as_mut() {
                    if last_tick.elapsed() >= TIMETICK_INTERVAL {
                        last_tick = Instant::now();
                        let seconds = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_secs())
                            .unwrap_or(0);
                        if let Err(e) = writer.write_timestamp(seconds) {
                            warn!(target: "run", error = %e, "listfile timestamp write failed");
                        }
                    }
                }

                let mut words = recycle.try_recv().unwrap_or_default();
                words.clear();

                match source.read_words(&mut words, buffer_words) {
                    Ok(0) => continue,

                    Ok(n) => {
                        stats.buffers_read += 1;
                        stats.words_read += n as u64;

                        if let Some(writer) = listfile.as_mut() {
                            if let Err(e) = writer.write_words(&words) {
                                warn!(target: "run", error = %e, "listfile write failed");
                                listfile = None;
                            }
                        }

                        let buffer = ReadoutBuffer {
                            number: buffer_number,
                            words,
                        };
                        buffer_number = buffer_number.wrapping_add(1).max(1);

                        if tx.send(buffer).is_err() {
                            // Stream worker is gone; nothing left to feed.
                            break;
                        }
                    }

                    Err(e) if e.is_timeout() => {
                        stats.read_timeouts += 1;
                    }

                    Err(e) => {
                        debug!(target: "run", error = %e, "readout stream ended");
                        break;
                    }
                }
            }

            if let Some(writer) = listfile.as_mut() {
                if let Err(e) = writer.write_end_of_file() {
                    warn!(target: "run", error = %e, "listfile end-of-file write failed");
                }
            }

            info!(
                target: "run",
                buffers = stats.buffers_read,
                words = stats.words_read,
                timeouts = stats.read_timeouts,
                "readout worker finished"
            );

            stats
        })
        .expect("spawning the readout worker")
}
