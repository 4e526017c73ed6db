//! Asynchronous sample dispatcher.
//!
//! Single-worker pattern: producers push owned sample clones through an MPSC
//! channel; one thread pops them in submission order, resolves the schema and
//! hands each sample to the write fan-out.
//!
//! - [`Dispatcher`]: owns the worker thread (`stop` joins it)
//! - [`Submitter`]: cheap clonable producer facade
//! - [`SampleSink`]: where resolved samples go

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

use crate::types::{DataSet, DsType, MetricDataPoint, PERCENT_TYPE, Sample, SchemaLookup, Value};

/// Errors returned by the dispatcher's producer API.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Malformed submission.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The dispatcher has been stopped and accepts no more samples.
    #[error("dispatcher stopped")]
    Stopped,

    /// A drain barrier did not complete in time.
    #[error("flush timed out after {0:?}")]
    Timeout(Duration),

    /// The worker thread could not be started.
    #[error("failed to spawn dispatcher worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Receives every sample whose schema resolved.
pub trait SampleSink: Send + Sync {
    fn write(&self, data_set: &DataSet, sample: &Sample);
}

/// Lifecycle of the dispatcher. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum DispatcherState {
    Idle,
    Draining,
    Stopped,
}

/// Counters since the dispatcher was spawned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub submitted: u64,
    pub written: u64,
    pub dropped_unknown_type: u64,
    pub dropped_invalid: u64,
    pub pending: u64,
}

// =============================================================================
// Commands
// =============================================================================

enum Command {
    /// Deliver one owned sample.
    Sample(Sample),
    /// Acknowledge once everything queued before it has been delivered.
    Barrier(SyncSender<()>),
    /// Exit after everything queued before it has been delivered.
    Shutdown,
}

#[derive(Default)]
struct Shared {
    /// Held shared by senders and exclusively by `stop`, so nothing is
    /// queued behind `Command::Shutdown`.
    gate: RwLock<()>,
    stopped: AtomicBool,
    submitted: AtomicU64,
    written: AtomicU64,
    dropped_unknown_type: AtomicU64,
    dropped_invalid: AtomicU64,
    pending: AtomicU64,
}

// =============================================================================
// Producer facade
// =============================================================================

/// Producer side of the dispatcher.
#[derive(Clone)]
pub struct Submitter {
    tx: Sender<Command>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter").finish_non_exhaustive()
    }
}

impl Submitter {
    /// Queue an independent copy of `sample`, stamped with the current time
    /// if it has none.
    pub fn submit(&self, sample: &Sample) -> Result<(), DispatchError> {
        if sample.values.is_empty() {
            return Err(DispatchError::InvalidArgument(format!(
                "sample {sample} has no values"
            )));
        }
        self.enqueue(sample.clone_for_dispatch(Utc::now()))
    }

    /// Derive one single-value sample per point from `template` and queue each.
    ///
    /// With `percent` and a gauge kind, the type becomes `percent` and each
    /// value is `100 * value / sum`, where the sum skips NaN points; a NaN
    /// point or a zero sum yields NaN. Returns the number of points that
    /// could not be queued.
    pub fn submit_derived<K>(
        &self,
        template: &Sample,
        percent: bool,
        kind: K,
        points: &[MetricDataPoint],
    ) -> Result<usize, DispatchError>
    where
        K: TryInto<DsType> + Copy + std::fmt::Debug,
    {
        if points.is_empty() {
            return Err(DispatchError::InvalidArgument(format!(
                "no data points for {template}"
            )));
        }

        let resolved: Result<DsType, _> = kind.try_into();
        let Ok(kind) = resolved else {
            tracing::warn!(plugin = %template.plugin, kind = ?kind, points = points.len(),
                "Unrecognized store kind, skipping data points");
            return Ok(points.len());
        };

        let normalize = percent && kind == DsType::Gauge;
        let sum: f64 = if normalize {
            points
                .iter()
                .map(|p| p.value)
                .filter(|v| !v.is_nan())
                .sum()
        } else {
            0.0
        };

        let now = Utc::now();
        let mut failed = 0;
        for point in points {
            let value = if normalize {
                if sum == 0.0 || point.value.is_nan() {
                    Value::Gauge(f64::NAN)
                } else {
                    Value::Gauge(100.0 * point.value / sum)
                }
            } else {
                Value::from_raw(kind, point.value)
            };

            let mut derived = Sample {
                type_instance: point.name.clone(),
                values: vec![value],
                ..template.clone_for_dispatch(now)
            };
            if normalize {
                derived.type_name = PERCENT_TYPE.to_string();
            }
            derived.type_instance = crate::types::bounded(&derived.type_instance);

            if let Err(e) = self.enqueue(derived) {
                tracing::debug!(plugin = %template.plugin, point = %point.name, error = %e,
                    "Derived sample not queued");
                failed += 1;
            }
        }
        Ok(failed)
    }

    fn enqueue(&self, sample: Sample) -> Result<(), DispatchError> {
        let _open = self.shared.gate.read();
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(DispatchError::Stopped);
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(Command::Sample(sample)).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(DispatchError::Stopped);
        }
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> DispatchStats {
        let s = &self.shared;
        DispatchStats {
            submitted: s.submitted.load(Ordering::Relaxed),
            written: s.written.load(Ordering::Relaxed),
            dropped_unknown_type: s.dropped_unknown_type.load(Ordering::Relaxed),
            dropped_invalid: s.dropped_invalid.load(Ordering::Relaxed),
            pending: s.pending.load(Ordering::Acquire),
        }
    }

    pub fn state(&self) -> DispatcherState {
        if self.shared.stopped.load(Ordering::Acquire) {
            DispatcherState::Stopped
        } else if self.shared.pending.load(Ordering::Acquire) > 0 {
            DispatcherState::Draining
        } else {
            DispatcherState::Idle
        }
    }
}

// =============================================================================
// Owner
// =============================================================================

/// Owns the worker thread. Dropping it stops and joins the worker.
pub struct Dispatcher {
    submitter: Submitter,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Dispatcher {
    /// Spawn the worker thread.
    pub fn spawn(
        schema: Arc<dyn SchemaLookup>,
        sink: Arc<dyn SampleSink>,
    ) -> Result<Self, DispatchError> {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared::default());

        let worker = Worker {
            rx,
            schema,
            sink,
            shared: Arc::clone(&shared),
            warned: HashSet::new(),
        };
        let handle = thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            submitter: Submitter { tx, shared },
            handle: Mutex::new(Some(handle)),
        })
    }

    /// A producer handle for collectors.
    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    pub fn submit(&self, sample: &Sample) -> Result<(), DispatchError> {
        self.submitter.submit(sample)
    }

    pub fn submit_derived<K>(
        &self,
        template: &Sample,
        percent: bool,
        kind: K,
        points: &[MetricDataPoint],
    ) -> Result<usize, DispatchError>
    where
        K: TryInto<DsType> + Copy + std::fmt::Debug,
    {
        self.submitter
            .submit_derived(template, percent, kind, points)
    }

    /// Wait until every sample queued before this call has been handed to the
    /// sink, bounded by `timeout`. Identifier filtering is not supported;
    /// `ident` is only logged.
    pub fn flush_all(&self, timeout: Duration, ident: Option<&str>) -> Result<(), DispatchError> {
        if let Some(ident) = ident {
            tracing::debug!(ident = %ident, "Identifier filter ignored, draining whole queue");
        }
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        {
            let _open = self.submitter.shared.gate.read();
            if self.submitter.shared.stopped.load(Ordering::Acquire) {
                return Err(DispatchError::Stopped);
            }
            self.submitter
                .tx
                .send(Command::Barrier(ack_tx))
                .map_err(|_| DispatchError::Stopped)?;
        }

        match ack_rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(DispatchError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::Stopped),
        }
    }

    /// Stop accepting samples, drain what is queued and join the worker.
    /// Later calls are no-ops.
    pub fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        {
            let _closed = self.submitter.shared.gate.write();
            self.submitter.shared.stopped.store(true, Ordering::Release);
            let _ = self.submitter.tx.send(Command::Shutdown);
        }
        if handle.join().is_err() {
            tracing::error!("Dispatcher worker panicked");
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.submitter.state()
    }

    pub fn stats(&self) -> DispatchStats {
        self.submitter.stats()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    rx: Receiver<Command>,
    schema: Arc<dyn SchemaLookup>,
    sink: Arc<dyn SampleSink>,
    shared: Arc<Shared>,
    /// Type names already reported as undeliverable.
    warned: HashSet<String>,
}

impl Worker {
    fn run(mut self) {
        tracing::info!("Dispatcher started");

        while let Ok(cmd) = self.rx.recv() {
            match cmd {
                Command::Sample(sample) => {
                    self.deliver(sample);
                    self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                }
                Command::Barrier(ack) => {
                    let _ = ack.send(());
                }
                Command::Shutdown => break,
            }
        }

        tracing::info!(
            written = self.shared.written.load(Ordering::Relaxed),
            dropped_unknown_type = self.shared.dropped_unknown_type.load(Ordering::Relaxed),
            dropped_invalid = self.shared.dropped_invalid.load(Ordering::Relaxed),
            "Dispatcher stopped"
        );
    }

    fn deliver(&mut self, sample: Sample) {
        let Some(data_set) = self.schema.data_set(&sample.type_name) else {
            self.shared
                .dropped_unknown_type
                .fetch_add(1, Ordering::Relaxed);
            self.report(&sample, "Dropping sample of unknown type");
            return;
        };

        if data_set.len() != sample.values.len() {
            self.shared.dropped_invalid.fetch_add(1, Ordering::Relaxed);
            self.report(&sample, "Dropping sample whose value count does not match its type");
            return;
        }

        self.sink.write(&data_set, &sample);
        self.shared.written.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&mut self, sample: &Sample, msg: &str) {
        if self.warned.insert(sample.type_name.clone()) {
            tracing::warn!(sample = %sample, type_name = %sample.type_name,
                values = sample.values.len(), "{msg}");
        } else {
            tracing::debug!(sample = %sample, "{msg}");
        }
    }
}
