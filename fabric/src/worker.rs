// Fabric: Virtual Topology Binding for Network Test Beds
// Copyright (C) 2021  Tibor Schneider
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! # Task Executor
//!
//! Fabric operations on different ports are mutually independent, so the orchestrator fans them
//! out over a bounded pool of worker threads. Concurrent tasks would interleave their log lines
//! beyond readability, so while a pooled [`Worker::map`] is running, records are buffered per
//! worker thread and flushed as one contiguous block when the task finishes.

use crate::{Error, Result};

use log::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

/// Lower bound for the worker pool size.
pub const MIN_WORKER_COUNT: usize = 8;

const LOG_SEPARATOR: &str =
    "========================================================================================================================";

/// Default worker count: at least [`MIN_WORKER_COUNT`], scaled up on large hosts.
pub fn default_worker_count() -> usize {
    MIN_WORKER_COUNT.max(num_cpus::get() / 8)
}

struct BufferedRecord {
    level: Level,
    target: String,
    message: String,
}

/// # Per-task log buffer
///
/// A [`Log`] implementation wrapping the real logger. While attached, records emitted by
/// registered task threads are held back in a per-thread buffer and forwarded as one block when
/// the task completes; records from all other threads pass through unchanged. Buffering is only
/// attached for the duration of a pooled [`Worker::map`] call.
pub struct BufferedLogger {
    inner: Box<dyn Log>,
    attached: AtomicBool,
    buffers: Mutex<HashMap<ThreadId, Vec<BufferedRecord>>>,
}

impl BufferedLogger {
    /// Wrap the real logger.
    pub fn new(inner: Box<dyn Log>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            attached: AtomicBool::new(false),
            buffers: Mutex::new(HashMap::new()),
        })
    }

    /// Install the wrapped logger as the process-wide logger.
    pub fn install(logger: Arc<Self>, level: LevelFilter) {
        log::set_max_level(level);
        // a second install (e.g. in tests) keeps the first logger
        let _ = log::set_boxed_logger(Box::new(LoggerHandle(logger)));
    }

    fn attach(&self) {
        self.attached.store(true, Relaxed);
    }

    fn detach(&self) {
        self.attached.store(false, Relaxed);
        self.flush_buffers();
    }

    /// Register the current thread as a task thread; its records buffer from now on.
    fn begin_task(&self) {
        self.buffers
            .lock()
            .unwrap()
            .insert(thread::current().id(), Vec::new());
    }

    /// Flush the current thread's records as one contiguous block and unregister it.
    fn end_task(&self) {
        let records = self.buffers.lock().unwrap().remove(&thread::current().id());
        if let Some(records) = records {
            self.forward(records);
        }
    }

    /// Flush every remaining buffer.
    fn flush_buffers(&self) {
        let buffers: Vec<_> = {
            let mut guard = self.buffers.lock().unwrap();
            guard.drain().map(|(_, records)| records).collect()
        };
        for records in buffers {
            self.forward(records);
        }
    }

    fn forward(&self, records: Vec<BufferedRecord>) {
        for record in records {
            self.inner.log(
                &Record::builder()
                    .level(record.level)
                    .target(&record.target)
                    .args(format_args!("{}", record.message))
                    .build(),
            );
        }
    }
}

impl Log for BufferedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.attached.load(Relaxed) {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.get_mut(&thread::current().id()) {
                buffer.push(BufferedRecord {
                    level: record.level(),
                    target: record.target().to_string(),
                    message: record.args().to_string(),
                });
                return;
            }
        }
        self.inner.log(record);
    }

    fn flush(&self) {
        self.flush_buffers();
        self.inner.flush();
    }
}

struct LoggerHandle(Arc<BufferedLogger>);

impl Log for LoggerHandle {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.0.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.0.log(record)
    }

    fn flush(&self) {
        self.0.flush()
    }
}

/// # Topology Worker
///
/// Applies an operation to every item of a batch, either sequentially or on a bounded pool of
/// worker threads. A pooled map returns only once every item has completed; the first encountered
/// failure is reported afterwards.
pub struct Worker {
    use_thread_worker: bool,
    worker_count: usize,
    log_buffer: Option<Arc<BufferedLogger>>,
}

impl Worker {
    /// Create a new worker.
    pub fn new(use_thread_worker: bool, worker_count: usize) -> Self {
        info!(
            "Init topology worker: use thread worker {}, thread worker count {}",
            use_thread_worker, worker_count
        );
        Self {
            use_thread_worker,
            worker_count: worker_count.max(1),
            log_buffer: None,
        }
    }

    /// Buffer task logs through the given sink while pooled maps are running.
    pub fn with_log_buffer(mut self, buffer: Arc<BufferedLogger>) -> Self {
        self.log_buffer = Some(buffer);
        self
    }

    /// Apply `func` to every item.
    ///
    /// Sequential mode stops at the first error. Pooled mode completes every item, keeps the
    /// per-task logs grouped, and reports the first failure once all items are done.
    pub fn map<T, F>(&self, func: F, items: Vec<T>) -> Result<()>
    where
        T: Send,
        F: Fn(T) -> Result<()> + Send + Sync,
    {
        if !self.use_thread_worker {
            for item in items {
                func(item)?;
            }
            return Ok(());
        }

        let n_workers = self.worker_count.min(items.len().max(1));
        if let Some(buffer) = &self.log_buffer {
            buffer.attach();
        }

        let queue = Mutex::new(items.into_iter());
        let errors: Mutex<Vec<Error>> = Mutex::new(Vec::new());

        thread::scope(|scope| {
            for _ in 0..n_workers {
                scope.spawn(|| loop {
                    let item = queue.lock().unwrap().next();
                    let item = match item {
                        Some(item) => item,
                        None => break,
                    };
                    if let Some(buffer) = &self.log_buffer {
                        buffer.begin_task();
                    }
                    debug!("{}", LOG_SEPARATOR);
                    debug!("Start task, worker {:?}", thread::current().id());
                    let result = func(item);
                    debug!("Finish task, worker {:?}", thread::current().id());
                    debug!("{}", LOG_SEPARATOR);
                    if let Some(buffer) = &self.log_buffer {
                        buffer.end_task();
                    }
                    if let Err(e) = result {
                        errors.lock().unwrap().push(e);
                    }
                });
            }
        });

        if let Some(buffer) = &self.log_buffer {
            buffer.detach();
        }

        let mut errors = errors.into_inner().unwrap();
        match errors.is_empty() {
            true => Ok(()),
            false => Err(errors.remove(0)),
        }
    }

    /// Flush all buffered logs and release pool resources. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Some(buffer) = self.log_buffer.take() {
            buffer.flush_buffers();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CollectingLog(Arc<Mutex<Vec<String>>>);

    impl Log for CollectingLog {
        fn enabled(&self, _: &Metadata) -> bool {
            true
        }
        fn log(&self, record: &Record) {
            self.0.lock().unwrap().push(record.args().to_string());
        }
        fn flush(&self) {}
    }

    #[test]
    fn sequential_map_applies_all() {
        let worker = Worker::new(false, 4);
        let count = AtomicUsize::new(0);
        worker
            .map(
                |_| {
                    count.fetch_add(1, Relaxed);
                    Ok(())
                },
                (0..10).collect(),
            )
            .unwrap();
        assert_eq!(count.load(Relaxed), 10);
    }

    #[test]
    fn pooled_map_applies_all() {
        let worker = Worker::new(true, 4);
        let seen: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        worker
            .map(
                |i| {
                    seen.lock().unwrap().push(i);
                    Ok(())
                },
                (0..100).collect(),
            )
            .unwrap();
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn pooled_map_completes_before_failing() {
        let worker = Worker::new(true, 4);
        let count = AtomicUsize::new(0);
        let result = worker.map(
            |i| {
                count.fetch_add(1, Relaxed);
                if i == 3 {
                    Err(Error::WorkerError("task 3 failed".to_string()))
                } else {
                    Ok(())
                }
            },
            (0..20).collect(),
        );
        assert!(result.is_err());
        assert_eq!(count.load(Relaxed), 20);
    }

    #[test]
    fn sequential_map_stops_at_first_error() {
        let worker = Worker::new(false, 4);
        let count = AtomicUsize::new(0);
        let result = worker.map(
            |i| {
                count.fetch_add(1, Relaxed);
                if i == 3 {
                    Err(Error::WorkerError("task 3 failed".to_string()))
                } else {
                    Ok(())
                }
            },
            (0..20).collect(),
        );
        assert!(result.is_err());
        assert_eq!(count.load(Relaxed), 4);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let buffer = BufferedLogger::new(Box::new(CollectingLog(sink)));
        let mut worker = Worker::new(true, 2).with_log_buffer(buffer);
        worker.shutdown();
        worker.shutdown();
    }

    #[test]
    fn buffered_records_flush_as_one_block() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let logger = BufferedLogger::new(Box::new(CollectingLog(sink.clone())));
        logger.attach();
        logger.begin_task();
        logger.log(
            &Record::builder()
                .level(Level::Info)
                .args(format_args!("first"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Info)
                .args(format_args!("second"))
                .build(),
        );
        // nothing forwarded until the task ends
        assert!(sink.lock().unwrap().is_empty());
        logger.end_task();
        logger.detach();
        assert_eq!(
            *sink.lock().unwrap(),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn unregistered_threads_pass_through() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let logger = BufferedLogger::new(Box::new(CollectingLog(sink.clone())));
        logger.attach();
        // the current thread never called begin_task, so the record passes through
        logger.log(
            &Record::builder()
                .level(Level::Info)
                .args(format_args!("direct"))
                .build(),
        );
        assert_eq!(*sink.lock().unwrap(), vec!["direct".to_string()]);
    }
}
