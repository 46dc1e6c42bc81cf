//! Line-oriented transport adapter.
//!
//! Inbound messages arrive one per line as `<topic> <payload>`, the format
//! `mosquitto_sub -v` prints, and are spread over a fixed pool of worker
//! threads. Messages for the same gateway always land on the same worker, so
//! they are applied in arrival order. Outbound commands are written back in
//! the same format.

use crate::services::commands::{PublishError, Transport};
use crate::services::ingest::Reconciler;
use crate::services::topic;
use crate::store::Store;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// Per-worker queue depth before `dispatch` blocks the reader.
const WORKER_QUEUE: usize = 1024;

/// One inbound message as read off the wire. Neither half is checked for
/// UTF-8 here; the reconciler classifies bad input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub topic: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Splits a `<topic> <payload>` line. A line without a payload yields an empty one.
pub fn parse_line(line: &[u8]) -> Option<Inbound> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    let (topic, payload) = match line.iter().position(|b| *b == b' ') {
        Some(at) => (&line[..at], line[at + 1..].trim_ascii()),
        None => (line, &[][..]),
    };
    Some(Inbound {
        topic: topic.to_vec(),
        payload: payload.to_vec(),
    })
}

fn shard_for(topic_name: &[u8], shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    match std::str::from_utf8(topic_name).ok().and_then(|t| topic::parse(t).ok()) {
        Some(intent) => intent.gateway_code.as_bytes().hash(&mut hasher),
        None => topic_name.hash(&mut hasher),
    }
    (hasher.finish() % shards as u64) as usize
}

pub struct WorkerPool {
    senders: Vec<SyncSender<Inbound>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start<S: Store + 'static>(reconciler: Arc<Reconciler<S>>, workers: usize) -> Result<Self, String> {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = mpsc::sync_channel::<Inbound>(WORKER_QUEUE);
            let reconciler = reconciler.clone();
            let handle = thread::Builder::new()
                .name(format!("ingest-{}", index))
                .spawn(move || {
                    for msg in rx {
                        reconciler.on_raw_message(&msg.topic, &msg.payload);
                    }
                    debug!("Ingest worker {} stopped", index);
                })
                .map_err(|e| format!("failed to spawn ingest worker {}: {}", index, e))?;
            senders.push(tx);
            handles.push(handle);
        }

        info!("Started {} ingest worker(s)", workers);
        Ok(WorkerPool { senders, handles })
    }

    /// Queues the message on its gateway's worker, blocking while that queue is full.
    pub fn dispatch(&self, msg: Inbound) -> Result<(), String> {
        let shard = shard_for(&msg.topic, self.senders.len());
        self.senders[shard]
            .send(msg)
            .map_err(|_| format!("ingest worker {} is gone", shard))
    }

    /// Closes every queue and waits for the workers to drain them.
    pub fn shutdown(self) -> Result<(), String> {
        drop(self.senders);
        for handle in self.handles {
            handle.join().map_err(|_| "ingest worker panicked".to_string())?;
        }
        Ok(())
    }
}

/// Reads lines until EOF and returns how many messages were dispatched.
/// `on_progress` runs after every `every` messages.
pub fn pump_lines<R, F>(mut reader: R, pool: &WorkerPool, every: u64, mut on_progress: F) -> Result<u64, String>
where
    R: BufRead,
    F: FnMut(u64),
{
    let mut dispatched = 0u64;
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| format!("failed to read input: {}", e))?;
        if read == 0 {
            break;
        }
        let Some(msg) = parse_line(&line) else {
            continue;
        };
        pool.dispatch(msg)?;
        dispatched += 1;
        if every > 0 && dispatched % every == 0 {
            on_progress(dispatched);
        }
    }
    Ok(dispatched)
}

/// Writes published messages as `<topic> <payload>` lines.
pub struct LineTransport<W: Write + Send> {
    out: Mutex<W>,
    connected: AtomicBool,
}

impl<W: Write + Send> LineTransport<W> {
    pub fn new(out: W) -> Self {
        LineTransport {
            out: Mutex::new(out),
            connected: AtomicBool::new(false),
        }
    }

    pub fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = out.flush() {
                warn!("Transport: flush on disconnect failed: {}", e);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> Transport for LineTransport<W> {
    fn publish(&self, topic: &str, payload: &Value) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{} {}", topic, payload)
            .and_then(|_| out.flush())
            .map_err(|e| PublishError::Transport(e.to_string()))
    }
}
