//! Asynchronous write-back of changed nodes and tree base records.
//!
//! Requests are keyed by file name and coalesce: only the newest request for
//! a key is remembered, and it is executed at most once, on a worker thread.
//! Requests leave the pending queue in the order they were last touched,
//! either when the timer sweeps the oldest one or when the queue overflows.
//! Executions for the same key never overlap.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use forest_storage::{FileWriter, StorageBackend, StorageError};
use indexmap::IndexSet;
use metrics::counter;
use tracing::{debug, error, trace, warn};

use crate::codec::BaseRecord;
use crate::error::Result;
use crate::key::Value;
use crate::metrics::{SAVES_EXECUTED, SAVES_FAILED, SAVES_REQUESTED};
use crate::node::NodeBody;

/// What a request writes or deletes.
#[derive(Clone, Debug)]
pub enum SaveTarget {
    Internal(Arc<NodeBody>),
    Leaf(Arc<NodeBody>),
    Base(BaseRecord),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SaveAction {
    Save,
    Remove,
}

#[derive(Debug)]
struct SaveItem {
    action: SaveAction,
    target: SaveTarget,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, SaveItem>,
    executing: HashSet<String>,
    /// Pending keys not yet handed to a worker, oldest first.
    queue: IndexSet<String>,
    timer: Option<JoinHandle<()>>,
    timer_running: bool,
    workers: Vec<JoinHandle<()>>,
    shutdown: bool,
}

/// Starts a named thread.
type Spawner = fn(&str, Box<dyn FnOnce() + Send>) -> std::io::Result<JoinHandle<()>>;

fn spawn_thread(name: &str, body: Box<dyn FnOnce() + Send>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name.into()).spawn(body)
}

struct Inner {
    storage: Arc<dyn StorageBackend>,
    spawn: Spawner,
    state: Mutex<State>,
    /// Signalled whenever an execution finishes.
    finished: Condvar,
    delay: Duration,
    queue_limit: usize,
}

/// Marks a key as executing until dropped.
struct Executing<'a> {
    inner: &'a Inner,
    key: &'a str,
}

impl Drop for Executing<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.executing.remove(self.key);
        self.inner.finished.notify_all();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Executes the pending request for `key`, if there still is one.
    fn save_item(&self, key: &str) {
        let item = {
            let mut state = self.lock();
            while state.executing.contains(key) {
                state = self.finished.wait(state).unwrap();
            }
            let Some(item) = state.pending.remove(key) else {
                return;
            };
            state.queue.shift_remove(key);
            state.executing.insert(key.to_string());
            item
        };
        let _executing = Executing { inner: self, key };

        trace!("savior: {:?} {key}", item.action);
        counter!(SAVES_EXECUTED).increment(1);
        if let Err(e) = self.execute(key, &item) {
            counter!(SAVES_FAILED).increment(1);
            error!("savior: {:?} of {key} failed: {e}", item.action);
        }
    }

    fn execute(&self, key: &str, item: &SaveItem) -> Result<()> {
        match (item.action, &item.target) {
            (SaveAction::Save, SaveTarget::Internal(body)) => {
                body.change.lock_read();
                let result = body
                    .read()
                    .internal()
                    .to_record()
                    .map_err(Into::into)
                    .and_then(|record| self.replace(key, |writer| writer.write_all(&record.encode())));
                body.change.unlock_read();
                result
            }
            (SaveAction::Save, SaveTarget::Leaf(body)) => {
                body.change.lock_write();
                let result = self.save_leaf(key, body);
                body.change.unlock_write();
                result
            }
            (SaveAction::Save, SaveTarget::Base(record)) => {
                self.replace(key, |writer| writer.write_all(&record.encode()))
            }
            (SaveAction::Remove, SaveTarget::Leaf(body)) => {
                self.storage.remove_deferred(key)?;
                body.set_file(None);
                Ok(())
            }
            (SaveAction::Remove, _) => Ok(self.storage.remove(key)?),
        }
    }

    /// Writes a new file with `write` and renames it over `key`.
    fn replace(
        &self,
        key: &str,
        write: impl FnOnce(&mut dyn FileWriter) -> std::result::Result<(), StorageError>,
    ) -> Result<()> {
        let (mut writer, temp) = self.storage.create_unique()?;
        write(writer.as_mut())?;
        writer.complete()?;
        if let Err(e) = self.storage.rename(&temp, key) {
            if let Err(e) = self.storage.remove(&temp) {
                warn!("savior: could not remove {temp}: {e}");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Writes a leaf and points its values at the new file. The old file, if
    /// still open, is moved aside so readers of old values keep working.
    fn save_leaf(&self, key: &str, body: &NodeBody) -> Result<()> {
        let mut data = body.write();
        let leaf = data.leaf_mut();
        let header = leaf.header().encode();
        let mut values = Vec::with_capacity(leaf.entries.len());
        for (_, value) in &leaf.entries {
            values.push(value.read()?);
        }

        self.storage.supersede(key)?;
        self.replace(key, |writer| {
            writer.write_all(&header)?;
            values.iter().try_for_each(|value| writer.write_all(value))
        })?;

        let file = self.storage.open(key)?;
        let mut offset = header.len() as u64;
        for (_, value) in leaf.entries.iter_mut() {
            let len = value.len();
            *value = Value::Stored {
                file: file.clone(),
                offset,
                len,
            };
            offset += len;
        }
        body.set_file(Some(file));
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, key: String) {
        let worker = self.clone();
        let name = key.clone();
        match (self.spawn)("forest-savior", Box::new(move || worker.save_item(&name))) {
            Ok(handle) => {
                let mut state = self.lock();
                state.workers.retain(|handle| !handle.is_finished());
                state.workers.push(handle);
            }
            Err(e) => {
                // Never run inline: the requester may hold the change lock of
                // the target. The key waits for the timer or `save_all`.
                warn!("savior: could not spawn a worker ({e}), leaving {key} queued");
                let mut state = self.lock();
                if state.pending.contains_key(&key) {
                    state.queue.insert(key);
                }
                self.start_timer(&mut state);
            }
        }
    }

    /// Starts the timer thread unless it is already running.
    fn start_timer(self: &Arc<Self>, state: &mut State) {
        if state.timer_running || state.shutdown {
            return;
        }
        let inner = self.clone();
        let spawned = (self.spawn)("forest-savior-timer", Box::new(move || inner.sweep()));
        match spawned {
            Ok(handle) => {
                state.timer_running = true;
                state.timer = Some(handle);
            }
            Err(e) => warn!("savior: could not start the timer: {e}"),
        }
    }

    /// Timer loop: hands the oldest queued key to a worker every `delay`,
    /// until the queue is empty.
    fn sweep(self: Arc<Self>) {
        loop {
            thread::sleep(self.delay);
            let key = {
                let mut state = self.lock();
                // Keys left behind at shutdown are still pending and get
                // drained by `save_all`.
                match state.queue.shift_remove_index(0) {
                    Some(key) if !state.shutdown => key,
                    _ => {
                        state.timer_running = false;
                        return;
                    }
                }
            };
            self.dispatch(key);
        }
    }
}

/// The write-back scheduler.
pub struct Savior {
    inner: Arc<Inner>,
}

impl Savior {
    pub fn new(storage: Arc<dyn StorageBackend>, delay: Duration, queue_limit: usize) -> Self {
        Self::with_spawner(storage, delay, queue_limit, spawn_thread)
    }

    fn with_spawner(
        storage: Arc<dyn StorageBackend>,
        delay: Duration,
        queue_limit: usize,
        spawn: Spawner,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                spawn,
                state: Mutex::new(State::default()),
                finished: Condvar::new(),
                delay,
                queue_limit: queue_limit.max(1),
            }),
        }
    }

    /// Requests that `target` be written to `key`.
    pub fn put(&self, key: &str, target: SaveTarget) {
        self.request(key, SaveAction::Save, target);
    }

    /// Requests that the file `key` be deleted.
    pub fn remove(&self, key: &str, target: SaveTarget) {
        self.request(key, SaveAction::Remove, target);
    }

    fn request(&self, key: &str, action: SaveAction, target: SaveTarget) {
        counter!(SAVES_REQUESTED).increment(1);
        let mut overflow = Vec::new();
        let shutdown = {
            let mut state = self.inner.lock();
            state
                .pending
                .insert(key.to_string(), SaveItem { action, target });
            state.queue.shift_remove(key);
            state.queue.insert(key.to_string());
            while state.queue.len() > self.inner.queue_limit {
                overflow.extend(state.queue.shift_remove_index(0));
            }
            self.inner.start_timer(&mut state);
            state.shutdown
        };
        // The caller may still hold the target's change lock, so even after
        // shutdown the request runs on a worker.
        if shutdown {
            self.inner.dispatch(key.to_string());
        }
        for key in overflow {
            self.inner.dispatch(key);
        }
    }

    /// Waits until nothing is pending or executing for `key`, running a
    /// pending request inline if there is one. Called before loading `key`
    /// so that the load sees the newest requested content.
    pub fn get(&self, key: &str) {
        loop {
            {
                let mut state = self.inner.lock();
                while state.executing.contains(key) {
                    state = self.inner.finished.wait(state).unwrap();
                }
                if !state.pending.contains_key(key) {
                    return;
                }
            }
            self.inner.save_item(key);
        }
    }

    /// Called when a node stops being live. If the node has nothing waiting
    /// to be written, its file descriptor can go.
    pub fn leave(&self, key: &str, body: &NodeBody) {
        let idle = {
            let state = self.inner.lock();
            !state.pending.contains_key(key) && !state.executing.contains(key)
        };
        if idle {
            if let Some(file) = body.file() {
                file.close();
            }
        }
    }

    /// Executes every pending request and waits for all workers.
    pub fn save_all(&self) {
        loop {
            let keys: Vec<String> = self.inner.lock().pending.keys().cloned().collect();
            for key in &keys {
                self.inner.save_item(key);
            }
            let mut state = self.inner.lock();
            while !state.executing.is_empty() {
                state = self.inner.finished.wait(state).unwrap();
            }
            if state.pending.is_empty() {
                let workers = std::mem::take(&mut state.workers);
                drop(state);
                for worker in workers {
                    let _ = worker.join();
                }
                break;
            }
        }
        debug!("savior: drained");
    }

    /// Drains the savior and stops its timer. Later requests go straight to a
    /// worker, or stay pending for `save_all` if none can be started.
    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.save_all();
        let timer = self.inner.lock().timer.take();
        if let Some(timer) = timer {
            let _ = timer.join();
        }
    }

    /// Number of requests not executed yet.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
