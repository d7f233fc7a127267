//! [StorageBackend] implementation using POSIX I/O on one directory.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use metrics::counter;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::metrics::{
    FILES_CREATED, FILES_DEFERRED, FILES_DELETED, FILES_EVICTED, FILES_OPENED, TOTAL_BYTES_READ,
    TOTAL_BYTES_WRITTEN,
};
use crate::{CloseCallback, FileReader, FileWriter, StorageBackend, StorageError};

/// Extension given to files moved out of the way by
/// [StorageBackend::supersede].
const SUPERSEDED_EXTENSION: &str = "old";

/// State shared by the backend and all of its readers.
struct Shared {
    base: PathBuf,
    open_files_limit: usize,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    /// Live readers, by current file name.
    by_name: HashMap<String, Weak<PosixReader>>,

    /// Readers holding an open descriptor, least recently used first.
    lru: BTreeMap<u64, Weak<PosixReader>>,

    /// Next LRU serial number. Serial 0 means "no descriptor open".
    next_serial: u64,
}

impl Shared {
    fn path(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }

    /// Looks up the live reader for `name`, if any.
    fn live(&self, name: &str) -> Option<Arc<PosixReader>> {
        let registry = self.registry.lock().unwrap();
        registry.by_name.get(name).and_then(Weak::upgrade)
    }

    /// Marks `reader` as the most recently used open descriptor and returns
    /// the readers whose descriptors must be closed to respect the ceiling.
    ///
    /// The caller must close the returned readers after this returns, outside
    /// of the registry lock.
    #[must_use]
    fn touch(&self, reader: &PosixReader) -> Vec<Arc<PosixReader>> {
        let mut registry = self.registry.lock().unwrap();
        let old = reader.serial.load(Ordering::Relaxed);
        if old != 0 {
            registry.lru.remove(&old);
        }
        registry.next_serial += 1;
        let serial = registry.next_serial;
        reader.serial.store(serial, Ordering::Relaxed);
        registry.lru.insert(serial, reader.me.clone());

        let mut victims = Vec::new();
        while registry.lru.len() > self.open_files_limit {
            let Some((victim_serial, victim)) = registry.lru.pop_first() else {
                break;
            };
            debug_assert_ne!(victim_serial, serial);
            if let Some(victim) = victim.upgrade() {
                victim.serial.store(0, Ordering::Relaxed);
                victims.push(victim);
            }
        }
        victims
    }

    /// Removes `reader` from the LRU of open descriptors.
    fn forget(&self, reader: &PosixReader) {
        let mut registry = self.registry.lock().unwrap();
        let serial = reader.serial.swap(0, Ordering::Relaxed);
        if serial != 0 {
            registry.lru.remove(&serial);
        }
    }

    /// Drops the registry entry for `name` if it still refers to `reader`.
    fn unregister(&self, name: &str, reader: &Weak<PosixReader>) {
        let mut registry = self.registry.lock().unwrap();
        if registry
            .by_name
            .get(name)
            .is_some_and(|entry| entry.ptr_eq(reader))
        {
            registry.by_name.remove(name);
        }
    }

    /// Deletes `name` on behalf of a close callback.
    fn delete(&self, name: &str) {
        match fs::remove_file(self.path(name)) {
            Ok(()) => {
                trace!("deleted closed file {name}");
                counter!(FILES_DELETED).increment(1);
            }
            Err(error) if error.kind() == ErrorKind::NotFound => (),
            Err(error) => warn!("Unable to delete file {name:?}: {error:?}"),
        }
    }

    fn delete_on_close(self: &Arc<Self>) -> CloseCallback {
        let shared = self.clone();
        Box::new(move |name: &str| shared.delete(name))
    }
}

fn close_all(victims: Vec<Arc<PosixReader>>) {
    for victim in victims {
        if victim.evict() {
            counter!(FILES_EVICTED).increment(1);
        }
    }
}

/// A reader for one file.
///
/// The descriptor is opened when the reader is created, may be closed at any
/// time by [FileReader::close] or by the open-file ceiling, and is reopened by
/// the next read.
pub struct PosixReader {
    me: Weak<PosixReader>,
    shared: Arc<Shared>,
    name: Mutex<String>,
    fd: Mutex<Option<File>>,
    /// LRU serial, guarded by the registry lock; 0 when not in the LRU.
    /// Changes to it that accompany opening or closing the descriptor happen
    /// under `fd` as well.
    serial: AtomicU64,
    callbacks: Mutex<Vec<CloseCallback>>,
}

impl Debug for PosixReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosixReader")
            .field("name", &*self.name.lock().unwrap())
            .finish()
    }
}

impl PosixReader {
    fn with_file<T>(
        &self,
        op: impl FnOnce(&File) -> std::io::Result<T>,
    ) -> Result<T, StorageError> {
        let mut fd = self.fd.lock().unwrap();
        let file = match fd.take() {
            Some(file) => file,
            None => {
                // Held through the open so that `relocate` cannot rename the
                // file between reading the name and opening it.
                let name = self.name.lock().unwrap();
                let file = File::open(self.shared.path(&name))
                    .map_err(|error| StorageError::with_name(error, &name))?;
                counter!(FILES_OPENED).increment(1);
                file
            }
        };
        let result = op(&file);
        *fd = Some(file);
        let victims = self.shared.touch(self);
        drop(fd);

        close_all(victims);
        Ok(result?)
    }

    /// Closes the descriptor if the ceiling still wants it closed, that is,
    /// if no read has touched it since it was picked. Returns true if a
    /// descriptor was closed.
    fn evict(&self) -> bool {
        let mut fd = self.fd.lock().unwrap();
        if self.serial.load(Ordering::Relaxed) != 0 {
            return false;
        }
        fd.take().is_some()
    }

    /// Renames the underlying file to `new_name`, keeping the reader usable.
    fn relocate(&self, new_name: &str) -> Result<(), StorageError> {
        let mut name = self.name.lock().unwrap();
        fs::rename(self.shared.path(&name), self.shared.path(new_name))
            .map_err(|error| StorageError::with_name(error, &name))?;
        let old = std::mem::replace(&mut *name, new_name.to_string());
        self.shared.unregister(&old, &self.me);
        self.shared
            .registry
            .lock()
            .unwrap()
            .by_name
            .insert(new_name.to_string(), self.me.clone());
        debug!("moved {old} aside to {new_name}");
        Ok(())
    }
}

impl FileReader for PosixReader {
    fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    fn read_some_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let data = self.with_file(|file| {
            let mut buffer = vec![0; len];
            let mut filled = 0;
            while filled < len {
                match file.read_at(&mut buffer[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                    Err(error) => return Err(error),
                }
            }
            buffer.truncate(filled);
            Ok(buffer)
        })?;
        counter!(TOTAL_BYTES_READ).increment(data.len() as u64);
        Ok(data)
    }

    fn close(&self) {
        let mut fd = self.fd.lock().unwrap();
        fd.take();
        self.shared.forget(self);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }
}

impl Drop for PosixReader {
    fn drop(&mut self) {
        let name = std::mem::take(&mut *self.name.lock().unwrap());
        self.close();
        self.shared.unregister(&name, &self.me);
        for callback in self.callbacks.lock().unwrap().drain(..) {
            callback(&name);
        }
    }
}

/// Deletes the file on drop unless told to keep it.
struct DeleteOnDrop {
    path: PathBuf,
    keep: AtomicBool,
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if !self.keep.load(Ordering::Relaxed) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Unable to delete file {:?}: {:?}", self.path, e);
            } else {
                counter!(FILES_DELETED).increment(1);
            }
        }
    }
}

impl DeleteOnDrop {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            keep: AtomicBool::new(false),
        }
    }
    fn keep(&self) {
        self.keep.store(true, Ordering::Relaxed);
    }
}

/// A file being written.
struct PosixWriter {
    name: String,
    file: BufWriter<File>,
    position: u64,
    // Declared last so the file is closed before it may be deleted.
    drop: DeleteOnDrop,
}

impl FileWriter for PosixWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.file.write_all(data)?;
        self.position += data.len() as u64;
        counter!(TOTAL_BYTES_WRITTEN).increment(data.len() as u64);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn complete(mut self: Box<Self>) -> Result<String, StorageError> {
        self.file.flush()?;
        self.drop.keep();
        Ok(self.name.clone())
    }
}

/// POSIX storage over a single directory.
pub struct PosixBackend {
    shared: Arc<Shared>,
}

impl PosixBackend {
    /// Instantiates a backend rooted at `base`, creating the directory if
    /// needed. At most `open_files_limit` readers keep a descriptor open at
    /// once.
    pub fn new<P: AsRef<Path>>(base: P, open_files_limit: usize) -> Result<Self, StorageError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self {
            shared: Arc::new(Shared {
                base,
                open_files_limit: open_files_limit.max(1),
                registry: Mutex::new(Registry::default()),
            }),
        })
    }
}

impl StorageBackend for PosixBackend {
    fn create_named(&self, name: &str) -> Result<Box<dyn FileWriter>, StorageError> {
        let path = self.shared.path(name);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        counter!(FILES_CREATED).increment(1);
        Ok(Box::new(PosixWriter {
            name: name.to_string(),
            file: BufWriter::new(file),
            position: 0,
            drop: DeleteOnDrop::new(path),
        }))
    }

    fn open(&self, name: &str) -> Result<Arc<dyn FileReader>, StorageError> {
        let mut registry = self.shared.registry.lock().unwrap();
        if let Some(reader) = registry.by_name.get(name).and_then(Weak::upgrade) {
            return Ok(reader);
        }
        let file = File::open(self.shared.path(name))
            .map_err(|error| StorageError::with_name(error, name))?;
        counter!(FILES_OPENED).increment(1);
        let reader = Arc::new_cyclic(|me| PosixReader {
            me: me.clone(),
            shared: self.shared.clone(),
            name: Mutex::new(name.to_string()),
            fd: Mutex::new(Some(file)),
            serial: AtomicU64::new(0),
            callbacks: Mutex::new(Vec::new()),
        });
        registry
            .by_name
            .insert(name.to_string(), Arc::downgrade(&reader));
        drop(registry);

        close_all(self.shared.touch(&reader));
        Ok(reader)
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let data = fs::read(self.shared.path(name))
            .map_err(|error| StorageError::with_name(error, name))?;
        counter!(TOTAL_BYTES_READ).increment(data.len() as u64);
        Ok(data)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        fs::rename(self.shared.path(from), self.shared.path(to))
            .map_err(|error| StorageError::with_name(error, from))
    }

    fn remove(&self, name: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.shared.path(name)) {
            Ok(()) => {
                counter!(FILES_DELETED).increment(1);
                Ok(())
            }
            Err(error) => StorageError::ignore_notfound(Err::<(), _>(error.into())),
        }
    }

    fn supersede(&self, name: &str) -> Result<(), StorageError> {
        let Some(reader) = self.shared.live(name) else {
            return Ok(());
        };
        let aside = format!("{}.{SUPERSEDED_EXTENSION}", Uuid::now_v7());
        reader.relocate(&aside)?;
        reader.on_close(self.shared.delete_on_close());
        counter!(FILES_DEFERRED).increment(1);
        Ok(())
    }

    fn remove_deferred(&self, name: &str) -> Result<(), StorageError> {
        match self.shared.live(name) {
            Some(reader) => {
                self.shared.unregister(name, &reader.me);
                reader.on_close(self.shared.delete_on_close());
                counter!(FILES_DEFERRED).increment(1);
                Ok(())
            }
            None => self.remove(name),
        }
    }

    fn exists(&self, name: &str) -> bool {
        self.shared.path(name).exists()
    }

    fn file_count(&self) -> Result<usize, StorageError> {
        let mut count = 0;
        for entry in fs::read_dir(&self.shared.base)? {
            if entry?.file_type()?.is_file() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn open_files(&self) -> usize {
        self.shared.registry.lock().unwrap().lru.len()
    }

    fn base(&self) -> &Path {
        &self.shared.base
    }
}
