// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk-backed key/value cache.
//!
//! Every key is mirrored to its own file, `{dir}/__{key}.json`, holding the
//! JSON object `{"<key>": <value>}`. Once a key has been loaded the in-memory
//! cache is authoritative and the file is never read again in this process.
//!
//! Writes go through a single [`StoreWriter`] task that drains a FIFO of
//! write jobs, so at most one file write is in flight and jobs land on disk in
//! call order. Each write goes to a temporary file in the same directory and
//! is renamed over the target, so a reader never sees a partial file.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::errors::StoreError;

type Cache = Arc<Mutex<HashMap<String, Value>>>;

/// Completion signal for a single durable write.
pub type WriteCompletion = oneshot::Receiver<Result<(), StoreError>>;

enum WriteJob {
    Write {
        key: String,
        value: Value,
        done: oneshot::Sender<Result<(), StoreError>>,
    },
    Barrier(oneshot::Sender<()>),
}

pub struct PersistentStore {
    dir: PathBuf,
    cache: Cache,
    writes: mpsc::UnboundedSender<WriteJob>,
}

/// Background task performing the serialized disk writes for a [`PersistentStore`].
pub struct StoreWriter {
    dir: PathBuf,
    rx: mpsc::UnboundedReceiver<WriteJob>,
}

/// Cloneable handle able to force every cached key to disk, for use from a
/// panic hook or other fatal-error path that cannot reach the owner task.
#[derive(Clone)]
pub struct FatalFlusher {
    dir: PathBuf,
    cache: Cache,
}

impl PersistentStore {
    /// Opens the store rooted at `dir`, creating the directory if needed.
    /// The returned writer must be spawned for durable writes to happen.
    pub fn open(dir: impl AsRef<Path>) -> Result<(Self, StoreWriter), StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let store = PersistentStore {
            dir: dir.clone(),
            cache: Arc::new(Mutex::new(HashMap::new())),
            writes: tx,
        };
        Ok((store, StoreWriter { dir, rx }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the value for `key`, loading it from disk on first access.
    ///
    /// A missing or empty file yields `default`. A file that fails to parse is
    /// renamed aside and `default` is used. Whatever is returned is cached.
    pub fn get(&self, key: &str, default: Value) -> Value {
        let mut cache = lock(&self.cache);
        if let Some(value) = cache.get(key) {
            return value.clone();
        }
        let value = load_file(&self.dir, key).unwrap_or(default);
        cache.insert(key.to_string(), value.clone());
        value
    }

    /// Typed variant of [`PersistentStore::get`]. A missing key caches the
    /// serialized `default`. A cached value that does not deserialize into `T`
    /// is logged and replaced by `default`.
    pub fn get_as<T>(&self, key: &str, default: T) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        let fallback = match serde_json::to_value(&default) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to serialize default for {key}: {e}");
                Value::Null
            }
        };
        let raw = self.get(key, fallback);
        if raw.is_null() {
            return default;
        }
        match serde_json::from_value(raw) {
            Ok(value) => value,
            Err(e) => {
                error!("Stored value for {key} has an unexpected shape, using default: {e}");
                default
            }
        }
    }

    /// Updates the cache immediately and schedules a durable write behind any
    /// write already queued.
    pub fn set(&self, key: &str, value: Value) -> WriteCompletion {
        lock(&self.cache).insert(key.to_string(), value.clone());
        let (done, completion) = oneshot::channel();
        let job = WriteJob::Write {
            key: key.to_string(),
            value,
            done,
        };
        if let Err(mpsc::error::SendError(job)) = self.writes.send(job) {
            warn!("Store writer is not running, {key} is only held in memory");
            if let WriteJob::Write { done, .. } = job {
                let _ = done.send(Err(StoreError::WriterGone));
            }
        }
        completion
    }

    pub fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<WriteCompletion, StoreError> {
        Ok(self.set(key, serde_json::to_value(value)?))
    }

    /// Resolves once every write scheduled before this call has reached disk
    /// (or failed).
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.barrier()?.await.map_err(|_| StoreError::WriterGone)
    }

    /// Queues a barrier and returns the signal that fires once the writer
    /// reaches it, without waiting.
    pub fn barrier(&self) -> Result<oneshot::Receiver<()>, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.writes
            .send(WriteJob::Barrier(tx))
            .map_err(|_| StoreError::WriterGone)?;
        Ok(rx)
    }

    /// Writes every cached key synchronously, bypassing the write queue.
    pub fn force_flush(&self) -> Result<(), StoreError> {
        self.fatal_flusher().force_flush()
    }

    pub fn fatal_flusher(&self) -> FatalFlusher {
        FatalFlusher {
            dir: self.dir.clone(),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl FatalFlusher {
    /// Writes every cached key to disk, returning the first error seen.
    /// All keys are attempted even if an earlier one fails.
    pub fn force_flush(&self) -> Result<(), StoreError> {
        let snapshot: Vec<(String, Value)> = lock(&self.cache)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut first_error = None;
        for (key, value) in snapshot {
            if let Err(e) = write_file(&self.dir, &key, &value) {
                error!("Force flush of {key} failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl StoreWriter {
    pub async fn run(mut self) {
        debug!("Store writer started");
        while let Some(job) = self.rx.recv().await {
            match job {
                WriteJob::Write { key, value, done } => {
                    let dir = self.dir.clone();
                    let file_key = key.clone();
                    let result = match tokio::task::spawn_blocking(move || {
                        write_file(&dir, &file_key, &value)
                    })
                    .await
                    {
                        Ok(result) => result,
                        Err(e) => Err(StoreError::Io(std::io::Error::other(e))),
                    };
                    if let Err(e) = &result {
                        // the cache still holds the value; the next set for this key rewrites it
                        error!("Failed to persist {key}: {e}");
                    }
                    let _ = done.send(result);
                }
                WriteJob::Barrier(tx) => {
                    let _ = tx.send(());
                }
            }
        }
        debug!("Store writer stopped");
    }
}

fn lock(cache: &Cache) -> MutexGuard<'_, HashMap<String, Value>> {
    // a panic while holding the lock must not stop the fatal flush path
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn file_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("__{key}.json"))
}

fn load_file(dir: &Path, key: &str) -> Option<Value> {
    let path = file_path(dir, key);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            error!("Failed to read {}: {e}", path.display());
            return None;
        }
    };
    if contents.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Map<String, Value>>(&contents) {
        Ok(mut object) => object.remove(key),
        Err(e) => {
            error!("Corrupt store file {}: {e}", path.display());
            quarantine(dir, key, &path);
            None
        }
    }
}

fn quarantine(dir: &Path, key: &str, path: &Path) {
    let suffix = format!(
        "{}{}",
        chrono::Utc::now().timestamp_millis(),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    );
    let target = dir.join(format!("__{key}.{suffix}.json"));
    match fs::rename(path, &target) {
        Ok(()) => warn!("Moved corrupt store file to {}", target.display()),
        Err(e) => error!("Failed to quarantine {}: {e}", path.display()),
    }
}

fn write_file(dir: &Path, key: &str, value: &Value) -> Result<(), StoreError> {
    let mut body = Map::new();
    body.insert(key.to_string(), value.clone());
    let bytes = serde_json::to_vec(&body)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_data()?;
    tmp.persist(file_path(dir, key)).map_err(|e| e.error)?;
    Ok(())
}
