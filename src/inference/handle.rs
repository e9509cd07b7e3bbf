//! Engine lifecycle and the process-wide serialization lock.
//!
//! [`EngineHandle`] caches the single loaded engine together with the config
//! it was built from and rebuilds it when a different config is requested.
//! [`SharedEngine`] wraps the handle in the one mutex that every engine call
//! goes through, so at most one thread is ever inside the engine.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use prometheus::IntCounter;
use tracing::{info, warn};

use crate::inference::backend::{ChatEngine, EngineError, EngineFactory};

/// Identifies which engine instance should be active.
///
/// Equality only looks at the resolved weights path.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Resolved path to the weights file.
    pub path: PathBuf,

    /// Number of CPU threads handed to the engine.
    pub n_threads: usize,

    /// Context window in tokens.
    pub context_size: usize,
}

impl PartialEq for EngineConfig {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for EngineConfig {}

impl EngineConfig {
    pub fn new(path: impl AsRef<Path>, n_threads: usize) -> Self {
        Self {
            path: expand_home(path.as_ref()),
            n_threads: n_threads.max(1),
            context_size: 4096,
        }
    }

    pub fn with_context_size(mut self, context_size: usize) -> Self {
        self.context_size = context_size;
        self
    }
}

/// Expand a leading `~/` against `$HOME`.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Cache of the single engine instance.
///
/// `loaded` holds the config and the instance built from exactly that config,
/// so one is never present without the other.
pub struct EngineHandle {
    factory: Arc<dyn EngineFactory>,
    loaded: Option<(EngineConfig, Box<dyn ChatEngine>)>,
    loads: IntCounter,
}

impl EngineHandle {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        let loads = IntCounter::new("chat_engine_loads_total", "Engine instances built")
            .expect("static metric name is valid");
        Self {
            factory,
            loaded: None,
            loads,
        }
    }

    /// Return the cached engine for `config`, building it first if needed.
    ///
    /// A cached instance built from a different config is dropped before the
    /// new one is constructed.
    pub fn ensure_loaded(&mut self, config: &EngineConfig) -> Result<&mut dyn ChatEngine, EngineError> {
        if let Some((cached, _)) = &self.loaded {
            if cached != config {
                info!(
                    from = %cached.path.display(),
                    to = %config.path.display(),
                    "Engine config changed, dropping cached instance"
                );
                self.loaded = None;
            }
        }

        if self.loaded.is_none() {
            if !config.path.exists() {
                return Err(EngineError::Unavailable(format!(
                    "Could not find model file at {}. Set LLAMA_MODEL_PATH or download the default weights.",
                    config.path.display()
                )));
            }
            let engine = self.factory.build(config)?;
            self.loads.inc();
            info!(
                path = %config.path.display(),
                n_threads = config.n_threads,
                loads = self.loads.get(),
                "Engine loaded"
            );
            self.loaded = Some((config.clone(), engine));
        }

        match self.loaded.as_mut() {
            Some((_, engine)) => Ok(&mut **engine),
            None => Err(EngineError::Unavailable("engine not loaded".to_string())),
        }
    }

    /// Config of the cached instance, if any.
    pub fn current(&self) -> Option<&EngineConfig> {
        self.loaded.as_ref().map(|(config, _)| config)
    }

    /// Drop the cached instance so the next call rebuilds it.
    pub fn invalidate(&mut self) {
        self.loaded = None;
    }

    /// Number of engine instances built so far.
    pub fn load_count(&self) -> u64 {
        self.loads.get()
    }

    pub fn load_counter(&self) -> IntCounter {
        self.loads.clone()
    }
}

/// The serialization lock around the engine handle.
///
/// Acquisition is strictly exclusive and unconditionally blocking; it is
/// meant to be taken from blocking worker threads, never from async tasks.
#[derive(Clone)]
pub struct SharedEngine {
    inner: Arc<Mutex<EngineHandle>>,
    load_counter: IntCounter,
}

impl SharedEngine {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        let handle = EngineHandle::new(factory);
        let load_counter = handle.load_counter();
        Self {
            inner: Arc::new(Mutex::new(handle)),
            load_counter,
        }
    }

    /// Acquire the lock, blocking the current thread.
    ///
    /// If a previous holder panicked mid-call the engine state is suspect, so
    /// the cached instance is invalidated and the lock recovered.
    pub fn lock(&self) -> MutexGuard<'_, EngineHandle> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Engine lock poisoned by a panicking call, invalidating cached engine");
                let mut guard = poisoned.into_inner();
                guard.invalidate();
                self.inner.clear_poison();
                guard
            }
        }
    }

    /// Ensure the engine is loaded and run `f` against it, all under the lock.
    pub fn with_engine<T, E>(
        &self,
        config: &EngineConfig,
        f: impl FnOnce(&mut dyn ChatEngine) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<EngineError>,
    {
        let mut handle = self.lock();
        let engine = handle.ensure_loaded(config)?;
        f(engine)
    }

    /// Load the engine ahead of the first request.
    pub fn preload(&self, config: &EngineConfig) -> Result<(), EngineError> {
        self.with_engine(config, |_| Ok::<(), EngineError>(()))
    }

    pub fn load_count(&self) -> u64 {
        self.load_counter.get()
    }

    pub fn load_counter(&self) -> IntCounter {
        self.load_counter.clone()
    }
}
