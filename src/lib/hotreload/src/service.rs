//! The hot reload service: owns the linker, the loaded objects and the reload listener, and runs
//! each reload from start to finish.
use std::{
    ffi::{c_char, c_int},
    fs::File,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, info_span, warn};

use crate::{
    config::ReloadConfig,
    definitions::DefinitionInfo,
    error::{HotReloadError, HotReloadErrorKind},
    image,
    library::LibraryHandle,
    link::{JitLinker, LinkedObject},
    mangling::add_global_prefix,
    migrate::{
        host::{enter_safepoint, HostRuntime, TypeDescriptor},
        MigrationEngine, MigrationReport,
    },
    objects::ObjectManager,
    server::ReloadServer,
    stats::{current_epoch_millis, Stats, StatsCollector},
};

/// The C signature of the bootstrap entry point.
pub type EntryPoint = unsafe extern "C" fn(c_int, *const *const c_char) -> c_int;

type SuccessCallback = Box<dyn Fn() + Send + Sync>;

/// What one successful reload did.
#[derive(Clone, Debug, Default)]
pub struct ReloadOutcome {
    pub epoch: u64,
    pub rebound: usize,
    pub new_stubs: usize,
    pub migrations: Vec<MigrationReport>,
}

struct ReloadState {
    linker: JitLinker,
    objects: ObjectManager,
    libraries: Vec<LibraryHandle>,
    epoch: u64,
}

pub struct HotReloadService {
    config: ReloadConfig,
    host: Arc<dyn HostRuntime>,
    stats: Arc<StatsCollector>,
    state: Mutex<ReloadState>,
    success_callback: RwLock<Option<SuccessCallback>>,
    server: Mutex<Option<ReloadServer>>,
}

impl HotReloadService {
    /// Create a service for the machine we are running on.
    pub fn new(
        config: ReloadConfig,
        host: Arc<dyn HostRuntime>,
        stats: Arc<StatsCollector>,
    ) -> Result<Self, HotReloadError> {
        let linker = JitLinker::for_host(&config)?;
        Ok(Self::with_linker(config, host, stats, linker))
    }

    pub fn with_linker(
        config: ReloadConfig,
        host: Arc<dyn HostRuntime>,
        stats: Arc<StatsCollector>,
        linker: JitLinker,
    ) -> Self {
        Self {
            config,
            host,
            stats,
            state: Mutex::new(ReloadState {
                linker,
                objects: ObjectManager::new(),
                libraries: vec![],
                epoch: 0,
            }),
            success_callback: RwLock::new(None),
            server: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ReloadConfig {
        &self.config
    }

    /// A snapshot of the most recent reload's record.
    pub fn stats(&self) -> Stats {
        self.stats.current()
    }

    pub fn stats_collector(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    /// The number of successful reloads so far.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Register the function called after every successful reload, once mutators are running
    /// again. Replaces any previous callback.
    pub fn set_success_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.success_callback.write() = Some(Box::new(callback));
    }

    pub fn clear_success_callback(&self) {
        self.success_callback.write().take();
    }

    /// Stub bookkeeping for a managed function (unprefixed name).
    pub fn definition(&self, name: &str) -> Option<DefinitionInfo> {
        self.state.lock().linker.definitions().get(name)
    }

    /// The address callers of a managed function (unprefixed name) branch to.
    pub fn lookup_function(&self, name: &str) -> Option<usize> {
        self.state.lock().linker.lookup(&add_global_prefix(name))
    }

    /// Every shared library taken in by a successful reload, with its epoch.
    pub fn loaded_libraries(&self) -> Vec<(u64, PathBuf)> {
        self.state
            .lock()
            .libraries
            .iter()
            .map(|l| (l.epoch(), l.path().to_path_buf()))
            .collect()
    }

    /// The descriptor of the newest version of a class (unprefixed name).
    pub fn class_descriptor(&self, name: &str) -> Option<TypeDescriptor> {
        self.state
            .lock()
            .objects
            .newest_class(name)
            .map(|v| v.descriptor)
    }

    /// Link the configured bootstrap object and resolve the configured entry symbol.
    pub fn load_bootstrap(&self) -> Result<EntryPoint, HotReloadError> {
        self.load_bootstrap_from(&self.config.bootstrap_path, &self.config.entry_symbol)
    }

    pub fn load_bootstrap_from(
        &self,
        path: &Path,
        entry: &str,
    ) -> Result<EntryPoint, HotReloadError> {
        let _span = info_span!("bootstrap", path = %path.display()).entered();
        let mut state = self.state.lock();
        let map = map_object(path)?;
        let linked = state
            .linker
            .link_object(&path.display().to_string(), &map, 0)?;
        state.objects.register(0, linked.symbols);

        let raw_entry = add_global_prefix(entry);
        let address = state.linker.lookup(&raw_entry).ok_or_else(|| {
            HotReloadErrorKind::EntryPointMissing {
                name: raw_entry.clone(),
            }
        })?;
        info!("bootstrap entry {} at {:#x}", raw_entry, address);
        // Safety: the symbol names a function with the entry point signature, in code that stays
        // mapped for the life of the process.
        Ok(unsafe { std::mem::transmute::<usize, EntryPoint>(address) })
    }

    /// Reload one object or shared library. Mutators are parked for the whole operation; the
    /// success callback runs after they resume.
    pub fn reload(&self, path: &Path) -> Result<ReloadOutcome, HotReloadError> {
        let _span = info_span!("reload", path = %path.display()).entered();
        let outcome = {
            let mut state = self.state.lock();
            let safepoint = enter_safepoint(self.host.as_ref(), "hot reload");

            self.stats.register_start(current_epoch_millis());
            self.stats
                .register_loaded_object(&path.display().to_string());

            let epoch = state.epoch + 1;
            let linked = match load(&mut state, path, epoch) {
                Ok(linked) => linked,
                Err(e) => {
                    self.stats.register_end(current_epoch_millis());
                    self.stats.register_successful(false);
                    return Err(e);
                }
            };
            state.epoch = epoch;
            self.stats.register_rebound_symbols(linked.rebound);

            let classes = state.objects.redefined_classes(epoch);
            let migrations = MigrationEngine::new(self.host.as_ref()).migrate(&safepoint, classes);

            self.stats.register_end(current_epoch_millis());
            self.stats.register_successful(true);
            info!(
                "reload {} done: {} rebound, {} new stubs, {} classes migrated",
                epoch,
                linked.rebound,
                linked.new_stubs,
                migrations.len()
            );
            ReloadOutcome {
                epoch,
                rebound: linked.rebound,
                new_stubs: linked.new_stubs,
                migrations,
            }
        };

        self.notify_success();
        Ok(outcome)
    }

    pub(crate) fn notify_success(&self) {
        if let Some(callback) = self.success_callback.read().as_ref() {
            debug!("invoking reload success callback");
            callback();
        }
    }

    /// Reload and log the outcome. Returns whether the reload succeeded.
    pub fn request_reload(&self, path: &Path) -> bool {
        match self.reload(path) {
            Ok(_) => true,
            Err(e) => {
                error!("hot reload of {} failed: {:?}", path.display(), miette::Report::new(e));
                false
            }
        }
    }

    /// Start the reload listener on the configured port. Every path of every request is
    /// reloaded in order. Returns the bound address.
    pub fn start_server(self: &Arc<Self>) -> Result<SocketAddr, HotReloadError> {
        let mut slot = self.server.lock();
        if slot.as_ref().is_some_and(|s| s.is_running()) {
            return Err(HotReloadErrorKind::ServerAlreadyRunning.into());
        }
        let mut server = ReloadServer::new(self.config.port).with_backlog(self.config.backlog);
        server.start()?;
        let addr = server
            .local_addr()
            .ok_or(HotReloadErrorKind::ServerNotStarted)?;
        let service = Arc::downgrade(self);
        server.run(move |request| {
            let Some(service) = service.upgrade() else {
                warn!("reload request after the service was dropped");
                return;
            };
            for path in &request.paths {
                service.request_reload(path);
            }
        })?;
        *slot = Some(server);
        Ok(addr)
    }

    pub fn stop_server(&self) {
        if let Some(mut server) = self.server.lock().take() {
            server.stop();
        }
    }
}

fn is_shared_library(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some("dylib" | "so") => true,
        _ => path
            .file_name()
            .map(|n| n.to_string_lossy().contains(".so."))
            .unwrap_or(false),
    }
}

fn map_object(path: &Path) -> Result<Mmap, HotReloadError> {
    let io_error = |source| -> HotReloadError {
        HotReloadErrorKind::Io {
            path: path.display().to_string(),
            source,
        }
        .into()
    };
    let file = File::open(path).map_err(io_error)?;
    // Safety: the object is only read while linking, and reload inputs are not rewritten while a
    // reload is in progress.
    unsafe { Mmap::map(&file) }.map_err(io_error)
}

fn load(state: &mut ReloadState, path: &Path, epoch: u64) -> Result<LinkedObject, HotReloadError> {
    let name = path.display().to_string();
    if is_shared_library(path) {
        let library = LibraryHandle::open(path, epoch)?;
        let symbols = image::read_symbols(path)?;
        let linked = state.linker.redirect_functions(&name, &symbols, epoch)?;
        // Stubs now point into the library, so it stays loaded for good.
        state.libraries.push(library);
        state.objects.register(epoch, symbols);
        return Ok(linked);
    }
    let map = map_object(path)?;
    let linked = state.linker.link_object(&name, &map, epoch)?;
    state.objects.register(epoch, linked.symbols.clone());
    Ok(linked)
}
