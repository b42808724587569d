//! Backend discovery and one-shot initialization
//!
//! A [`Runtime`] owns at most one backend and walks it through
//! `Uninitialized -> Active -> Finalized`. The first successful
//! [`Runtime::init`] bootstraps the backend, synthesizes the
//! [`TypeRegistry`] and hands out the world [`Group`]; later calls return
//! that same group. Once the world group is dropped the backend is finalized
//! and the runtime never bootstraps again.
//!
//! The process-wide runtime behind [`crate::init`] probes for the native
//! library on first use, configured from the environment.

use crate::backend::{CommBackend, LoadError, MpiBackend};
use crate::config::LoaderConfig;
use crate::error::{Error, Result};
use crate::group::{Group, GroupInner};
use crate::registry::TypeRegistry;
use parking_lot::Mutex;
use std::sync::{Arc, LazyLock, OnceLock, Weak};
use tracing::{debug, info, warn};

static GLOBAL: LazyLock<Runtime> = LazyLock::new(|| Runtime::from_config(&LoaderConfig::from_env()));

/// Process-wide runtime
pub fn global() -> &'static Runtime {
    &GLOBAL
}

pub(crate) enum InitState {
    Uninitialized,
    Active(Weak<GroupInner>),
    Finalized,
}

pub(crate) struct Shared {
    backend: Option<Arc<dyn CommBackend>>,
    load_error: Option<Error>,
    state: Mutex<InitState>,
    registry: OnceLock<Arc<TypeRegistry>>,
}

impl Shared {
    /// Finalize after the world group's last handle is gone
    pub(crate) fn release_world(&self, backend: &dyn CommBackend) {
        let mut state = self.state.lock();
        if matches!(*state, InitState::Finalized) {
            return;
        }
        *state = InitState::Finalized;
        match backend.finalize() {
            Ok(()) => info!(backend = backend.name(), "distributed runtime finalized"),
            Err(err) => warn!(backend = backend.name(), error = %err, "finalize failed"),
        }
    }
}

/// Owner of one communication backend and its world group
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    pub fn new(backend: Arc<dyn CommBackend>) -> Self {
        Self::with_backend(Some(backend), None)
    }

    /// Runtime with no backend; `init` always fails
    pub fn unavailable() -> Self {
        Self::with_backend(None, None)
    }

    /// Probe for the native library; any load failure yields an unavailable runtime
    pub fn from_config(config: &LoaderConfig) -> Self {
        if config.disabled {
            debug!("distributed backend disabled by configuration");
            return Self::unavailable();
        }
        match MpiBackend::load(config) {
            Ok(backend) => Self::new(Arc::new(backend)),
            Err(err) => {
                if matches!(err, LoadError::VersionMismatch { .. }) {
                    warn!(error = %err, "communication library rejected");
                } else {
                    debug!(error = %err, "communication library not available");
                }
                Self::with_backend(None, Some(err.into()))
            }
        }
    }

    fn with_backend(backend: Option<Arc<dyn CommBackend>>, load_error: Option<Error>) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                load_error,
                state: Mutex::new(InitState::Uninitialized),
                registry: OnceLock::new(),
            }),
        }
    }

    /// Whether a backend is bound; never initializes anything
    pub fn is_available(&self) -> bool {
        self.shared.backend.is_some()
    }

    /// Why probing for the native library failed, when it did
    ///
    /// [`Error::VersionMismatch`] for a library with the wrong identity,
    /// [`Error::BackendUnavailable`] for any other load failure.
    pub fn load_error(&self) -> Option<&Error> {
        self.shared.load_error.as_ref()
    }

    /// Name of the bound backend
    pub fn backend_name(&self) -> Option<&'static str> {
        self.shared.backend.as_ref().map(|b| b.name())
    }

    /// World group, bootstrapping the backend on first success
    ///
    /// Failures return `Ok(None)`, or `Err(Error::Initialization)` when
    /// `strict` is set.
    pub fn init(&self, strict: bool) -> Result<Option<Group>> {
        let Some(backend) = self.shared.backend.as_ref() else {
            let reason = match self.load_error() {
                Some(err) => format!("no communication backend is available: {err}"),
                None => "no communication backend is available".to_string(),
            };
            return fail(strict, reason);
        };

        let mut state = self.shared.state.lock();
        match &*state {
            InitState::Active(world) => {
                return match world.upgrade() {
                    Some(inner) => Ok(Some(Group::from_inner(inner))),
                    None => fail(strict, "world group was already released".to_string()),
                };
            }
            InitState::Finalized => {
                return fail(strict, "backend was already finalized".to_string());
            }
            InitState::Uninitialized => {}
        }

        if let Err(err) = backend.init() {
            warn!(backend = backend.name(), error = %err, "backend bootstrap failed");
            return fail(strict, err.to_string());
        }

        let registry = match self.shared.registry.get() {
            Some(registry) => Arc::clone(registry),
            None => match TypeRegistry::synthesize(backend.as_ref()) {
                Ok(registry) => Arc::clone(self.shared.registry.get_or_init(|| Arc::new(registry))),
                Err(err) => {
                    warn!(backend = backend.name(), error = %err, "type registry synthesis failed");
                    if let Err(finalize_err) = backend.finalize() {
                        warn!(error = %finalize_err, "finalize after failed synthesis failed");
                    }
                    *state = InitState::Finalized;
                    return fail(strict, err.to_string());
                }
            },
        };

        let world = Group::world(Arc::clone(backend), registry, Arc::clone(&self.shared));
        *state = InitState::Active(world.downgrade());
        info!(backend = backend.name(), "distributed runtime initialized");
        Ok(Some(world))
    }
}

fn fail(strict: bool, reason: String) -> Result<Option<Group>> {
    if strict {
        Err(Error::Initialization(reason))
    } else {
        debug!(%reason, "distributed init unavailable");
        Ok(None)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.backend_name())
            .finish_non_exhaustive()
    }
}
