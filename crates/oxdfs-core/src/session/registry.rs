//! Session registry for clean shutdown.
//!
//! Every connected [`FilesystemHandle`](crate::client::FilesystemHandle)
//! registers itself here and deregisters on disconnect. The registry holds
//! only weak references, so it never keeps a session alive; its one job is
//! to let a process disconnect whatever is still open before it exits.
//!
//! # Global vs. injected registries
//!
//! [`SessionRegistry::global`] is the process default. Tests and embedders
//! that need isolation create their own with [`SessionRegistry::new`] and
//! pass it to
//! [`FilesystemHandle::connect_with_registry`](crate::client::FilesystemHandle::connect_with_registry).
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use oxdfs_core::client::FilesystemHandle;
//! use oxdfs_core::session::SessionRegistry;
//! use oxdfs_core::transport::MemoryTransport;
//!
//! let registry = Arc::new(SessionRegistry::new());
//! let transport = Arc::new(MemoryTransport::new());
//!
//! let fs = FilesystemHandle::connect_with_registry(transport, "default", 0, "", registry.clone())?;
//! assert_eq!(registry.len(), 1);
//!
//! let report = registry.shutdown_all();
//! assert_eq!(report.disconnected, 1);
//! assert!(!fs.is_connected());
//! # Ok::<(), oxdfs_core::error::DfsError>(())
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::DfsError;
use crate::transport::{ConnectTarget, SessionRef};

/// Global registry singleton.
static GLOBAL_SESSION_REGISTRY: OnceLock<Arc<SessionRegistry>> = OnceLock::new();

/// A session the registry can shut down.
pub(crate) trait LiveSession: Send + Sync {
    /// Disconnect if still connected. Returns `Ok(false)` if it already was.
    fn shutdown(&self) -> Result<bool, DfsError>;
}

/// Diagnostic snapshot of a registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Registry-assigned id, unique for the lifetime of the registry
    pub id: u64,
    /// The filesystem the session is connected to
    pub target: ConnectTarget,
    /// The user the session was opened as (`None` for the ambient identity)
    pub user: Option<String>,
    /// The transport's session reference
    pub session: SessionRef,
}

/// Outcome of [`SessionRegistry::shutdown_all`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Sessions disconnected by this call
    pub disconnected: usize,
    /// Sessions whose release reported an error. They are disconnected anyway.
    pub failures: Vec<(SessionSummary, DfsError)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Registration {
    summary: SessionSummary,
    session: Weak<dyn LiveSession>,
}

/// Registry of live sessions.
///
/// # Thread Safety
///
/// Registration and deregistration are lock-free with respect to each
/// other and to in-flight I/O: the registry is a `DashMap` and is never
/// consulted on the I/O path.
pub struct SessionRegistry {
    sessions: DashMap<u64, Registration>,
    /// Next id to assign (starts at 1, 0 is never handed out)
    next_id: AtomicU64,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Get the global registry singleton.
    pub fn global() -> Arc<Self> {
        GLOBAL_SESSION_REGISTRY
            .get_or_init(|| Arc::new(Self::new()))
            .clone()
    }

    pub(crate) fn register(
        &self,
        target: ConnectTarget,
        user: Option<String>,
        session: SessionRef,
        live: Weak<dyn LiveSession>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let summary = SessionSummary {
            id,
            target,
            user,
            session,
        };
        debug!(id, session = %summary.session, filesystem = %summary.target, "Registered session");
        self.sessions.insert(
            id,
            Registration {
                summary,
                session: live,
            },
        );
        id
    }

    /// Remove a session. Returns `true` if it was registered.
    pub(crate) fn deregister(&self, id: u64) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if removed {
            debug!(id, "Deregistered session");
        }
        removed
    }

    /// Snapshots of all sessions that are still alive.
    pub fn live_sessions(&self) -> Vec<SessionSummary> {
        let mut live: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|entry| entry.session.strong_count() > 0)
            .map(|entry| entry.summary.clone())
            .collect();
        live.sort_by_key(|s| s.id);
        live
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Disconnect every session still registered.
    ///
    /// Sessions whose handles were already dropped are simply forgotten.
    /// Each session's own disconnect path deregisters it.
    pub fn shutdown_all(&self) -> ShutdownReport {
        // Collect first: shutting a session down deregisters it, which must
        // not happen while a shard guard is held.
        let pending: Vec<(SessionSummary, Weak<dyn LiveSession>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.summary.clone(), entry.session.clone()))
            .collect();

        let mut report = ShutdownReport::default();
        for (summary, weak) in pending {
            let Some(session) = weak.upgrade() else {
                self.deregister(summary.id);
                continue;
            };
            match session.shutdown() {
                Ok(true) => report.disconnected += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(id = summary.id, error = %e, "Session release failed during shutdown");
                    report.failures.push((summary.clone(), e));
                }
            }
            self.deregister(summary.id);
        }

        info!(
            disconnected = report.disconnected,
            failures = report.failures.len(),
            "Session registry shut down"
        );
        report
    }
}
