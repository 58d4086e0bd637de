//! Shared engine state owned by the root connection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use fanload_error::ConnectionError;

use crate::config::EngineConfig;

/// Read-mostly state every connection derived from one root shares.
///
/// Lives inside the root for the whole run; workers hold a borrowed
/// [`ConnectionSlot`] into it. The two atomics are the only mutable parts.
#[derive(Debug)]
pub(crate) struct EngineCore {
    path: PathBuf,
    config: EngineConfig,
    open: AtomicUsize,
    sealed: AtomicBool,
}

impl EngineCore {
    /// The root itself occupies the first slot.
    pub(crate) fn new(path: PathBuf, config: EngineConfig) -> Self {
        Self {
            path,
            config,
            open: AtomicUsize::new(1),
            sealed: AtomicBool::new(false),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn seal(&self) -> bool {
        !self.sealed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Reserve room for one more connection.
    pub(crate) fn acquire_slot(&self) -> Result<ConnectionSlot<'_>, ConnectionError> {
        if self.is_sealed() {
            return Err(ConnectionError::RootClosed);
        }
        let limit = self.config.max_connections;
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < limit).then_some(open + 1)
            })
            .map_err(|_| ConnectionError::LimitExceeded { limit })?;
        Ok(ConnectionSlot { core: self })
    }
}

/// One reserved connection; released when dropped.
#[derive(Debug)]
pub(crate) struct ConnectionSlot<'r> {
    core: &'r EngineCore,
}

impl ConnectionSlot<'_> {
    pub(crate) fn core(&self) -> &EngineCore {
        self.core
    }
}

impl Drop for ConnectionSlot<'_> {
    fn drop(&mut self) {
        self.core.open.fetch_sub(1, Ordering::AcqRel);
    }
}
