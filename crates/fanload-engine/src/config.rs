//! Engine options applied when a connection is opened.

use std::time::Duration;

use fanload_error::ConnectionError;

/// Journal modes the engine accepts for `journal_mode`.
const JOURNAL_MODES: &[&str] = &["wal", "delete", "truncate", "persist", "memory", "off"];

/// Synchronous levels the engine accepts for `synchronous`.
const SYNCHRONOUS_LEVELS: &[&str] = &["off", "normal", "full", "extra"];

/// Engine configuration shared by a root connection and every duplicate of it.
///
/// The root owns one copy for the lifetime of the run; duplicates are opened
/// with exactly the same settings, so engine-level behaviour (internal
/// parallelism, lock waiting, durability) is identical across all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Worker threads the engine may use internally per connection.
    /// `None` keeps the engine default.
    pub threads: Option<u32>,
    /// How long a connection waits on the engine write lock before failing.
    pub busy_timeout: Duration,
    /// Upper bound on simultaneously open connections, root included.
    pub max_connections: usize,
    /// Journal mode, applied once by the root (`"wal"`, `"delete"`, ...).
    pub journal_mode: String,
    /// Synchronous level applied to every connection.
    pub synchronous: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: None,
            busy_timeout: Duration::from_secs(30),
            max_connections: 64,
            journal_mode: "wal".to_owned(),
            synchronous: "NORMAL".to_owned(),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from named options, starting from the defaults.
    ///
    /// Recognised keys: `threads`, `busy_timeout_ms`, `max_connections`,
    /// `journal_mode`, `synchronous`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidOption`] for unknown keys or values
    /// that do not parse.
    pub fn from_options<I, K, V>(options: I) -> Result<Self, ConnectionError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        options
            .into_iter()
            .try_fold(Self::default(), |config, (key, value)| {
                config.with_option(key.as_ref(), value.as_ref())
            })
    }

    /// Apply a single named option.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidOption`] for unknown keys or values
    /// that do not parse.
    pub fn with_option(mut self, key: &str, value: &str) -> Result<Self, ConnectionError> {
        let invalid = |reason: &'static str| ConnectionError::InvalidOption {
            key: key.to_owned(),
            value: value.to_owned(),
            reason,
        };
        match key {
            "threads" => {
                let threads: u32 = value
                    .trim()
                    .parse()
                    .map_err(|_| invalid("expected a non-negative integer"))?;
                self.threads = Some(threads);
            }
            "busy_timeout_ms" => {
                let ms: u64 = value
                    .trim()
                    .parse()
                    .map_err(|_| invalid("expected milliseconds"))?;
                self.busy_timeout = Duration::from_millis(ms);
            }
            "max_connections" => {
                let limit: usize = value
                    .trim()
                    .parse()
                    .map_err(|_| invalid("expected a positive integer"))?;
                if limit == 0 {
                    return Err(invalid("must allow at least the root connection"));
                }
                self.max_connections = limit;
            }
            "journal_mode" => {
                let mode = value.trim().to_ascii_lowercase();
                if !JOURNAL_MODES.contains(&mode.as_str()) {
                    return Err(invalid("unknown journal mode"));
                }
                self.journal_mode = mode;
            }
            "synchronous" => {
                let level = value.trim().to_ascii_uppercase();
                if !SYNCHRONOUS_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
                    return Err(invalid("unknown synchronous level"));
                }
                self.synchronous = level;
            }
            _ => return Err(invalid("unrecognised option")),
        }
        Ok(self)
    }

    /// The PRAGMA statements this configuration amounts to, in application
    /// order. Used for logging and run reports.
    #[must_use]
    pub fn to_pragmas(&self) -> Vec<String> {
        let mut pragmas = vec![
            format!("PRAGMA busy_timeout={};", self.busy_timeout.as_millis()),
            format!("PRAGMA journal_mode={};", self.journal_mode),
            format!("PRAGMA synchronous={};", self.synchronous),
        ];
        if let Some(threads) = self.threads {
            pragmas.push(format!("PRAGMA threads={threads};"));
        }
        pragmas
    }
}
