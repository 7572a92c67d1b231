//! Session identity, logging, and event profiling.
//!
//! Every campaign run owns one session: a `socm.session.<rand>` identifier
//! naming a directory under the working directory that collects logs and
//! profile traces. Components derive their uids from the session so log
//! lines and profile rows can be attributed.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// A logging and profiling namespace for one campaign run.
#[derive(Debug)]
pub struct Session {
    id: String,
    path: PathBuf,
    counters: Mutex<HashMap<String, u32>>,
}

impl Session {
    /// Create a session directory under the current working directory.
    pub fn create() -> io::Result<Self> {
        Self::create_in(&std::env::current_dir()?)
    }

    /// Create a session directory under `base`.
    pub fn create_in(base: &Path) -> io::Result<Self> {
        let id = format!("socm.session.{:08x}", rand::random::<u32>());
        let path = base.join(&id);
        fs::create_dir_all(&path)?;
        Ok(Self {
            id,
            path,
            counters: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mint a component uid such as `bookkeeper.0000`, counting per prefix.
    pub fn uid(&self, prefix: &str) -> String {
        let mut counters = self.counters.lock();
        let counter = counters.entry(prefix.to_string()).or_insert(0);
        let uid = format!("{prefix}.{counter:04}");
        *counter += 1;
        uid
    }

    /// Install the global tracing subscriber: human-readable output on
    /// stderr plus JSON lines in the session directory. Safe to call more
    /// than once; later calls are no-ops.
    pub fn init_tracing(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let log_path = self.path.join("socm.log");
        match File::create(&log_path) {
            Ok(file) => {
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
                    .try_init();
            }
            Err(err) => {
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .try_init();
                tracing::warn!(path = %log_path.display(), %err, "could not open session log file");
            }
        }
    }
}

/// Append-only event profiler, one file per component uid.
///
/// Rows are `timestamp_utc,event,uid`. Write failures are swallowed after
/// a single warning; profiling never interferes with execution.
#[derive(Debug)]
pub struct Profiler {
    uid: String,
    file: Mutex<Option<File>>,
}

impl Profiler {
    pub fn new(session: &Session, uid: &str) -> Self {
        let path = session.path().join(format!("{uid}.prof"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                tracing::warn!(path = %path.display(), %err, "profiler disabled");
                err
            })
            .ok();
        Self {
            uid: uid.to_string(),
            file: Mutex::new(file),
        }
    }

    /// Record a timestamped event.
    pub fn prof(&self, event: &str) {
        let mut guard = self.file.lock();
        if let Some(file) = guard.as_mut() {
            let row = format!("{},{},{}\n", Utc::now().to_rfc3339(), event, self.uid);
            if file.write_all(row.as_bytes()).is_err() {
                *guard = None;
            }
        }
    }
}
