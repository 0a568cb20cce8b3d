//! Guaranteed teardown of a build sandbox.
//!
//! A [`Reaper`] owns the cleanup of one build: stop the service bus, then
//! decompose the overlay. It runs at most once no matter how many paths
//! reach it. [`ReaperGuard`] ties it to scope exit and to SIGINT, SIGTERM
//! and SIGHUP, so an interrupted build is unwound exactly like a failed
//! one.

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::process;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::error::BuildResult;
use crate::sandbox::{Overlay, PackageManager};

pub struct Reaper {
    overlay: Arc<Overlay>,
    package_manager: Arc<dyn PackageManager>,
    reaped: Mutex<bool>,
}

impl Reaper {
    pub fn new(overlay: Arc<Overlay>, package_manager: Arc<dyn PackageManager>) -> Self {
        Self {
            overlay,
            package_manager,
            reaped: Mutex::new(false),
        }
    }

    /// Tear the sandbox down. Later calls return immediately, and a call made
    /// while another is in progress waits for it to finish.
    ///
    /// Failures are logged, never returned: the error that ended the build
    /// is the one the caller sees.
    pub fn reap(&self) {
        let mut reaped = self.reaped.lock().unwrap_or_else(|e| e.into_inner());
        if *reaped {
            return;
        }
        *reaped = true;

        info!("Reaping build sandbox");
        self.overlay.seal();
        if let Err(e) = self.package_manager.stop_service() {
            error!(error = %e, "Failed to stop system bus during cleanup");
        }
        if let Err(e) = self.overlay.decompose() {
            error!(error = %e, "Failed to decompose overlay during cleanup");
        }
    }
}

/// Runs a [`Reaper`] when dropped or when the process is interrupted.
pub struct ReaperGuard {
    reaper: Arc<Reaper>,
    signals: Handle,
    listener: Option<JoinHandle<()>>,
}

impl ReaperGuard {
    pub fn install(reaper: Arc<Reaper>) -> BuildResult<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let handle = signals.handle();
        let listener_reaper = Arc::clone(&reaper);
        let listener = thread::Builder::new()
            .name("sandbuild-reaper".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    warn!(signal, "Interrupted, tearing down sandbox");
                    listener_reaper.reap();
                    process::exit(128 + signal);
                }
            })?;

        debug!("Reaper installed");
        Ok(Self {
            reaper,
            signals: handle,
            listener: Some(listener),
        })
    }
}

impl Drop for ReaperGuard {
    fn drop(&mut self) {
        self.signals.close();
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
        self.reaper.reap();
    }
}
