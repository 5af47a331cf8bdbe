//! Operator interrupts.
//!
//! Signals escalate. The first SIGINT / SIGTERM / SIGHUP interrupts the
//! oldest genome pass still in flight: that pass cleans up its own directory
//! while sibling passes and the dispatcher carry on. The second stops the
//! run, so no new genome starts and every in-flight one cleans up. The third
//! force-exits.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct InFlight {
    next_id: u64,
    /// Registration order -> (entity, token).
    jobs: BTreeMap<u64, (String, CancellationToken)>,
}

/// Run-wide stop token plus one cancellation token per running pass.
#[derive(Debug, Clone, Default)]
pub struct Interrupts {
    stop: CancellationToken,
    in_flight: Arc<Mutex<InFlight>>,
}

impl Interrupts {
    pub fn new() -> Self {
        Self::default()
    }

    fn in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop the whole run.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Track a pass for `entity`. Its token is a child of the run-wide stop
    /// token, so a stop reaches it too. Dropping the handle unregisters it.
    pub fn register(&self, entity: &str) -> JobHandle {
        let token = self.stop.child_token();
        let mut in_flight = self.in_flight();
        let id = in_flight.next_id;
        in_flight.next_id += 1;
        in_flight.jobs.insert(id, (entity.to_string(), token.clone()));
        JobHandle {
            id,
            token,
            interrupts: self.clone(),
        }
    }

    /// Cancel the longest-running pass. Returns its entity, if any.
    pub fn interrupt_oldest(&self) -> Option<String> {
        let entity = self.in_flight().jobs.values().next().map(|(e, _)| e.clone())?;
        self.interrupt(&entity).then_some(entity)
    }

    /// Cancel the running pass for `entity`. Returns false if none is running.
    pub fn interrupt(&self, entity: &str) -> bool {
        let mut in_flight = self.in_flight();
        let id = in_flight
            .jobs
            .iter()
            .find(|(_, (e, _))| e == entity)
            .map(|(id, _)| *id);
        match id.and_then(|id| in_flight.jobs.remove(&id)) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running(&self) -> usize {
        self.in_flight().jobs.len()
    }
}

/// Registration of one running pass.
#[derive(Debug)]
pub struct JobHandle {
    id: u64,
    token: CancellationToken,
    interrupts: Interrupts,
}

impl JobHandle {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.interrupts.in_flight().jobs.remove(&self.id);
    }
}

/// What a signal does, given how many arrived before it.
fn on_signal(interrupts: &Interrupts, prev: u32) {
    match prev {
        0 => match interrupts.interrupt_oldest() {
            Some(entity) => {
                tracing::info!(
                    entity = %entity,
                    still_running = interrupts.running(),
                    "Interrupted genome, other genomes continue"
                );
                tracing::info!("Press Ctrl+C again to stop the run");
            }
            None => tracing::info!("No genome in flight; press Ctrl+C again to stop the run"),
        },
        1 => {
            tracing::info!("Stopping run, finishing in-flight genomes...");
            tracing::info!("Press Ctrl+C again to force exit");
            interrupts.stop();
        }
        _ => {
            tracing::warn!("Force exit requested");
            std::process::exit(130);
        }
    }
}

/// Install signal handlers feeding a fresh [`Interrupts`].
pub(crate) fn install_signal_handler() -> anyhow::Result<Interrupts> {
    let interrupts = Interrupts::new();
    let count = Arc::new(AtomicU32::new(0));

    #[cfg(unix)]
    let (mut sigterm, mut sighup) = {
        use tokio::signal::unix::{signal, SignalKind};
        (
            signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?,
            signal(SignalKind::hangup()).context("failed to register SIGHUP handler")?,
        )
    };

    let handler = interrupts.clone();
    tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                    _ = sighup.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
            }

            on_signal(&handler, count.fetch_add(1, Ordering::SeqCst));
        }
    });

    Ok(interrupts)
}
