//! Parallelism governor.
//!
//! A started cluster costs roughly two cores, so running one test per core
//! starves the clusters under test. The governor picks the worker count once
//! at startup and hands out permits from a counting semaphore; every
//! top-level test holds one while it runs.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Why the governor settled on its worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The user asked for a specific value.
    Respected { requested: usize },
    /// Too few cores to divide further.
    Unchanged { cores: usize },
    /// Capped at `floor(cores / 1.75)`.
    Limited { cores: usize, limit: usize },
}

impl Decision {
    pub fn workers(self) -> usize {
        match self {
            Decision::Respected { requested } => requested,
            Decision::Unchanged { cores } => cores,
            Decision::Limited { limit, .. } => limit,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Respected { requested } => write!(
                f,
                "--parallel={requested} was set explicitly, not overriding"
            ),
            Decision::Unchanged { cores } => write!(
                f,
                "Found {cores} cores, will not round down core count."
            ),
            Decision::Limited { cores, limit } => write!(
                f,
                "Found {cores} cores, limiting parallelism with --parallel={limit}"
            ),
        }
    }
}

/// Decide the worker count.
///
/// `requested` is the user's explicit setting, if any. A request equal to
/// the core count is the runtime default and is treated as no request.
pub fn decide(requested: Option<usize>, cores: usize) -> Decision {
    let cores = cores.max(1);
    if let Some(requested) = requested
        && requested != cores
    {
        return Decision::Respected {
            requested: requested.max(1),
        };
    }
    if cores <= 2 {
        return Decision::Unchanged { cores };
    }
    // floor(cores / 1.75) in integer arithmetic
    Decision::Limited {
        cores,
        limit: cores * 4 / 7,
    }
}

/// Core count of this host.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Worker-count limiter shared by all top-level tests.
#[derive(Debug, Clone)]
pub struct Governor {
    decision: Decision,
    permits: Arc<Semaphore>,
}

impl Governor {
    /// Decide the worker count and report it on stderr.
    pub fn install(requested: Option<usize>) -> Self {
        let governor = Self::with_decision(decide(requested, available_cores()));
        eprintln!("{}", governor.decision);
        governor
    }

    pub fn with_decision(decision: Decision) -> Self {
        Self {
            decision,
            permits: Arc::new(Semaphore::new(decision.workers())),
        }
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn workers(&self) -> usize {
        self.decision.workers()
    }

    /// Wait for a free worker slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        // The semaphore is never closed.
        match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("governor semaphore closed"),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
