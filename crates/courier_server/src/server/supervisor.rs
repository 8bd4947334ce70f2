#![forbid(unsafe_code)]

//! Bounded worker pool for side effects that must not block routing
//! (history writes today). Every failure is reported on a channel instead of
//! disappearing inside a detached task.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::config::SideEffectSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideEffectConfig {
	pub workers: usize,
	pub queue_capacity: usize,
}

impl Default for SideEffectConfig {
	fn default() -> Self {
		Self {
			workers: 4,
			queue_capacity: 1024,
		}
	}
}

impl From<&SideEffectSettings> for SideEffectConfig {
	fn from(s: &SideEffectSettings) -> Self {
		Self {
			workers: s.workers,
			queue_capacity: s.queue_capacity,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffectFailure {
	/// Never ran: the queue was full or the pool is gone.
	Rejected { label: &'static str, reason: &'static str },
	/// Ran and returned an error (or panicked).
	Failed { label: &'static str, error: String },
}

impl SideEffectFailure {
	pub fn label(&self) -> &'static str {
		match self {
			SideEffectFailure::Rejected { label, .. } | SideEffectFailure::Failed { label, .. } => label,
		}
	}
}

struct Job {
	label: &'static str,
	fut: BoxFuture<'static, anyhow::Result<()>>,
}

#[derive(Clone)]
pub struct SideEffectSupervisor {
	jobs: mpsc::Sender<Job>,
	failures: mpsc::Sender<SideEffectFailure>,
}

impl std::fmt::Debug for SideEffectSupervisor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SideEffectSupervisor")
			.field("queue_free", &self.jobs.capacity())
			.finish()
	}
}

impl SideEffectSupervisor {
	/// Spawns `cfg.workers` workers on the current runtime.
	pub fn new(cfg: SideEffectConfig) -> (Self, mpsc::Receiver<SideEffectFailure>) {
		let capacity = cfg.queue_capacity.max(1);
		let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(capacity);
		let (failures_tx, failures_rx) = mpsc::channel(capacity);

		let jobs_rx = Arc::new(Mutex::new(jobs_rx));
		for worker in 0..cfg.workers.max(1) {
			tokio::spawn(run_worker(worker, jobs_rx.clone(), failures_tx.clone()));
		}

		(
			Self {
				jobs: jobs_tx,
				failures: failures_tx,
			},
			failures_rx,
		)
	}

	/// Queue `fut` without waiting. Returns `false` if it was rejected.
	pub fn submit<F>(&self, label: &'static str, fut: F) -> bool
	where
		F: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		let job = Job {
			label,
			fut: fut.boxed(),
		};

		match self.jobs.try_send(job) {
			Ok(()) => true,
			Err(err) => {
				let reason = match err {
					mpsc::error::TrySendError::Full(_) => "queue full",
					mpsc::error::TrySendError::Closed(_) => "closed",
				};
				warn!(label, reason, "side effect rejected");
				metrics::counter!("courier_server_side_effect_rejected_total").increment(1);
				report(&self.failures, SideEffectFailure::Rejected { label, reason });
				false
			}
		}
	}
}

async fn run_worker(
	worker: usize,
	jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
	failures: mpsc::Sender<SideEffectFailure>,
) {
	loop {
		let next = jobs.lock().await.recv().await;
		let Some(job) = next else {
			debug!(worker, "side effect worker stopped");
			return;
		};

		let error = match AssertUnwindSafe(job.fut).catch_unwind().await {
			Ok(Ok(())) => continue,
			Ok(Err(err)) => format!("{err:#}"),
			Err(_) => "side effect panicked".to_string(),
		};

		warn!(worker, label = job.label, error = %error, "side effect failed");
		metrics::counter!("courier_server_side_effect_failures_total").increment(1);
		report(&failures, SideEffectFailure::Failed {
			label: job.label,
			error,
		});
	}
}

fn report(failures: &mpsc::Sender<SideEffectFailure>, failure: SideEffectFailure) {
	if failures.try_send(failure).is_err() {
		debug!("side effect failure channel full or closed");
	}
}
