// Copyright (C) Parity Technologies (UK) Ltd.
// This file is part of Taskmux.

// Taskmux is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Taskmux is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Taskmux.  If not, see <http://www.gnu.org/licenses/>.

//! Prometheus metrics of the dispatcher.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::{sync::Arc, time::Duration};

/// Dispatcher metrics. A default-constructed instance is a no-op; wire it up with
/// [`Metrics::try_register`].
#[derive(Default, Clone)]
pub struct Metrics(Option<Arc<MetricsInner>>);

struct MetricsInner {
	slow_task_benchmark: Duration,

	tasks_received: IntCounter,
	tasks_rejected: IntCounter,
	tasks_assigned: IntCounter,
	tasks_queued: IntCounter,
	tasks_discarded: IntCounter,
	tasks_lost: IntCounter,
	tasks_slow: IntCounter,

	queue_depth: IntGauge,
	workers_live: IntGauge,
	workers_staged: IntGauge,

	reloads_started: IntCounter,
	reloads_completed: IntCounter,
	reloads_aborted: IntCounter,

	task_execution_time: Histogram,
	task_queued_time: Histogram,
}

impl Metrics {
	/// Registers the dispatcher metrics with the given registry. Tasks taking longer than
	/// `slow_task_benchmark` are counted under `taskmux_proxy_tasks_slow_total`.
	pub fn try_register(
		registry: &Registry,
		slow_task_benchmark: Duration,
	) -> Result<Self, prometheus::Error> {
		let inner = MetricsInner {
			slow_task_benchmark,
			tasks_received: IntCounter::new(
				"taskmux_proxy_tasks_received_total",
				"Number of tasks accepted from the ingress layer.",
			)?,
			tasks_rejected: IntCounter::new(
				"taskmux_proxy_tasks_rejected_total",
				"Number of tasks dropped because their group is not configured.",
			)?,
			tasks_assigned: IntCounter::new(
				"taskmux_proxy_tasks_assigned_total",
				"Number of tasks pushed to a worker.",
			)?,
			tasks_queued: IntCounter::new(
				"taskmux_proxy_tasks_queued_total",
				"Number of tasks that had to wait in a group queue.",
			)?,
			tasks_discarded: IntCounter::new(
				"taskmux_proxy_tasks_discarded_total",
				"Number of tasks discarded because a generation swap was pending.",
			)?,
			tasks_lost: IntCounter::new(
				"taskmux_proxy_tasks_lost_total",
				"Number of tasks lost to a worker that died or disconnected.",
			)?,
			tasks_slow: IntCounter::new(
				"taskmux_proxy_tasks_slow_total",
				"Number of tasks whose handling exceeded the configured benchmark.",
			)?,
			queue_depth: IntGauge::new(
				"taskmux_proxy_queue_depth",
				"Tasks currently waiting across all group queues.",
			)?,
			workers_live: IntGauge::new(
				"taskmux_proxy_workers_live",
				"Worker channels currently attached.",
			)?,
			workers_staged: IntGauge::new(
				"taskmux_proxy_workers_staged",
				"Workers staged for the next generation.",
			)?,
			reloads_started: IntCounter::new(
				"taskmux_proxy_reloads_started_total",
				"Number of reloads started.",
			)?,
			reloads_completed: IntCounter::new(
				"taskmux_proxy_reloads_completed_total",
				"Number of generation swaps completed.",
			)?,
			reloads_aborted: IntCounter::new(
				"taskmux_proxy_reloads_aborted_total",
				"Number of reloads aborted by the operator.",
			)?,
			task_execution_time: Histogram::with_opts(
				HistogramOpts::new(
					"taskmux_proxy_task_execution_time",
					"Time workers spent per task, in seconds.",
				)
				.buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?),
			)?,
			task_queued_time: Histogram::with_opts(
				HistogramOpts::new(
					"taskmux_proxy_task_queued_time",
					"Time tasks waited before assignment, in seconds.",
				)
				.buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?),
			)?,
		};

		registry.register(Box::new(inner.tasks_received.clone()))?;
		registry.register(Box::new(inner.tasks_rejected.clone()))?;
		registry.register(Box::new(inner.tasks_assigned.clone()))?;
		registry.register(Box::new(inner.tasks_queued.clone()))?;
		registry.register(Box::new(inner.tasks_discarded.clone()))?;
		registry.register(Box::new(inner.tasks_lost.clone()))?;
		registry.register(Box::new(inner.tasks_slow.clone()))?;
		registry.register(Box::new(inner.queue_depth.clone()))?;
		registry.register(Box::new(inner.workers_live.clone()))?;
		registry.register(Box::new(inner.workers_staged.clone()))?;
		registry.register(Box::new(inner.reloads_started.clone()))?;
		registry.register(Box::new(inner.reloads_completed.clone()))?;
		registry.register(Box::new(inner.reloads_aborted.clone()))?;
		registry.register(Box::new(inner.task_execution_time.clone()))?;
		registry.register(Box::new(inner.task_queued_time.clone()))?;

		Ok(Self(Some(Arc::new(inner))))
	}

	pub(crate) fn on_task_received(&self) {
		if let Some(metrics) = &self.0 {
			metrics.tasks_received.inc();
		}
	}

	pub(crate) fn on_task_rejected(&self) {
		if let Some(metrics) = &self.0 {
			metrics.tasks_rejected.inc();
		}
	}

	pub(crate) fn on_task_queued(&self) {
		if let Some(metrics) = &self.0 {
			metrics.tasks_queued.inc();
			metrics.queue_depth.inc();
		}
	}

	pub(crate) fn on_task_dequeued(&self) {
		if let Some(metrics) = &self.0 {
			metrics.queue_depth.dec();
		}
	}

	pub(crate) fn on_task_assigned(&self, waited: Duration) {
		if let Some(metrics) = &self.0 {
			metrics.tasks_assigned.inc();
			metrics.task_queued_time.observe(waited.as_secs_f64());
		}
	}

	pub(crate) fn on_task_discarded(&self) {
		if let Some(metrics) = &self.0 {
			metrics.tasks_discarded.inc();
		}
	}

	pub(crate) fn on_task_lost(&self) {
		if let Some(metrics) = &self.0 {
			metrics.tasks_lost.inc();
		}
	}

	pub(crate) fn on_task_finished(&self, spent: Duration) {
		if let Some(metrics) = &self.0 {
			metrics.task_execution_time.observe(spent.as_secs_f64());
			if spent > metrics.slow_task_benchmark {
				metrics.tasks_slow.inc();
			}
		}
	}

	pub(crate) fn on_worker_attached(&self) {
		if let Some(metrics) = &self.0 {
			metrics.workers_live.inc();
		}
	}

	pub(crate) fn on_worker_removed(&self) {
		if let Some(metrics) = &self.0 {
			metrics.workers_live.dec();
		}
	}

	pub(crate) fn on_worker_staged(&self) {
		if let Some(metrics) = &self.0 {
			metrics.workers_staged.inc();
		}
	}

	pub(crate) fn on_worker_unstaged(&self) {
		if let Some(metrics) = &self.0 {
			metrics.workers_staged.dec();
		}
	}

	pub(crate) fn on_reload_started(&self) {
		if let Some(metrics) = &self.0 {
			metrics.reloads_started.inc();
			metrics.workers_staged.set(0);
		}
	}

	pub(crate) fn on_reload_completed(&self) {
		if let Some(metrics) = &self.0 {
			metrics.reloads_completed.inc();
			metrics.workers_staged.set(0);
		}
	}

	pub(crate) fn on_reload_aborted(&self) {
		if let Some(metrics) = &self.0 {
			metrics.reloads_aborted.inc();
			metrics.workers_staged.set(0);
		}
	}

	pub(crate) fn on_teardown(&self) {
		if let Some(metrics) = &self.0 {
			metrics.queue_depth.set(0);
		}
	}
}
