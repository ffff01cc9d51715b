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

//! The task dispatcher: per-group scheduling, backpressure queueing and the generation swap.
//!
//! [`TaskDispatcher`] is a plain synchronous state machine; nothing in here suspends. It is
//! normally driven by the channel front-end in [`crate::start`], which serialises all
//! operations on one channel, but can just as well sit behind a mutex for embedders that
//! prefer it. Either way its methods must not be reentered.
//!
//! The dispatcher never returns errors to its callers: every failure is either absorbed as a
//! state-machine no-op or logged. What the outside observes is only upstream request
//! timeouts.

mod queue;
mod registry;
mod reload;


use crate::{config::GroupConfig, metrics::Metrics, LOG_TARGET};
use bytes::Bytes;
use futures::channel::mpsc;
use queue::GroupQueue;
use registry::Generation;
use reload::ReloadHelper;
use serde::Serialize;
use std::{collections::HashSet, time::Instant};
use taskmux_common::{GroupId, IngressId, WorkerHello};
use tracing::{debug, info, warn};

pub use registry::{Worker, WorkerOutbox, WorkerStatus};
use registry::Workers;

/// One request in flight through the dispatcher: the serialised payload and the ingress
/// token the eventual reply is routed back with. The dispatcher never looks inside the
/// payload.
#[derive(Debug, Clone)]
pub struct TaskItem {
	pub ingress: IngressId,
	pub payload: Bytes,
	pub(crate) waiting_since: Instant,
}

impl TaskItem {
	pub fn new(ingress: IngressId, payload: Bytes) -> Self {
		Self { ingress, payload, waiting_since: Instant::now() }
	}
}

/// Events the dispatcher reports to the proxy glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
	/// The worker generations were swapped; the master should retire the outgoing one.
	ReloadOver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
	#[error("group {0} is not configured")]
	UnknownGroup(GroupId),
	#[error("dispatcher terminated")]
	DispatcherGone,
}

/// Admin-facing snapshot of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
	pub group: GroupId,
	pub expected: usize,
	pub idle: usize,
	pub busy: usize,
	pub staged: usize,
	pub queued: usize,
}

/// Admin-facing snapshot of the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
	pub reloading: bool,
	pub queued_total: usize,
	pub workers_live: usize,
	pub groups: Vec<GroupStatus>,
}

/// Top-level dispatch policy: on task arrival choose worker-or-enqueue, on worker readiness
/// choose task-or-idle, and drive the reload handoff.
pub struct TaskDispatcher {
	config: GroupConfig,
	workers: Workers,
	group_queue: GroupQueue,
	reload_helper: ReloadHelper,
	events: mpsc::UnboundedSender<Event>,
	metrics: Metrics,
	unknown_groups_seen: HashSet<GroupId>,
}

impl TaskDispatcher {
	pub fn new(config: GroupConfig, events: mpsc::UnboundedSender<Event>, metrics: Metrics) -> Self {
		Self {
			workers: Workers::new(&config),
			group_queue: GroupQueue::new(&config),
			reload_helper: ReloadHelper::new(&config),
			config,
			events,
			metrics,
			unknown_groups_seen: HashSet::new(),
		}
	}

	/// Registers a newly connected worker channel from its handshake announcement. The
	/// worker is not dispatchable until it announces readiness via
	/// [`Self::add_ready_worker`].
	pub fn attach_worker(
		&mut self,
		hello: WorkerHello,
		outbox: WorkerOutbox,
	) -> Result<Worker, AttachError> {
		let group = hello.group;
		if !self.config.contains(group) {
			return Err(AttachError::UnknownGroup(group))
		}
		let worker = self.workers.attach(group, outbox);
		self.metrics.on_worker_attached();
		debug!(target: LOG_TARGET, ?worker, %group, "worker channel attached");
		Ok(worker)
	}

	/// A client request arrived for `group`: hand it to any idle worker, or queue it.
	pub fn add_task(&mut self, group: GroupId, item: TaskItem) {
		if !self.config.contains(group) {
			if self.unknown_groups_seen.insert(group) {
				warn!(target: LOG_TARGET, %group, "task for an unconfigured group, dropping");
			}
			self.metrics.on_task_rejected();
			return
		}
		self.metrics.on_task_received();

		if self.reload_helper.workers_done() {
			// The swap is due; the outgoing generation takes no more work and the incoming
			// one is not live yet.
			debug!(target: LOG_TARGET, %group, "swap pending, incoming task discarded");
			self.metrics.on_task_discarded();
			self.try_replace_workers();
			return
		}

		match self.workers.any_idle(group) {
			Some(worker) => {
				self.workers.sync_status(worker, WorkerStatus::Busy);
				self.deliver(worker, item);
			},
			None => {
				self.group_queue.put(group, item);
				self.metrics.on_task_queued();
			},
		}
	}

	/// A worker finished a task (or just came up) and asks for the next one. Returns the
	/// next queued task of its group, or `None`, flipping the worker to idle.
	///
	/// The caller is responsible for pushing a returned item to the worker via
	/// [`Self::deliver`].
	pub fn alloc_task(&mut self, worker: Worker) -> Option<TaskItem> {
		let Some(group) = self.workers.group_of(worker) else {
			debug!(target: LOG_TARGET, ?worker, "task allocation for an unknown worker");
			return None
		};
		if let Some(spent) = self.workers.take_busy_span(worker) {
			self.metrics.on_task_finished(spent);
		}
		if self.reload_helper.is_staged(worker) {
			// Withheld until the swap.
			debug!(target: LOG_TARGET, ?worker, "staged worker asked for a task");
			return None
		}

		if self.reload_helper.workers_done() {
			// Park the worker so the outgoing generation drains.
			self.workers.sync_status(worker, WorkerStatus::Idle);
			self.try_replace_workers();
			return None
		}

		let task = self.group_queue.get(group);
		let dst = if task.is_some() { WorkerStatus::Busy } else { WorkerStatus::Idle };
		if self.workers.status_of(worker) != Some(dst) {
			self.workers.sync_status(worker, dst);
		}
		if task.is_some() {
			self.metrics.on_task_dequeued();
		}
		task
	}

	/// Pushes a task into the worker's outbox. On a dead connection the item is lost; the
	/// disconnect that follows removes the worker.
	pub fn deliver(&mut self, worker: Worker, item: TaskItem) {
		let waited = item.waiting_since.elapsed();
		if self.workers.assign_task(worker, item) {
			self.metrics.on_task_assigned(waited);
		} else {
			warn!(target: LOG_TARGET, ?worker, "task push to a dead worker connection, item lost");
			self.metrics.on_task_lost();
		}
	}

	/// A worker completed its handshake and announced readiness.
	///
	/// During a reload the worker is staged for the next generation; otherwise it joins the
	/// live generation directly and immediately starts on the group's backlog, if any.
	pub fn add_ready_worker(&mut self, worker: Worker) {
		let Some(group) = self.workers.group_of(worker) else {
			debug!(target: LOG_TARGET, ?worker, "readiness from an unknown worker");
			return
		};
		match self.workers.status_of(worker) {
			Some(WorkerStatus::Unknown) => {},
			other => {
				debug!(target: LOG_TARGET, ?worker, ?other, "readiness announced twice, ignoring");
				return
			},
		}

		if self.reload_helper.running() {
			self.workers.mark_staged(worker);
			self.reload_helper.add_worker(worker, group, &self.config);
			self.metrics.on_worker_staged();
			debug!(
				target: LOG_TARGET,
				?worker,
				%group,
				staged = self.reload_helper.staged_len(group),
				"worker staged for the next generation"
			);
			if self.reload_helper.workers_done() {
				// The old generation may already be fully idle.
				self.try_replace_workers();
			}
		} else {
			self.workers.admit_idle(worker);
			debug!(target: LOG_TARGET, ?worker, %group, "worker admitted idle");
			if let Some(item) = self.alloc_task(worker) {
				self.deliver(worker, item);
			}
		}
	}

	/// Worker channel disconnected. A task the worker was busy with is lost; recovery is the
	/// client's request-reply timeout upstream.
	pub fn remove_worker(&mut self, worker: Worker) {
		if self.reload_helper.remove_worker(worker, &self.config) {
			debug!(target: LOG_TARGET, ?worker, "staged worker disconnected before the swap");
			self.metrics.on_worker_unstaged();
		}
		let Some(data) = self.workers.remove(worker) else { return };
		self.metrics.on_worker_removed();
		if data.status() == WorkerStatus::Busy {
			warn!(
				target: LOG_TARGET,
				?worker,
				group = %data.group(),
				"worker disconnected while processing a task, the task is lost"
			);
			self.metrics.on_task_lost();
		} else {
			debug!(target: LOG_TARGET, ?worker, group = %data.group(), "worker disconnected");
		}
	}

	/// Begins a reload. Idempotent: a second signal discards the staging set collected so
	/// far and starts over.
	pub fn start_reload(&mut self) {
		if self.reload_helper.running() {
			let discarded = self.reload_helper.stop();
			debug!(
				target: LOG_TARGET,
				discarded = discarded.len(),
				"reload already running, restarting collection"
			);
			for worker in discarded {
				self.workers.mark_unknown(worker);
			}
		}
		self.reload_helper.start();
		self.metrics.on_reload_started();
		info!(target: LOG_TARGET, "reload started, collecting the next worker generation");
	}

	/// Aborts a reload; the staging set is discarded and the old generation keeps serving.
	pub fn stop_reload(&mut self) {
		if !self.reload_helper.running() {
			return
		}
		let discarded = self.reload_helper.stop();
		for worker in &discarded {
			self.workers.mark_unknown(*worker);
		}
		self.metrics.on_reload_aborted();
		info!(
			target: LOG_TARGET,
			discarded = discarded.len(),
			"reload aborted, staging set discarded"
		);
	}

	pub fn reloading(&self) -> bool {
		self.reload_helper.running()
	}

	pub fn status_report(&self) -> StatusReport {
		let groups = self
			.config
			.groups()
			.map(|group| GroupStatus {
				group,
				expected: self.config.expected_count(group),
				idle: self.workers.idle_len(group),
				busy: self.workers.busy_len(group),
				staged: self.reload_helper.staged_len(group),
				queued: self.group_queue.len(group),
			})
			.collect();
		StatusReport {
			reloading: self.reload_helper.running(),
			queued_total: self.group_queue.len_total(),
			workers_live: self.workers.live(),
			groups,
		}
	}

	/// The swap: installs the staged generation as the live idle sets, retires the outgoing
	/// one and drains the queued backlog into the fresh workers. Returns false, leaving all
	/// state untouched, while the next generation is incomplete or the old one has not
	/// drained to idle yet.
	fn try_replace_workers(&mut self) -> bool {
		if !self.reload_helper.workers_done() {
			return false
		}
		if self.workers.has_busy() {
			debug!(target: LOG_TARGET, "next generation ready, waiting for the old one to drain");
			return false
		}

		// The staged handles are moved, not aliased: from here on they belong to the live
		// registry.
		let staged = self.reload_helper.take_staged();
		let retired = self.workers.retire_idle();
		let installed = staged.values().map(|set| set.len()).sum::<usize>();
		for set in staged.values() {
			for &worker in set {
				self.workers.set_generation(worker, Generation::Current);
				self.workers.admit_idle(worker);
			}
		}
		debug!(target: LOG_TARGET, retired, installed, "worker generations swapped");

		// Drain the backlog that built up while the reload was collecting. The first worker
		// of a group that gets nothing means the group's queue is empty and the rest of that
		// group stays idle.
		for (_, set) in staged {
			for worker in set {
				match self.alloc_task(worker) {
					Some(item) => self.deliver(worker, item),
					None => break,
				}
			}
		}

		self.metrics.on_reload_completed();
		info!(target: LOG_TARGET, "worker pool reloaded");
		if self.events.unbounded_send(Event::ReloadOver).is_err() {
			// The swap is committed regardless; the glue just never hears about it.
			warn!(target: LOG_TARGET, "reload-over event dropped, receiver gone");
		}
		true
	}

	/// Drops all queued tasks and worker records. Called when the event loop winds down;
	/// the connection layer cleans up the worker processes themselves.
	pub(crate) fn teardown(&mut self) {
		let dropped = self.group_queue.len_total();
		if dropped > 0 {
			warn!(target: LOG_TARGET, dropped, "dispatcher torn down with tasks still queued");
		}
		self.group_queue.clear();
		self.reload_helper.stop();
		self.workers.clear();
		self.metrics.on_teardown();
	}
}
