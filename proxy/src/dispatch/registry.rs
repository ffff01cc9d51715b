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

//! Registry of live worker handles.
//!
//! Worker records are owned here; the connection layer only ever holds the stable [`Worker`]
//! token handed out on attach. All status writes go through the dispatcher, so outside a
//! transition a worker is in at most one of the per-group idle/busy sets and its status field
//! mirrors that membership. Workers with status [`WorkerStatus::Unknown`] (attached but not
//! yet ready, staged for the next generation, or retired) are in neither set.

use super::TaskItem;
use crate::config::GroupConfig;
use futures::channel::mpsc;
use slotmap::HopSlotMap;
use std::{
	collections::{HashMap, HashSet},
	time::{Duration, Instant},
};
use taskmux_common::GroupId;

slotmap::new_key_type! {
	/// Stable token for one worker process, valid from channel attach to disconnect.
	pub struct Worker;
}

/// Sending half of a worker's task channel. Pushes are best-effort at-most-once: the
/// receiving half is drained by the worker's connection, and a disconnect simply closes it.
pub type WorkerOutbox = mpsc::UnboundedSender<TaskItem>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
	/// Attached but not dispatchable: pre-handshake, staged for the next generation, or
	/// retired and awaiting disconnect.
	Unknown,
	Idle,
	Busy,
}

/// Cohort a worker was forked into. `Next` workers are withheld from dispatch until the swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Generation {
	Current,
	Next,
}

pub(crate) struct WorkerData {
	group: GroupId,
	status: WorkerStatus,
	generation: Generation,
	outbox: WorkerOutbox,
	busy_since: Option<Instant>,
}

impl WorkerData {
	pub(crate) fn group(&self) -> GroupId {
		self.group
	}

	pub(crate) fn status(&self) -> WorkerStatus {
		self.status
	}
}

pub(crate) struct Workers {
	running: HopSlotMap<Worker, WorkerData>,
	idle: HashMap<GroupId, HashSet<Worker>>,
	busy: HashMap<GroupId, HashSet<Worker>>,
}

impl Workers {
	pub(crate) fn new(config: &GroupConfig) -> Self {
		Self {
			running: HopSlotMap::with_capacity_and_key(16),
			idle: config.groups().map(|group| (group, HashSet::new())).collect(),
			busy: config.groups().map(|group| (group, HashSet::new())).collect(),
		}
	}

	/// Registers a newly connected worker. It stays [`WorkerStatus::Unknown`] until the
	/// dispatcher admits it.
	pub(crate) fn attach(&mut self, group: GroupId, outbox: WorkerOutbox) -> Worker {
		self.running.insert(WorkerData {
			group,
			status: WorkerStatus::Unknown,
			generation: Generation::Current,
			outbox,
			busy_since: None,
		})
	}

	pub(crate) fn group_of(&self, worker: Worker) -> Option<GroupId> {
		self.running.get(worker).map(|data| data.group)
	}

	pub(crate) fn status_of(&self, worker: Worker) -> Option<WorkerStatus> {
		self.running.get(worker).map(|data| data.status)
	}

	#[cfg(test)]
	pub(crate) fn generation_of(&self, worker: Worker) -> Option<Generation> {
		self.running.get(worker).map(|data| data.generation)
	}

	pub(crate) fn set_generation(&mut self, worker: Worker, generation: Generation) {
		if let Some(data) = self.running.get_mut(worker) {
			data.generation = generation;
		}
	}

	/// Marks a worker as staged for the next generation: considered idle, but kept out of
	/// the dispatchable sets until the swap.
	pub(crate) fn mark_staged(&mut self, worker: Worker) {
		if let Some(data) = self.running.get_mut(worker) {
			data.status = WorkerStatus::Idle;
			data.generation = Generation::Next;
			data.busy_since = None;
		}
	}

	/// Resets a worker to [`WorkerStatus::Unknown`], dropping it from whichever set holds
	/// it. Used for workers discarded by an aborted reload.
	pub(crate) fn mark_unknown(&mut self, worker: Worker) {
		let Some(data) = self.running.get_mut(worker) else { return };
		let (group, prev) = (data.group, data.status);
		data.status = WorkerStatus::Unknown;
		data.busy_since = None;
		self.remove_from_set(prev, group, worker);
	}

	/// Admit-idle transition: the worker must not be in any set yet.
	pub(crate) fn admit_idle(&mut self, worker: Worker) {
		let Some(data) = self.running.get_mut(worker) else { return };
		let group = data.group;
		debug_assert!(
			!self.idle.get(&group).is_some_and(|set| set.contains(&worker)) &&
				!self.busy.get(&group).is_some_and(|set| set.contains(&worker)),
			"admit-idle of an already admitted worker",
		);
		data.status = WorkerStatus::Idle;
		data.busy_since = None;
		self.insert_into_set(WorkerStatus::Idle, group, worker);
	}

	/// The general status transition: moves the worker from the set implied by its previous
	/// status to the one implied by `dst`, tolerating absence from the source set.
	pub(crate) fn sync_status(&mut self, worker: Worker, dst: WorkerStatus) {
		let Some(data) = self.running.get_mut(worker) else { return };
		let (group, prev) = (data.group, data.status);
		if prev == dst {
			return
		}
		data.status = dst;
		if dst != WorkerStatus::Busy {
			data.busy_since = None;
		}
		self.remove_from_set(prev, group, worker);
		self.insert_into_set(dst, group, worker);
	}

	/// Any idle worker of the group. Which one is unspecified.
	pub(crate) fn any_idle(&self, group: GroupId) -> Option<Worker> {
		self.idle.get(&group).and_then(|set| set.iter().next().copied())
	}

	/// Whether any group still has a busy worker.
	pub(crate) fn has_busy(&self) -> bool {
		self.busy.values().any(|set| !set.is_empty())
	}

	/// Pushes a task into the worker's outbox. Returns false when the connection is already
	/// gone; the item is lost in that case and the disconnect will remove the worker.
	pub(crate) fn assign_task(&mut self, worker: Worker, item: TaskItem) -> bool {
		let Some(data) = self.running.get_mut(worker) else { return false };
		match data.outbox.unbounded_send(item) {
			Ok(()) => {
				data.busy_since = Some(Instant::now());
				true
			},
			Err(_) => false,
		}
	}

	/// Time the worker spent on its current task, measured from the last assignment.
	/// Consumes the mark.
	pub(crate) fn take_busy_span(&mut self, worker: Worker) -> Option<Duration> {
		self.running
			.get_mut(worker)
			.and_then(|data| data.busy_since.take())
			.map(|since| since.elapsed())
	}

	/// Removes the worker from whichever set holds it and destroys the record. `None` when
	/// the token is not (or no longer) known.
	pub(crate) fn remove(&mut self, worker: Worker) -> Option<WorkerData> {
		let data = self.running.remove(worker)?;
		self.remove_from_set(data.status, data.group, worker);
		Some(data)
	}

	/// Retires the outgoing generation at swap time: every idle worker leaves its set and
	/// reverts to [`WorkerStatus::Unknown`] until the master disconnects it.
	pub(crate) fn retire_idle(&mut self) -> usize {
		let mut retired = 0;
		for set in self.idle.values_mut() {
			for worker in set.drain() {
				if let Some(data) = self.running.get_mut(worker) {
					data.status = WorkerStatus::Unknown;
					data.busy_since = None;
				}
				retired += 1;
			}
		}
		retired
	}

	pub(crate) fn live(&self) -> usize {
		self.running.len()
	}

	pub(crate) fn idle_len(&self, group: GroupId) -> usize {
		self.idle.get(&group).map_or(0, |set| set.len())
	}

	pub(crate) fn busy_len(&self, group: GroupId) -> usize {
		self.busy.get(&group).map_or(0, |set| set.len())
	}

	#[cfg(test)]
	pub(crate) fn in_idle(&self, group: GroupId, worker: Worker) -> bool {
		self.idle.get(&group).is_some_and(|set| set.contains(&worker))
	}

	#[cfg(test)]
	pub(crate) fn in_busy(&self, group: GroupId, worker: Worker) -> bool {
		self.busy.get(&group).is_some_and(|set| set.contains(&worker))
	}

	#[cfg(test)]
	pub(crate) fn iter(&self) -> impl Iterator<Item = (Worker, &WorkerData)> {
		self.running.iter()
	}

	pub(crate) fn clear(&mut self) {
		self.running.clear();
		for set in self.idle.values_mut() {
			set.clear();
		}
		for set in self.busy.values_mut() {
			set.clear();
		}
	}

	fn insert_into_set(&mut self, status: WorkerStatus, group: GroupId, worker: Worker) {
		let sets = match status {
			WorkerStatus::Idle => &mut self.idle,
			WorkerStatus::Busy => &mut self.busy,
			WorkerStatus::Unknown => return,
		};
		match sets.get_mut(&group) {
			Some(set) => {
				set.insert(worker);
			},
			None => debug_assert!(false, "worker attached to unconfigured group {group}"),
		}
	}

	fn remove_from_set(&mut self, status: WorkerStatus, group: GroupId, worker: Worker) {
		let sets = match status {
			WorkerStatus::Idle => &mut self.idle,
			WorkerStatus::Busy => &mut self.busy,
			WorkerStatus::Unknown => return,
		};
		if let Some(set) = sets.get_mut(&group) {
			set.remove(&worker);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;
	use std::collections::BTreeMap;
	use taskmux_common::IngressId;

	fn config() -> GroupConfig {
		let expected: BTreeMap<_, _> = [(GroupId(1), 1)].into_iter().collect();
		GroupConfig::new(expected).unwrap()
	}

	fn attach(workers: &mut Workers) -> (Worker, mpsc::UnboundedReceiver<TaskItem>) {
		let (outbox, rx) = mpsc::unbounded();
		(workers.attach(GroupId(1), outbox), rx)
	}

	#[test]
	fn status_mirrors_set_membership() {
		let mut workers = Workers::new(&config());
		let (worker, _rx) = attach(&mut workers);

		assert_eq!(workers.status_of(worker), Some(WorkerStatus::Unknown));
		assert!(!workers.in_idle(GroupId(1), worker));

		workers.admit_idle(worker);
		assert_eq!(workers.status_of(worker), Some(WorkerStatus::Idle));
		assert!(workers.in_idle(GroupId(1), worker));

		workers.sync_status(worker, WorkerStatus::Busy);
		assert!(!workers.in_idle(GroupId(1), worker));
		assert!(workers.in_busy(GroupId(1), worker));
		assert!(workers.has_busy());

		workers.sync_status(worker, WorkerStatus::Idle);
		assert!(workers.in_idle(GroupId(1), worker));
		assert!(!workers.has_busy());
	}

	#[test]
	fn remove_is_a_noop_for_unknown_tokens() {
		let mut workers = Workers::new(&config());
		let (worker, _rx) = attach(&mut workers);
		assert!(workers.remove(worker).is_some());
		assert!(workers.remove(worker).is_none());
		assert_eq!(workers.live(), 0);
	}

	#[test]
	fn assignment_fails_once_the_outbox_is_closed() {
		let mut workers = Workers::new(&config());
		let (worker, rx) = attach(&mut workers);
		workers.admit_idle(worker);

		assert!(workers.assign_task(worker, TaskItem::new(IngressId(1), Bytes::new())));
		drop(rx);
		assert!(!workers.assign_task(worker, TaskItem::new(IngressId(2), Bytes::new())));
	}

	#[test]
	fn retire_idle_empties_the_sets() {
		let mut workers = Workers::new(&config());
		let (a, _rx_a) = attach(&mut workers);
		let (b, _rx_b) = attach(&mut workers);
		workers.admit_idle(a);
		workers.admit_idle(b);

		assert_eq!(workers.retire_idle(), 2);
		assert_eq!(workers.idle_len(GroupId(1)), 0);
		assert_eq!(workers.status_of(a), Some(WorkerStatus::Unknown));
		assert_eq!(workers.status_of(b), Some(WorkerStatus::Unknown));
		// records survive until the disconnect removes them
		assert_eq!(workers.live(), 2);
	}
}
