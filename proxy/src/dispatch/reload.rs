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

//! Bookkeeping for the worker generation under construction during a reload.
//!
//! While a reload is in flight, freshly forked workers accumulate in the staging set and are
//! withheld from dispatch. `workers_done` flips to true once every configured group holds at
//! least its expected worker count. Whether the *old* generation has drained is deliberately
//! not tracked here: the swap decision reads that from the registry, and keeping the two
//! facts apart avoids racing a late task completion against staging progress.

use super::Worker;
use crate::config::GroupConfig;
use std::collections::{HashMap, HashSet};
use taskmux_common::GroupId;

pub(crate) struct ReloadHelper {
	next_idle: HashMap<GroupId, HashSet<Worker>>,
	running: bool,
	workers_done: bool,
}

impl ReloadHelper {
	pub(crate) fn new(config: &GroupConfig) -> Self {
		Self {
			next_idle: config.groups().map(|group| (group, HashSet::new())).collect(),
			running: false,
			workers_done: false,
		}
	}

	/// Begins collecting the next generation. Idempotent: a second start discards whatever
	/// was staged so far and collection begins anew.
	pub(crate) fn start(&mut self) {
		for set in self.next_idle.values_mut() {
			set.clear();
		}
		self.running = true;
		self.workers_done = false;
	}

	/// Aborts collection and returns the staged tokens so the caller can reset their status.
	pub(crate) fn stop(&mut self) -> Vec<Worker> {
		self.running = false;
		self.workers_done = false;
		let mut discarded = Vec::new();
		for set in self.next_idle.values_mut() {
			discarded.extend(set.drain());
		}
		discarded
	}

	pub(crate) fn add_worker(&mut self, worker: Worker, group: GroupId, config: &GroupConfig) {
		match self.next_idle.get_mut(&group) {
			Some(set) => {
				set.insert(worker);
			},
			None => {
				debug_assert!(false, "staged worker for unconfigured group {group}");
				return
			},
		}
		self.update_done(config);
	}

	/// Drops a staged worker that disconnected before the swap. Returns whether it was
	/// staged at all.
	pub(crate) fn remove_worker(&mut self, worker: Worker, config: &GroupConfig) -> bool {
		let removed = self.next_idle.values_mut().any(|set| set.remove(&worker));
		if removed {
			self.update_done(config);
		}
		removed
	}

	/// Moves the staging set out for the swap. The helper is left stopped and empty; the
	/// handles now belong to the live registry.
	pub(crate) fn take_staged(&mut self) -> HashMap<GroupId, HashSet<Worker>> {
		self.running = false;
		self.workers_done = false;
		self.next_idle
			.iter_mut()
			.map(|(&group, set)| (group, std::mem::take(set)))
			.collect()
	}

	/// True iff a reload is running and every configured group has staged at least its
	/// expected worker count.
	pub(crate) fn workers_done(&self) -> bool {
		self.workers_done
	}

	pub(crate) fn running(&self) -> bool {
		self.running
	}

	pub(crate) fn staged_len(&self, group: GroupId) -> usize {
		self.next_idle.get(&group).map_or(0, |set| set.len())
	}

	pub(crate) fn is_staged(&self, worker: Worker) -> bool {
		self.next_idle.values().any(|set| set.contains(&worker))
	}

	#[cfg(test)]
	pub(crate) fn staged_total(&self) -> usize {
		self.next_idle.values().map(|set| set.len()).sum()
	}

	fn update_done(&mut self, config: &GroupConfig) {
		self.workers_done = self.running &&
			config.groups().all(|group| self.staged_len(group) >= config.expected_count(group));
	}
}
