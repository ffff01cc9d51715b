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

//! Per-group FIFO of tasks waiting for a worker.
//!
//! Unbounded by design; backpressure, if any, is enforced upstream by the ingress layer.
//! Order is guaranteed within a group only.

use super::TaskItem;
use crate::config::GroupConfig;
use std::collections::{HashMap, VecDeque};
use taskmux_common::GroupId;

pub(crate) struct GroupQueue {
	queues: HashMap<GroupId, VecDeque<TaskItem>>,
}

impl GroupQueue {
	/// One empty queue per configured group. Unknown groups are the dispatcher's business to
	/// reject; nothing is materialised on demand here.
	pub(crate) fn new(config: &GroupConfig) -> Self {
		Self { queues: config.groups().map(|group| (group, VecDeque::new())).collect() }
	}

	pub(crate) fn put(&mut self, group: GroupId, item: TaskItem) {
		match self.queues.get_mut(&group) {
			Some(queue) => queue.push_back(item),
			None => debug_assert!(false, "queue for unconfigured group {group}"),
		}
	}

	/// Pops the oldest task for the group, if any.
	pub(crate) fn get(&mut self, group: GroupId) -> Option<TaskItem> {
		self.queues.get_mut(&group).and_then(|queue| queue.pop_front())
	}

	pub(crate) fn len(&self, group: GroupId) -> usize {
		self.queues.get(&group).map_or(0, |queue| queue.len())
	}

	pub(crate) fn len_total(&self) -> usize {
		self.queues.values().map(|queue| queue.len()).sum()
	}

	pub(crate) fn clear(&mut self) {
		for queue in self.queues.values_mut() {
			queue.clear();
		}
	}
}
