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

//! Types shared between the proxy process and its master/worker counterparts.
//!
//! The proxy, the master (the process that forks workers) and the workers themselves talk over
//! IPC channels owned by their respective connection layers. This crate carries the few types
//! that cross those process boundaries: group identifiers, the ingress token a reply is routed
//! back with, the worker handshake announcement and the control commands sent to the master.
//! Wire framing is the connection layers' business and lives elsewhere.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a worker group.
///
/// Groups partition the worker pool into operator-defined workload classes. Every request is
/// addressed to exactly one group, and queues, registries and the reload staging set are all
/// keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<u32> for GroupId {
	fn from(id: u32) -> Self {
		Self(id)
	}
}

/// Opaque token identifying the ingress connection a reply must be routed back to.
///
/// Minted by the client connection layer when a request arrives and carried alongside the
/// request payload all the way to the worker and back. The dispatcher never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngressId(pub u64);

impl fmt::Display for IngressId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// First message a worker sends after connecting its IPC channel, announcing which group it
/// serves. The proxy creates the worker's handle from it; the worker becomes dispatchable
/// once it separately announces readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHello {
	pub group: GroupId,
}

/// Control commands the proxy sends to the master process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCmd {
	/// The worker generations were swapped; the master should terminate the outgoing one.
	ReplaceWorkers,
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeMap;

	#[test]
	fn group_id_works_as_map_key() {
		let mut map = BTreeMap::new();
		map.insert(GroupId(1), 2usize);
		map.insert(GroupId(7), 1usize);

		let encoded = serde_json::to_string(&map).unwrap();
		let decoded: BTreeMap<GroupId, usize> = serde_json::from_str(&encoded).unwrap();
		assert_eq!(decoded, map);
	}

	#[test]
	fn control_cmd_round_trips() {
		let encoded = serde_json::to_string(&ControlCmd::ReplaceWorkers).unwrap();
		let decoded: ControlCmd = serde_json::from_str(&encoded).unwrap();
		assert_eq!(decoded, ControlCmd::ReplaceWorkers);
	}

	#[test]
	fn worker_hello_round_trips() {
		let hello = WorkerHello { group: GroupId(3) };
		let encoded = serde_json::to_string(&hello).unwrap();
		let decoded: WorkerHello = serde_json::from_str(&encoded).unwrap();
		assert_eq!(decoded, hello);
	}
}
