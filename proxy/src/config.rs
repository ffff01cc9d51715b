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

//! Dispatcher configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use taskmux_common::GroupId;

/// Default for [`ProxyConfig::slow_task_benchmark_ms`].
pub const DEFAULT_SLOW_TASK_BENCHMARK_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
	#[error("group configuration is empty")]
	NoGroups,
	#[error("group configuration expects zero workers in total")]
	NoWorkers,
}

/// The static group configuration: which groups exist and how many workers each is expected
/// to run.
///
/// The expected count is what a reload waits for before swapping generations. Groups not
/// listed here do not exist as far as the dispatcher is concerned; operations referencing
/// them are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<GroupId, usize>", into = "BTreeMap<GroupId, usize>")]
pub struct GroupConfig {
	expected: BTreeMap<GroupId, usize>,
}

impl GroupConfig {
	/// Validates and wraps a group-id to expected-worker-count mapping.
	///
	/// An empty mapping is rejected outright: with nothing to wait for, a reload would be
	/// considered complete the moment it started and would swap in an empty worker set. The
	/// same goes for a mapping whose counts sum to zero.
	pub fn new(expected: BTreeMap<GroupId, usize>) -> Result<Self, ConfigError> {
		if expected.is_empty() {
			return Err(ConfigError::NoGroups)
		}
		if expected.values().all(|&count| count == 0) {
			return Err(ConfigError::NoWorkers)
		}
		for (group, &count) in &expected {
			if count == 0 {
				tracing::warn!(target: crate::LOG_TARGET, %group, "group configured with zero workers");
			}
		}
		Ok(Self { expected })
	}

	pub fn contains(&self, group: GroupId) -> bool {
		self.expected.contains_key(&group)
	}

	/// The configured worker count for a group; zero for unknown groups.
	pub fn expected_count(&self, group: GroupId) -> usize {
		self.expected.get(&group).copied().unwrap_or(0)
	}

	pub fn groups(&self) -> impl Iterator<Item = GroupId> + '_ {
		self.expected.keys().copied()
	}

	pub fn len(&self) -> usize {
		self.expected.len()
	}

	pub fn is_empty(&self) -> bool {
		self.expected.is_empty()
	}
}

impl TryFrom<BTreeMap<GroupId, usize>> for GroupConfig {
	type Error = ConfigError;

	fn try_from(expected: BTreeMap<GroupId, usize>) -> Result<Self, Self::Error> {
		Self::new(expected)
	}
}

impl From<GroupConfig> for BTreeMap<GroupId, usize> {
	fn from(config: GroupConfig) -> Self {
		config.expected
	}
}

/// Configuration of the proxy-side dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
	/// Group partitioning of the worker pool.
	pub groups: GroupConfig,
	/// Tasks whose handling takes longer than this are counted as slow by the metrics.
	#[serde(default = "default_slow_task_benchmark_ms")]
	pub slow_task_benchmark_ms: u64,
}

fn default_slow_task_benchmark_ms() -> u64 {
	DEFAULT_SLOW_TASK_BENCHMARK_MS
}

#[cfg(test)]
mod tests {
	use super::*;

	fn groups(pairs: &[(u32, usize)]) -> BTreeMap<GroupId, usize> {
		pairs.iter().map(|&(id, count)| (GroupId(id), count)).collect()
	}

	#[test]
	fn rejects_empty_configuration() {
		assert_eq!(GroupConfig::new(BTreeMap::new()), Err(ConfigError::NoGroups));
		assert_eq!(GroupConfig::new(groups(&[(1, 0), (2, 0)])), Err(ConfigError::NoWorkers));
	}

	#[test]
	fn expected_counts() {
		let config = GroupConfig::new(groups(&[(1, 2), (2, 1)])).unwrap();
		assert!(config.contains(GroupId(1)));
		assert!(!config.contains(GroupId(3)));
		assert_eq!(config.expected_count(GroupId(1)), 2);
		assert_eq!(config.expected_count(GroupId(3)), 0);
		assert_eq!(config.groups().collect::<Vec<_>>(), vec![GroupId(1), GroupId(2)]);
	}

	#[test]
	fn deserialisation_validates() {
		let config: ProxyConfig =
			serde_json::from_str(r#"{ "groups": { "1": 1, "2": 2 } }"#).unwrap();
		assert_eq!(config.groups.len(), 2);
		assert_eq!(config.slow_task_benchmark_ms, DEFAULT_SLOW_TASK_BENCHMARK_MS);

		assert!(serde_json::from_str::<ProxyConfig>(r#"{ "groups": {} }"#).is_err());
	}
}
