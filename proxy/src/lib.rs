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

//! Task dispatcher and worker lifecycle subsystem of the taskmux proxy.
//!
//! The proxy is one process of a multi-process request-dispatch setup: clients talk to the
//! proxy over TCP/UDP, the proxy routes each request to a pool of locally-forked worker
//! processes partitioned into operator-configured groups, and a master process forks and
//! retires those workers. This crate implements the part that makes the whole thing tick: the
//! per-group scheduler, the backpressure queue and the zero-downtime reload of the worker
//! pool.
//!
//! # Architecture
//!
//! All dispatcher state lives in a single event-loop task started with [`start`]. The
//! connection layers (client ingress, worker IPC, master IPC, admin console) hold a clonable
//! [`DispatcherHandle`] and talk to the loop over one channel, which serialises every
//! operation and thereby keeps the dispatcher free of reentrancy. Workers are represented by
//! records owned by the dispatcher's registry; a connection holds only a stable [`Worker`]
//! token and an outbox receiver through which assigned tasks are pushed to it.
//!
//! A task addressed to a group is handed to any idle worker of that group, or queued FIFO
//! when none is available. A worker that finishes a task asks for the next one and either
//! receives it immediately or goes back to idle.
//!
//! # Reload
//!
//! On an operator signal the master forks a fresh worker generation while the old one keeps
//! serving. Each new worker announces readiness and is parked in a staging set, withheld from
//! dispatch. Once every group has its configured count of staged workers *and* the old
//! generation has drained to idle, the staging set atomically becomes the live idle set, the
//! queued backlog starts draining into the new workers, and the master is told to retire the
//! old generation. In-flight work is never dropped by the swap.

mod config;
mod dispatch;
mod host;
mod metrics;

pub use config::{ConfigError, GroupConfig, ProxyConfig, DEFAULT_SLOW_TASK_BENCHMARK_MS};
pub use dispatch::{
	AttachError, Event, GroupStatus, StatusReport, TaskDispatcher, TaskItem, Worker, WorkerOutbox,
	WorkerStatus,
};
pub use host::{relay_events, start, DispatcherGone, DispatcherHandle, ToDispatcher};
pub use metrics::Metrics;

#[cfg(unix)]
pub use host::handle_signals;

pub(crate) const LOG_TARGET: &str = "taskmux::proxy";
