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

//! Channel front-end of the dispatcher.
//!
//! [`start`] builds the dispatcher and returns a future running its event loop. Connection
//! layers talk to the loop through a clonable [`DispatcherHandle`]; every operation travels
//! over one channel, which serialises them and keeps the dispatcher single-threaded without
//! locks. The loop winds down once the last handle is dropped.

use crate::{
	config::ProxyConfig,
	dispatch::{
		AttachError, Event, StatusReport, TaskDispatcher, TaskItem, Worker, WorkerOutbox,
	},
	metrics::Metrics,
	LOG_TARGET,
};
use futures::{
	channel::{mpsc, oneshot},
	Future, StreamExt,
};
use taskmux_common::{ControlCmd, GroupId, WorkerHello};
use tracing::{debug, info, warn};

/// Operations the connection layers send to the dispatcher loop.
#[derive(Debug)]
pub enum ToDispatcher {
	/// A client request arrived for the group.
	AddTask { group: GroupId, item: TaskItem },
	/// A worker connected its IPC channel and sent its handshake announcement; the reply
	/// carries its token.
	AttachWorker {
		hello: WorkerHello,
		outbox: WorkerOutbox,
		reply: oneshot::Sender<Result<Worker, AttachError>>,
	},
	/// The worker's handshake completed; it is ready for dispatch.
	ReadyWorker { worker: Worker },
	/// The worker finished a task and is ready for the next one.
	WorkerIdle { worker: Worker },
	/// The worker's channel disconnected.
	RemoveWorker { worker: Worker },
	/// Operator asked for a reload (typically SIGHUP).
	StartReload,
	/// Operator aborted a pending reload.
	StopReload,
	/// Admin console introspection.
	QueryStatus { reply: oneshot::Sender<StatusReport> },
}

/// The dispatcher loop is gone; the proxy is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("dispatcher terminated")]
pub struct DispatcherGone;

/// Clonable handle to the dispatcher loop.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
	to_dispatcher: mpsc::UnboundedSender<ToDispatcher>,
}

impl DispatcherHandle {
	fn send(&self, msg: ToDispatcher) -> Result<(), DispatcherGone> {
		self.to_dispatcher.unbounded_send(msg).map_err(|_| DispatcherGone)
	}

	pub fn add_task(&self, group: GroupId, item: TaskItem) -> Result<(), DispatcherGone> {
		self.send(ToDispatcher::AddTask { group, item })
	}

	/// Registers a worker channel from its handshake announcement and returns its stable
	/// token. The worker will not be dispatched to until [`Self::ready_worker`] is called
	/// for it.
	pub async fn attach_worker(
		&self,
		hello: WorkerHello,
		outbox: WorkerOutbox,
	) -> Result<Worker, AttachError> {
		let (reply, rx) = oneshot::channel();
		self.send(ToDispatcher::AttachWorker { hello, outbox, reply })
			.map_err(|_| AttachError::DispatcherGone)?;
		rx.await.map_err(|_| AttachError::DispatcherGone)?
	}

	pub fn ready_worker(&self, worker: Worker) -> Result<(), DispatcherGone> {
		self.send(ToDispatcher::ReadyWorker { worker })
	}

	/// The worker finished a task; the dispatcher pushes the next one through the outbox or
	/// marks the worker idle.
	pub fn worker_idle(&self, worker: Worker) -> Result<(), DispatcherGone> {
		self.send(ToDispatcher::WorkerIdle { worker })
	}

	pub fn remove_worker(&self, worker: Worker) -> Result<(), DispatcherGone> {
		self.send(ToDispatcher::RemoveWorker { worker })
	}

	pub fn start_reload(&self) -> Result<(), DispatcherGone> {
		self.send(ToDispatcher::StartReload)
	}

	pub fn stop_reload(&self) -> Result<(), DispatcherGone> {
		self.send(ToDispatcher::StopReload)
	}

	pub async fn status(&self) -> Result<StatusReport, DispatcherGone> {
		let (reply, rx) = oneshot::channel();
		self.send(ToDispatcher::QueryStatus { reply })?;
		rx.await.map_err(|_| DispatcherGone)
	}
}

/// Builds the dispatcher and returns its handle, the receiver of dispatcher events and the
/// event-loop future for the embedder to run.
pub fn start(
	config: ProxyConfig,
	metrics: Metrics,
) -> (DispatcherHandle, mpsc::UnboundedReceiver<Event>, impl Future<Output = ()>) {
	let (to_dispatcher, mut to_rx) = mpsc::unbounded();
	let (events_tx, events_rx) = mpsc::unbounded();
	let mut dispatcher = TaskDispatcher::new(config.groups, events_tx, metrics);

	let run = async move {
		while let Some(msg) = to_rx.next().await {
			handle_message(&mut dispatcher, msg);
		}
		dispatcher.teardown();
		info!(target: LOG_TARGET, "dispatcher loop terminated");
	};

	(DispatcherHandle { to_dispatcher }, events_rx, run)
}

fn handle_message(dispatcher: &mut TaskDispatcher, msg: ToDispatcher) {
	match msg {
		ToDispatcher::AddTask { group, item } => dispatcher.add_task(group, item),
		ToDispatcher::AttachWorker { hello, outbox, reply } =>
			match dispatcher.attach_worker(hello, outbox) {
				Ok(worker) =>
					if reply.send(Ok(worker)).is_err() {
						// The connection died between attach and reply; nobody holds the
						// token, so drop the record again.
						debug!(target: LOG_TARGET, ?worker, "attach reply dropped");
						dispatcher.remove_worker(worker);
					},
				Err(err) => {
					let _ = reply.send(Err(err));
				},
			},
		ToDispatcher::ReadyWorker { worker } => dispatcher.add_ready_worker(worker),
		ToDispatcher::WorkerIdle { worker } =>
			if let Some(item) = dispatcher.alloc_task(worker) {
				dispatcher.deliver(worker, item);
			},
		ToDispatcher::RemoveWorker { worker } => dispatcher.remove_worker(worker),
		ToDispatcher::StartReload => dispatcher.start_reload(),
		ToDispatcher::StopReload => dispatcher.stop_reload(),
		ToDispatcher::QueryStatus { reply } => {
			if reply.send(dispatcher.status_report()).is_err() {
				debug!(target: LOG_TARGET, "status reply dropped");
			}
		},
	}
}

/// Forwards dispatcher events to the master connection's control outbox. Runs until the
/// dispatcher loop winds down.
pub async fn relay_events(
	mut events: mpsc::UnboundedReceiver<Event>,
	master: mpsc::UnboundedSender<ControlCmd>,
) {
	while let Some(event) = events.next().await {
		match event {
			Event::ReloadOver =>
				if master.unbounded_send(ControlCmd::ReplaceWorkers).is_err() {
					warn!(
						target: LOG_TARGET,
						"master connection gone, replace-workers command dropped"
					);
				},
		}
	}
}

/// Services the operator signals until a termination signal arrives: SIGHUP starts a reload,
/// SIGINT/SIGQUIT/SIGTERM return for an orderly shutdown of the proxy.
#[cfg(unix)]
pub async fn handle_signals(handle: DispatcherHandle) -> std::io::Result<()> {
	use tokio::signal::unix::{signal, SignalKind};

	let mut hangup = signal(SignalKind::hangup())?;
	let mut interrupt = signal(SignalKind::interrupt())?;
	let mut quit = signal(SignalKind::quit())?;
	let mut terminate = signal(SignalKind::terminate())?;

	loop {
		tokio::select! {
			_ = hangup.recv() => {
				info!(target: LOG_TARGET, "SIGHUP received, reloading the worker pool");
				if handle.start_reload().is_err() {
					break
				}
			},
			_ = interrupt.recv() => break,
			_ = quit.recv() => break,
			_ = terminate.recv() => break,
		}
	}
	info!(target: LOG_TARGET, "shutting down");
	Ok(())
}
