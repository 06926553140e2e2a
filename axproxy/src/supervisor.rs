//! The proxy context and its run loop: binds the entrance socket,
//! drives the reactor cycle (compact → sync → wait → dispatch →
//! reduce), and the outer retry wrapper that restarts the core on a
//! transient error, matching `original_source/src/startup.c`'s
//! `EINTR`/`ENOTCONN` retry policy.

use std::io;
use std::net::SocketAddrV4;
use std::process;
use std::thread;
use std::time::Duration;

use axproxy_dns::Cache;
use axproxy_runtime::{io as rio, Interest, Reactor};
use log::{error, info, warn};

use crate::config::{LISTEN_BACKLOG, POLL_TIMEOUT_MSEC, POOL_SIZE};
use crate::fsm;
use crate::pool::{Role, StreamPool};

pub struct Proxy {
	pool: StreamPool,
	reactor: Reactor,
	cache: Cache,
	listen_idx: usize,
}

impl Proxy {
	pub fn new(addr: SocketAddrV4) -> io::Result<Self> {
		let listen_fd = rio::listen_tcp(addr, LISTEN_BACKLOG)?;

		let mut pool = StreamPool::new(POOL_SIZE);
		let mut reactor = Reactor::new();

		let listen_idx = pool.insert(Role::Accept, listen_fd).expect("pool is empty at startup");
		pool.get_mut(listen_idx).events = Interest::READABLE;

		reactor.add(listen_idx, listen_fd, Interest::READABLE)?;
		pool.get_mut(listen_idx).registered = true;
		pool.get_mut(listen_idx).levents = Interest::READABLE;

		info!("listening on {addr}");

		Ok(Self { pool, reactor, cache: Cache::new(), listen_idx })
	}

	/// Runs the reactor forever. Only returns on a fatal, unrecoverable error;
	/// the supervisor wrapper decides whether that's worth retrying.
	pub fn run(&mut self) -> io::Result<()> {
		loop {
			self.pool.compact(&mut self.reactor);
			self.sync_interest()?;

			let timeout = Duration::from_millis(POLL_TIMEOUT_MSEC);
			let ready: Vec<_> = self.reactor.wait(Some(timeout))?.to_vec();

			if ready.is_empty() {
				self.reduce();
				self.pool.compact(&mut self.reactor);
				continue;
			}

			for ev in ready {
				match fsm::advance(&mut self.pool, &mut self.reactor, &mut self.cache, ev.cookie, ev) {
					Ok(evicted) => {
						// `force_evict` just freed and possibly reused a slot; any later cookie
						// in this same batch may now alias that slot, so the rest of the batch
						// is deferred to the next cycle rather than dispatched against stale state.
						if evicted {
							break;
						}
					}
					Err(()) => {
						error!("fatal error advancing stream {}", ev.cookie);
						return Err(io::Error::new(io::ErrorKind::Other, "reactor stream fatal"));
					}
				}
			}
		}
	}

	/// Synchronizes each active stream's kernel registration with its `events` mask:
	/// ADD on first registration, MOD on a changed mask, DEL when interest drops to none.
	fn sync_interest(&mut self) -> io::Result<()> {
		for idx in self.pool.active_indices() {
			let (fd, events, levents, registered) = {
				let s = self.pool.get(idx);
				(s.fd, s.events, s.levents, s.registered)
			};

			let Some(fd) = fd else { continue };

			if events.is_none() {
				if registered {
					self.reactor.remove(idx, fd);
					self.pool.get_mut(idx).registered = false;
				}
			} else if !registered {
				self.reactor.add(idx, fd, events)?;
				self.pool.get_mut(idx).registered = true;
			} else if events != levents {
				self.reactor.modify(idx, fd, events)?;
			}

			self.pool.get_mut(idx).levents = events;
		}

		Ok(())
	}

	/// The timeout sweep: abandons every non-FORWARDING pair member, so a client that
	/// never completes its handshake eventually gets reclaimed.
	fn reduce(&mut self) {
		use crate::pool::Level;

		let stale: Vec<usize> = self
			.pool
			.active_indices()
			.into_iter()
			.filter(|&idx| {
				let s = self.pool.get(idx);
				idx != self.listen_idx && s.role != Role::Accept && s.level != Level::Forwarding
			})
			.collect();

		if !stale.is_empty() {
			warn!("reduce sweep: reclaiming {} stale stream(s)", stale.len());
		}

		for idx in stale {
			self.pool.abandon(idx);
		}
	}
}


fn is_transient(err: &io::Error) -> bool {
	matches!(err.raw_os_error(), Some(libc::EINTR) | Some(libc::ENOTCONN))
}

/// Parses the entrance address, then runs [`Proxy`] forever, restarting it on a
/// transient (`EINTR`/`ENOTCONN`) error and exiting non-zero on anything else.
/// The core loop never returns success.
pub fn supervise(addr: SocketAddrV4) -> ! {
	loop {
		let outcome = Proxy::new(addr).and_then(|mut proxy| proxy.run());

		match outcome {
			Err(err) if is_transient(&err) => {
				warn!("transient error ({err}), retrying in 1s");
				thread::sleep(Duration::from_secs(1));
			}
			Err(err) => {
				error!("fatal: {err}");
				process::exit(1);
			}
			Ok(()) => unreachable!("the core loop never returns success"),
		}
	}
}
