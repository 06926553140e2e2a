//! The fixed-capacity stream pool and the paired-stream lifecycle:
//! insertion, removal, the two-phase abandon/reap teardown protocol,
//! and eviction under pool exhaustion. Grounded on
//! `axproxy-collections`'s generic slab for the underlying storage,
//! with the intrusive active list and the pair/abandon semantics kept
//! here since they're specific to this proxy, not a reusable container.

use std::os::fd::RawFd;

use axproxy_collections::queue::ByteQueue;
use axproxy_runtime::io;
use axproxy_runtime::{Interest, Reactor};
use log::trace;

use crate::config::QUEUE_CAPACITY;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
	Accept,
	PortA,
	PortB,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
	None,
	SocksVer,
	SocksAuth,
	SocksReq,
	SocksPass,
	Connecting,
	Forwarding,
}

/// One pool slot: a connection (or the single listening socket) plus everything the
/// state machine needs to drive it. `fd` is `None` exactly when the slot holds no
/// owning reference to an open descriptor.
pub struct Stream {
	pub role: Role,
	pub fd: Option<RawFd>,
	pub level: Level,
	pub events: Interest,
	pub levents: Interest,
	pub revents: Interest,
	pub registered: bool,
	pub neighbour: Option<usize>,
	pub allocated: bool,
	pub abandoned: bool,
	prev: Option<usize>,
	next: Option<usize>,
	pub queue: ByteQueue<QUEUE_CAPACITY>,
}

impl Stream {
	fn empty() -> Self {
		Self {
			role: Role::Accept,
			fd: None,
			level: Level::None,
			events: Interest::NONE,
			levents: Interest::NONE,
			revents: Interest::NONE,
			registered: false,
			neighbour: None,
			allocated: false,
			abandoned: false,
			prev: None,
			next: None,
			queue: ByteQueue::new(),
		}
	}
}

/// Array of `POOL_SIZE` stream slots plus the intrusive doubly linked active list.
/// Slot storage comes from a plain `Vec` sized once at startup; allocation never grows past `POOL_SIZE`.
pub struct StreamPool {
	slots: Vec<Stream>,
	head: Option<usize>,
	tail: Option<usize>,
}

impl StreamPool {
	pub fn new(capacity: usize) -> Self {
		let mut slots = Vec::with_capacity(capacity);
		slots.resize_with(capacity, Stream::empty);
		Self { slots, head: None, tail: None }
	}

	pub fn get(&self, idx: usize) -> &Stream {
		&self.slots[idx]
	}

	pub fn get_mut(&mut self, idx: usize) -> &mut Stream {
		&mut self.slots[idx]
	}

	pub fn capacity(&self) -> usize {
		self.slots.len()
	}

	pub fn active_count(&self) -> usize {
		self.slots.iter().filter(|s| s.allocated).count()
	}

	/// Active-list order, head to tail: the order the reactor dispatch cycle visits streams in.
	pub fn active_indices(&self) -> Vec<usize> {
		let mut out = Vec::new();
		let mut cur = self.head;
		while let Some(idx) = cur {
			out.push(idx);
			cur = self.slots[idx].next;
		}
		out
	}

	/// Claims the first unallocated slot for a fresh stream, linking it at the head
	/// of the active list. Returns `None` when the pool is full.
	pub fn insert(&mut self, role: Role, fd: RawFd) -> Option<usize> {
		let idx = self.slots.iter().position(|s| !s.allocated)?;

		{
			let stream = &mut self.slots[idx];
			stream.role = role;
			stream.fd = Some(fd);
			stream.level = Level::None;
			stream.events = Interest::NONE;
			stream.levents = Interest::NONE;
			stream.revents = Interest::NONE;
			stream.registered = false;
			stream.neighbour = None;
			stream.allocated = true;
			stream.abandoned = false;
			stream.queue = ByteQueue::new();
			stream.prev = None;
			stream.next = self.head;
		}

		if let Some(head) = self.head {
			self.slots[head].prev = Some(idx);
		} else {
			self.tail = Some(idx);
		}

		self.head = Some(idx);
		Some(idx)
	}

	/// Tears a slot down: deregisters from the reactor, shuts down and closes its
	/// descriptor, unlinks it from the active list, and frees the slot. Idempotent:
	/// a slot with `fd == None` has already been removed.
	pub fn remove(&mut self, idx: usize, reactor: &mut Reactor) {
		let (fd, registered, prev, next) = {
			let s = &self.slots[idx];
			(s.fd, s.registered, s.prev, s.next)
		};

		let Some(fd) = fd else {
			return;
		};

		if registered {
			reactor.remove(idx, fd);
		}

		io::shutdown_and_close(fd);

		match prev {
			Some(p) => self.slots[p].next = next,
			None => self.head = next,
		}

		match next {
			Some(n) => self.slots[n].prev = prev,
			None => self.tail = prev,
		}

		let s = &mut self.slots[idx];
		s.fd = None;
		s.allocated = false;
		s.neighbour = None;
		s.prev = None;
		s.next = None;
		s.registered = false;

		trace!("stream {idx} removed");
	}

	/// Marks `idx` (and its neighbour, if any) abandoned. Actual removal is deferred
	/// to the reactor's next compaction pass so that a handler tearing down a pair
	/// mid-dispatch never invalidates another stream's in-flight event.
	pub fn abandon(&mut self, idx: usize) {
		let neighbour = self.slots[idx].neighbour;

		self.slots[idx].abandoned = true;
		self.slots[idx].neighbour = None;

		if let Some(n) = neighbour {
			self.slots[n].abandoned = true;
			self.slots[n].neighbour = None;
		}
	}

	/// Removes every already-abandoned slot. Called once per reactor cycle before dispatch.
	pub fn compact(&mut self, reactor: &mut Reactor) {
		let abandoned: Vec<usize> = self.slots.iter().enumerate().filter(|(_, s)| s.allocated && s.abandoned).map(|(i, _)| i).collect();

		for idx in abandoned {
			self.remove(idx, reactor);
		}
	}

	/// Reclaims one pair to make room when `insert` would otherwise fail: first an
	/// already-abandoned non-excluded entry, else the tail-most A/B pair that isn't
	/// `exclude`. Returns whether anything was evicted.
	pub fn force_evict(&mut self, exclude: Option<usize>, reactor: &mut Reactor) -> bool {
		let abandoned = self
			.slots
			.iter()
			.enumerate()
			.find(|(i, s)| s.allocated && s.abandoned && Some(*i) != exclude)
			.map(|(i, _)| i);

		if let Some(idx) = abandoned {
			self.remove(idx, reactor);
			return true;
		}

		let mut cur = self.tail;
		while let Some(idx) = cur {
			let s = &self.slots[idx];
			let candidate = matches!(s.role, Role::PortA | Role::PortB) && Some(idx) != exclude;

			if candidate {
				self.abandon(idx);
				self.compact(reactor);
				return true;
			}

			cur = s.prev;
		}

		false
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn insert_links_at_head_and_removal_unlinks() {
		let mut pool = StreamPool::new(4);
		let mut reactor = Reactor::new();

		let a = pool.insert(Role::PortA, -1).unwrap();
		let b = pool.insert(Role::PortB, -1).unwrap();

		assert_eq!(pool.active_indices(), vec![b, a]);
		assert_eq!(pool.active_count(), 2);

		pool.remove(a, &mut reactor);
		assert_eq!(pool.active_indices(), vec![b]);
		assert_eq!(pool.active_count(), 1);
		assert!(!pool.get(a).allocated);
	}

	#[test]
	fn pool_never_exceeds_its_fixed_capacity() {
		let mut pool = StreamPool::new(2);

		assert!(pool.insert(Role::PortA, -1).is_some());
		assert!(pool.insert(Role::PortA, -1).is_some());
		assert!(pool.insert(Role::PortA, -1).is_none());
		assert_eq!(pool.active_count(), 2);
		assert!(pool.active_count() <= pool.capacity());
	}

	#[test]
	fn abandon_cascades_to_the_neighbour_and_breaks_the_link() {
		let mut pool = StreamPool::new(4);
		let a = pool.insert(Role::PortA, -1).unwrap();
		let b = pool.insert(Role::PortB, -1).unwrap();

		pool.get_mut(a).neighbour = Some(b);
		pool.get_mut(b).neighbour = Some(a);

		pool.abandon(a);

		assert!(pool.get(a).abandoned);
		assert!(pool.get(b).abandoned);
		assert!(pool.get(a).neighbour.is_none());
		assert!(pool.get(b).neighbour.is_none());
	}

	#[test]
	fn compact_reaps_only_abandoned_slots() {
		let mut pool = StreamPool::new(4);
		let mut reactor = Reactor::new();

		let a = pool.insert(Role::PortA, -1).unwrap();
		let b = pool.insert(Role::PortB, -1).unwrap();

		pool.get_mut(a).abandoned = true;
		pool.compact(&mut reactor);

		assert!(!pool.get(a).allocated);
		assert!(pool.get(b).allocated);
		assert_eq!(pool.active_count(), 1);
	}

	#[test]
	fn force_evict_prefers_an_already_abandoned_slot_over_the_tail() {
		let mut pool = StreamPool::new(3);
		let mut reactor = Reactor::new();

		let oldest = pool.insert(Role::PortA, -1).unwrap();
		let middle = pool.insert(Role::PortA, -1).unwrap();
		pool.get_mut(middle).abandoned = true;
		let newest = pool.insert(Role::PortA, -1).unwrap();

		let evicted = pool.force_evict(Some(newest), &mut reactor);

		assert!(evicted);
		assert!(!pool.get(middle).allocated);
		assert!(pool.get(oldest).allocated);
		assert!(pool.get(newest).allocated);
	}

	#[test]
	fn force_evict_falls_back_to_the_tail_most_pair_when_nothing_is_abandoned() {
		let mut pool = StreamPool::new(2);
		let mut reactor = Reactor::new();

		let tail = pool.insert(Role::PortA, -1).unwrap();
		let head = pool.insert(Role::PortA, -1).unwrap();

		let evicted = pool.force_evict(Some(head), &mut reactor);

		assert!(evicted);
		assert!(!pool.get(tail).allocated);
		assert!(pool.get(head).allocated);
	}

	/// A 257th connection attempt against a full pool: eviction reclaims the tail pair
	/// so the insert that follows succeeds, matching the pool-exhaustion admission policy.
	#[test]
	fn a_full_pool_admits_a_new_connection_by_evicting_the_tail() {
		let mut pool = StreamPool::new(2);
		let mut reactor = Reactor::new();

		pool.insert(Role::PortA, -1).unwrap();
		pool.insert(Role::PortA, -1).unwrap();

		assert!(pool.insert(Role::PortA, -1).is_none());

		assert!(pool.force_evict(None, &mut reactor));
		let third = pool.insert(Role::PortA, 99).unwrap();

		assert_eq!(pool.active_count(), 2);
		assert_eq!(pool.get(third).fd, Some(99));
	}
}
