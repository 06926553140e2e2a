//! A unified poll/epoll readiness interface, hiding the backend
//! choice behind `set_interest` / `wait` / `iter_ready` exactly as
//! described for the stream state machine: callers register a fd
//! once under a stable `cookie` (the stream pool's own slot index
//! works directly), update its interest as the state machine's
//! `events` mask changes, and drain a list of ready events per cycle.
//!
//! At startup an epoll instance is attempted; if the kernel refuses
//! it (old kernel, sandboxed environment without `CLONE_NEWUSER`
//! epoll support, etc.) the reactor falls back to level-triggered
//! `poll(2)`. Both backends always additionally watch for
//! error/hangup, regardless of the caller's requested interest.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Readable/writable interest requested by the state machine for one stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest {
	pub readable: bool,
	pub writable: bool,
}

impl Interest {
	pub const NONE: Interest = Interest { readable: false, writable: false };
	pub const READABLE: Interest = Interest { readable: true, writable: false };
	pub const WRITABLE: Interest = Interest { readable: false, writable: true };

	pub fn is_none(self) -> bool {
		!self.readable && !self.writable
	}
}

/// One readiness report, dispatched to whichever stream owns `cookie` (its pool slot index).
#[derive(Clone, Copy, Debug)]
pub struct Event {
	pub cookie: usize,
	pub readable: bool,
	pub writable: bool,
	pub error: bool,
	pub hup: bool,
}

pub struct Reactor {
	backend: Backend,
	events: Vec<Event>,
}

enum Backend {
	Epoll(epoll::Epoll),
	Poll(poll::Poll),
}

impl Reactor {
	/// Tries to create an epoll instance; falls back to `poll(2)` on failure.
	pub fn new() -> Self {
		let backend = match epoll::Epoll::new() {
			Ok(e) => Backend::Epoll(e),
			Err(err) => {
				log::warn!("epoll unavailable ({err}), falling back to poll(2)");
				Backend::Poll(poll::Poll::new())
			}
		};

		Self { backend, events: Vec::new() }
	}

	/// Registers `fd` under `cookie` with the given interest. `cookie` must not already be registered.
	pub fn add(&mut self, cookie: usize, fd: RawFd, interest: Interest) -> io::Result<()> {
		match &mut self.backend {
			Backend::Epoll(e) => e.add(cookie, fd, interest),
			Backend::Poll(p) => p.add(cookie, fd, interest),
		}
	}

	/// Updates the interest for an already-registered `cookie`.
	pub fn modify(&mut self, cookie: usize, fd: RawFd, interest: Interest) -> io::Result<()> {
		match &mut self.backend {
			Backend::Epoll(e) => e.modify(cookie, fd, interest),
			Backend::Poll(p) => p.modify(cookie, fd, interest),
		}
	}

	/// Deregisters `cookie`. Idempotent: unknown cookies are ignored.
	pub fn remove(&mut self, cookie: usize, fd: RawFd) {
		match &mut self.backend {
			Backend::Epoll(e) => e.remove(cookie, fd),
			Backend::Poll(p) => p.remove(cookie, fd),
		}
	}

	/// Blocks up to `timeout` (or forever if `None`) and returns the ready events.
	pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<&[Event]> {
		self.events.clear();

		match &mut self.backend {
			Backend::Epoll(e) => e.wait(timeout, &mut self.events)?,
			Backend::Poll(p) => p.wait(timeout, &mut self.events)?,
		}

		Ok(&self.events)
	}

	pub fn registered_count(&self) -> usize {
		match &self.backend {
			Backend::Epoll(e) => e.count(),
			Backend::Poll(p) => p.count(),
		}
	}
}

impl Default for Reactor {
	fn default() -> Self {
		Self::new()
	}
}

fn timeout_millis(timeout: Option<Duration>) -> i32 {
	timeout.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

mod poll {
	use std::io;
	use std::os::fd::RawFd;
	use std::time::Duration;

	use libc::{poll, pollfd, POLLERR, POLLHUP, POLLIN, POLLOUT};

	use super::{timeout_millis, Event, Interest};

	pub struct Poll {
		fds: Vec<pollfd>,
		cookies: Vec<usize>,
	}

	impl Poll {
		pub fn new() -> Self {
			Self { fds: Vec::new(), cookies: Vec::new() }
		}

		pub fn count(&self) -> usize {
			self.fds.len()
		}

		fn index_of(&self, cookie: usize) -> Option<usize> {
			self.cookies.iter().position(|&c| c == cookie)
		}

		pub fn add(&mut self, cookie: usize, fd: RawFd, interest: Interest) -> io::Result<()> {
			self.fds.push(pollfd { fd, events: to_events(interest), revents: 0 });
			self.cookies.push(cookie);
			Ok(())
		}

		pub fn modify(&mut self, cookie: usize, fd: RawFd, interest: Interest) -> io::Result<()> {
			if let Some(idx) = self.index_of(cookie) {
				self.fds[idx] = pollfd { fd, events: to_events(interest), revents: 0 };
			}
			Ok(())
		}

		pub fn remove(&mut self, cookie: usize, _fd: RawFd) {
			if let Some(idx) = self.index_of(cookie) {
				self.fds.swap_remove(idx);
				self.cookies.swap_remove(idx);
			}
		}

		pub fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<()> {
			let ret = unsafe { poll(self.fds.as_mut_ptr(), self.fds.len() as _, timeout_millis(timeout)) };

			if ret < 0 {
				return Err(io::Error::last_os_error());
			}

			for (fd, &cookie) in self.fds.iter().zip(self.cookies.iter()) {
				if fd.revents == 0 {
					continue;
				}

				out.push(Event {
					cookie,
					readable: fd.revents & POLLIN != 0,
					writable: fd.revents & POLLOUT != 0,
					error: fd.revents & POLLERR != 0,
					hup: fd.revents & POLLHUP != 0,
				});
			}

			for fd in &mut self.fds {
				fd.revents = 0;
			}

			Ok(())
		}
	}

	fn to_events(interest: Interest) -> i16 {
		let mut events = POLLERR | POLLHUP;
		if interest.readable {
			events |= POLLIN;
		}
		if interest.writable {
			events |= POLLOUT;
		}
		events as i16
	}
}

mod epoll {
	use std::io;
	use std::os::fd::RawFd;
	use std::time::Duration;

	use libc::{
		close, epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLL_CTL_ADD, EPOLL_CTL_DEL,
		EPOLL_CTL_MOD,
	};

	use super::{timeout_millis, Event, Interest};

	pub struct Epoll {
		fd: RawFd,
		count: usize,
		buf: Vec<epoll_event>,
	}

	impl Epoll {
		pub fn new() -> io::Result<Self> {
			let fd = unsafe { epoll_create1(0) };

			if fd < 0 {
				return Err(io::Error::last_os_error());
			}

			Ok(Self { fd, count: 0, buf: vec![unsafe { std::mem::zeroed() }; 1024] })
		}

		pub fn count(&self) -> usize {
			self.count
		}

		fn ctl(&mut self, op: i32, fd: RawFd, cookie: usize, interest: Interest) -> io::Result<()> {
			let mut ev = epoll_event { events: to_events(interest), u64: cookie as u64 };

			let ret = unsafe { epoll_ctl(self.fd, op, fd, &mut ev) };

			if ret < 0 {
				return Err(io::Error::last_os_error());
			}

			Ok(())
		}

		pub fn add(&mut self, cookie: usize, fd: RawFd, interest: Interest) -> io::Result<()> {
			self.ctl(EPOLL_CTL_ADD, fd, cookie, interest)?;
			self.count += 1;
			Ok(())
		}

		pub fn modify(&mut self, cookie: usize, fd: RawFd, interest: Interest) -> io::Result<()> {
			self.ctl(EPOLL_CTL_MOD, fd, cookie, interest)
		}

		pub fn remove(&mut self, cookie: usize, fd: RawFd) {
			let mut ev: epoll_event = unsafe { std::mem::zeroed() };
			if unsafe { epoll_ctl(self.fd, EPOLL_CTL_DEL, fd, &mut ev) } == 0 {
				self.count = self.count.saturating_sub(1);
			}
			let _ = cookie;
		}

		pub fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<()> {
			let ret = unsafe { epoll_wait(self.fd, self.buf.as_mut_ptr(), self.buf.len() as _, timeout_millis(timeout)) };

			if ret < 0 {
				return Err(io::Error::last_os_error());
			}

			for ev in &self.buf[..ret as usize] {
				out.push(Event {
					cookie: ev.u64 as usize,
					readable: ev.events & (EPOLLIN as u32) != 0,
					writable: ev.events & (EPOLLOUT as u32) != 0,
					error: ev.events & (EPOLLERR as u32) != 0,
					hup: ev.events & (EPOLLHUP as u32) != 0,
				});
			}

			Ok(())
		}
	}

	impl Drop for Epoll {
		fn drop(&mut self) {
			unsafe { close(self.fd) };
		}
	}

	fn to_events(interest: Interest) -> u32 {
		let mut events = (EPOLLERR | EPOLLHUP) as u32;
		if interest.readable {
			events |= EPOLLIN as u32;
		}
		if interest.writable {
			events |= EPOLLOUT as u32;
		}
		events
	}
}

#[cfg(test)]
mod tests {
	use std::os::fd::AsRawFd;
	use std::time::Duration;

	use super::{Interest, Reactor};

	#[test]
	fn poll_backend_reports_writable_socket() {
		let mut reactor = Reactor { backend: super::Backend::Poll(super::poll::Poll::new()), events: Vec::new() };

		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		let client = std::net::TcpStream::connect(addr).unwrap();
		client.set_nonblocking(true).unwrap();

		reactor.add(7, client.as_raw_fd(), Interest::WRITABLE).unwrap();
		let events = reactor.wait(Some(Duration::from_millis(500))).unwrap();

		assert_eq!(events.len(), 1);
		assert_eq!(events[0].cookie, 7);
		assert!(events[0].writable);
	}
}
