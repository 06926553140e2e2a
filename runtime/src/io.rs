//! Raw, non-blocking socket primitives the state machine composes
//! directly: these are thin, checked wrappers over the exact syscalls
//! the design calls for (`FIONREAD`, `TIOCOUTQ`, `SO_SNDBUF`,
//! `SO_ERROR`, `MSG_PEEK`, `MSG_NOSIGNAL`) rather than a general
//! sockets abstraction, since the forwarding discipline needs these
//! specific knobs and nothing more.

use std::io;
use std::mem;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::fd::RawFd;

use libc::{
	accept, bind, c_int, c_void, close as libc_close, connect, fcntl, getsockopt, ioctl, listen, recv, send, setsockopt, shutdown, socket,
	socklen_t, sockaddr, sockaddr_in, sockaddr_in6, EINPROGRESS, EWOULDBLOCK, F_GETFL, F_SETFL, MSG_NOSIGNAL, MSG_PEEK, O_NONBLOCK, SHUT_RDWR,
	SOCK_STREAM, SOL_SOCKET, SO_ERROR, SO_REUSEADDR, SO_SNDBUF,
};

fn last_err() -> io::Error {
	io::Error::last_os_error()
}

fn would_block(err: &io::Error) -> bool {
	err.raw_os_error() == Some(EWOULDBLOCK) || err.kind() == io::ErrorKind::WouldBlock
}

fn sockaddr_in_of(addr: SocketAddrV4) -> sockaddr_in {
	let mut sa: sockaddr_in = unsafe { mem::zeroed() };
	sa.sin_family = libc::AF_INET as _;
	sa.sin_port = addr.port().to_be();
	sa.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
	sa
}

fn sockaddr_in6_of(addr: std::net::SocketAddrV6) -> sockaddr_in6 {
	let mut sa: sockaddr_in6 = unsafe { mem::zeroed() };
	sa.sin6_family = libc::AF_INET6 as _;
	sa.sin6_port = addr.port().to_be();
	sa.sin6_addr.s6_addr = addr.ip().octets();
	sa
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
	let flags = unsafe { fcntl(fd, F_GETFL, 0) };
	if flags < 0 {
		return Err(last_err());
	}

	if unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) } < 0 {
		return Err(last_err());
	}

	Ok(())
}

/// Creates a listening IPv4 TCP socket bound to `addr`, non-blocking, with the given backlog.
pub fn listen_tcp(addr: SocketAddrV4, backlog: i32) -> io::Result<RawFd> {
	let fd = unsafe { socket(libc::AF_INET, SOCK_STREAM, 0) };
	if fd < 0 {
		return Err(last_err());
	}

	let yes: c_int = 1;
	let ret = unsafe { setsockopt(fd, SOL_SOCKET, SO_REUSEADDR, &yes as *const _ as *const c_void, mem::size_of::<c_int>() as socklen_t) };
	if ret < 0 {
		let err = last_err();
		unsafe { libc_close(fd) };
		return Err(err);
	}

	let sa = sockaddr_in_of(addr);
	let ret = unsafe { bind(fd, &sa as *const _ as *const sockaddr, mem::size_of::<sockaddr_in>() as socklen_t) };
	if ret < 0 {
		let err = last_err();
		unsafe { libc_close(fd) };
		return Err(err);
	}

	if unsafe { listen(fd, backlog) } < 0 {
		let err = last_err();
		unsafe { libc_close(fd) };
		return Err(err);
	}

	if let Err(err) = set_nonblocking(fd) {
		unsafe { libc_close(fd) };
		return Err(err);
	}

	Ok(fd)
}

/// Accepts one pending connection, if any. `Ok(None)` means no connection was waiting (`EAGAIN`/`EWOULDBLOCK`).
pub fn accept_nonblocking(listen_fd: RawFd) -> io::Result<Option<RawFd>> {
	let fd = unsafe { accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };

	if fd >= 0 {
		set_nonblocking(fd)?;
		return Ok(Some(fd));
	}

	let err = last_err();
	if would_block(&err) {
		return Ok(None);
	}

	Err(err)
}

pub enum ConnectOutcome {
	/// The only acceptable outcome for a non-blocking connect: it's proceeding in the background.
	InProgress,
}

/// Creates a non-blocking TCP socket (IPv4 or IPv6, per `addr`) and starts connecting.
/// Any completion other than `EINPROGRESS` is an error, including an immediate successful connect.
pub fn connect_nonblocking(addr: SocketAddr) -> io::Result<(RawFd, ConnectOutcome)> {
	let (fd, ret) = match addr {
		SocketAddr::V4(a) => {
			let fd = unsafe { socket(libc::AF_INET, SOCK_STREAM, 0) };
			if fd < 0 {
				return Err(last_err());
			}
			if let Err(err) = set_nonblocking(fd) {
				unsafe { libc_close(fd) };
				return Err(err);
			}
			let sa = sockaddr_in_of(a);
			let ret = unsafe { connect(fd, &sa as *const _ as *const sockaddr, mem::size_of::<sockaddr_in>() as socklen_t) };
			(fd, ret)
		}
		SocketAddr::V6(a) => {
			let fd = unsafe { socket(libc::AF_INET6, SOCK_STREAM, 0) };
			if fd < 0 {
				return Err(last_err());
			}
			if let Err(err) = set_nonblocking(fd) {
				unsafe { libc_close(fd) };
				return Err(err);
			}
			let sa = sockaddr_in6_of(a);
			let ret = unsafe { connect(fd, &sa as *const _ as *const sockaddr, mem::size_of::<sockaddr_in6>() as socklen_t) };
			(fd, ret)
		}
	};

	if ret >= 0 {
		// Immediate success is not the protocol this design expects from a non-blocking connect.
		unsafe { libc_close(fd) };
		return Err(io::Error::new(io::ErrorKind::Other, "connect() completed synchronously"));
	}

	let err = last_err();
	if err.raw_os_error() != Some(EINPROGRESS) {
		unsafe { libc_close(fd) };
		return Err(err);
	}

	Ok((fd, ConnectOutcome::InProgress))
}

/// Reads `SO_ERROR` off a connecting socket. `Ok(0)` means the connect succeeded.
pub fn so_error(fd: RawFd) -> io::Result<i32> {
	let mut err: c_int = 0;
	let mut len = mem::size_of::<c_int>() as socklen_t;

	let ret = unsafe { getsockopt(fd, SOL_SOCKET, SO_ERROR, &mut err as *mut _ as *mut c_void, &mut len) };

	if ret < 0 {
		return Err(last_err());
	}

	Ok(err)
}

/// The kernel send-buffer size for `fd` (`SO_SNDBUF`).
pub fn sndbuf_size(fd: RawFd) -> io::Result<usize> {
	let mut size: c_int = 0;
	let mut len = mem::size_of::<c_int>() as socklen_t;

	let ret = unsafe { getsockopt(fd, SOL_SOCKET, SO_SNDBUF, &mut size as *mut _ as *mut c_void, &mut len) };

	if ret < 0 {
		return Err(last_err());
	}

	Ok(size.max(0) as usize)
}

/// Bytes currently queued in the send buffer but not yet acknowledged (`TIOCOUTQ`).
pub fn outq(fd: RawFd) -> io::Result<usize> {
	let mut n: c_int = 0;

	if unsafe { ioctl(fd, libc::TIOCOUTQ, &mut n as *mut c_int) } < 0 {
		return Err(last_err());
	}

	Ok(n.max(0) as usize)
}

/// Bytes currently available to read without blocking (`FIONREAD`).
pub fn inq(fd: RawFd) -> io::Result<usize> {
	let mut n: c_int = 0;

	if unsafe { ioctl(fd, libc::FIONREAD, &mut n as *mut c_int) } < 0 {
		return Err(last_err());
	}

	Ok(n.max(0) as usize)
}

/// A non-blocking `recv`. `Ok(None)` on `EWOULDBLOCK`; `Ok(Some(0))` means the peer closed its write half.
pub fn recv_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
	let ret = unsafe { recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };

	if ret >= 0 {
		return Ok(Some(ret as usize));
	}

	let err = last_err();
	if would_block(&err) {
		return Ok(None);
	}

	Err(err)
}

/// Peeks up to `buf.len()` bytes without consuming them (`MSG_PEEK`).
pub fn peek_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
	let ret = unsafe { recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), MSG_PEEK) };

	if ret >= 0 {
		return Ok(Some(ret as usize));
	}

	let err = last_err();
	if would_block(&err) {
		return Ok(None);
	}

	Err(err)
}

/// A non-blocking `send` with `MSG_NOSIGNAL`. `Ok(None)` on `EWOULDBLOCK`.
pub fn send_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<Option<usize>> {
	let ret = unsafe { send(fd, buf.as_ptr() as *const c_void, buf.len(), MSG_NOSIGNAL) };

	if ret >= 0 {
		return Ok(Some(ret as usize));
	}

	let err = last_err();
	if would_block(&err) {
		return Ok(None);
	}

	Err(err)
}

/// Drains as much of `queue` as the kernel will accept in one non-blocking send, shifting any
/// unsent remainder to the front. Returns the number of bytes actually sent.
///
/// A zero-byte send against a non-empty queue means the peer closed its write half; per the
/// design that counts as a failure, not a no-op.
pub fn drain_to<const N: usize>(fd: RawFd, queue: &mut axproxy_collections::queue::ByteQueue<N>) -> io::Result<usize> {
	if queue.is_empty() {
		return Ok(0);
	}

	let sent = match send_nonblocking(fd, queue.pending())? {
		Some(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer closed write half")),
		Some(n) => n,
		None => return Ok(0),
	};

	queue.consume(sent);
	Ok(sent)
}

pub fn shutdown_and_close(fd: RawFd) {
	unsafe {
		shutdown(fd, SHUT_RDWR);
		libc_close(fd);
	}
}
