// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Passive-socket plumbing

use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

use log::warn;

const BACKLOG: libc::c_int = 128;

fn last_error() -> io::Error {
    io::Error::last_os_error()
}

unsafe fn set_option(fd: RawFd, option: libc::c_int) -> io::Result<()> {
    let one: libc::c_int = 1;
    let rc = libc::setsockopt(
        fd,
        libc::SOL_SOCKET,
        option,
        &one as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    );
    if rc < 0 {
        return Err(last_error());
    }
    Ok(())
}

/// Builds the nonblocking, close-on-exec IPv4 listen socket on
/// `0.0.0.0:<port>`. `SO_REUSEADDR` is required; `SO_REUSEPORT` is applied
/// best-effort. Bind or listen failure is reported to the caller.
pub(crate) fn bind_listener(port: u16) -> io::Result<OwnedFd> {
    let raw = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if raw < 0 {
        return Err(last_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    unsafe {
        set_option(raw, libc::SO_REUSEADDR)?;
        if let Err(err) = set_option(raw, libc::SO_REUSEPORT) {
            warn!("SO_REUSEPORT unavailable: {err}");
        }
    }

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();

    let rc = unsafe {
        libc::bind(
            raw,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(last_error());
    }

    if unsafe { libc::listen(raw, BACKLOG) } < 0 {
        return Err(last_error());
    }

    Ok(fd)
}

/// Accepts one pending connection, nonblocking and close-on-exec.
/// `Ok(None)` means the backlog is drained; `EINTR` retries internally.
pub(crate) fn accept(fd: RawFd) -> io::Result<Option<OwnedFd>> {
    loop {
        let nfd = unsafe {
            libc::accept4(
                fd,
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if nfd >= 0 {
            return Ok(Some(unsafe { OwnedFd::from_raw_fd(nfd) }));
        }
        let err = last_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(None),
            _ => return Err(err),
        }
    }
}

/// The port the socket is actually bound to; distinguishes a port-0 bind.
pub(crate) fn local_port(fd: RawFd) -> io::Result<u16> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(last_error());
    }
    Ok(u16::from_be(addr.sin_port))
}

#[cfg(test)]
mod test {
    use super::{accept, bind_listener, local_port};
    use std::net::TcpStream;
    use std::os::fd::AsRawFd;

    #[test]
    fn bind_to_port_zero_reports_the_kernel_port() {
        let fd = bind_listener(0).unwrap();
        let port = local_port(fd.as_raw_fd()).unwrap();
        assert_ne!(0, port);
    }

    #[test]
    fn accept_drains_to_none() {
        let fd = bind_listener(0).unwrap();
        let port = local_port(fd.as_raw_fd()).unwrap();
        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // The handshake completed at the kernel level, so one accept
        // succeeds and the next reports an empty backlog.
        let mut accepted = None;
        for _ in 0..50 {
            if let Some(peer) = accept(fd.as_raw_fd()).unwrap() {
                accepted = Some(peer);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(accepted.is_some());
        assert!(accept(fd.as_raw_fd()).unwrap().is_none());
    }
}
