//! The raw socket a netlink session talks through.

use crate::Result;

/// Transport abstraction so sessions can be driven by a scripted socket
/// in tests. One outstanding request at a time; the session owns the
/// socket.
pub trait NetlinkSocket {
    /// Sends one complete request datagram.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receives one response datagram into `buf`, returning its length.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;
}

#[cfg(target_os = "linux")]
pub use route::RouteSocket;

#[cfg(target_os = "linux")]
mod route {
    use std::io;
    use std::os::fd::RawFd;

    use super::NetlinkSocket;
    use crate::{Error, Result};

    /// A `NETLINK_ROUTE` socket bound to this process.
    #[derive(Debug)]
    pub struct RouteSocket {
        fd: RawFd,
    }

    impl RouteSocket {
        /// Opens `socket(AF_NETLINK, SOCK_RAW, NETLINK_ROUTE)` and binds
        /// it with an unspecified port id.
        pub fn new() -> Result<Self> {
            let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_ROUTE) };
            if fd < 0 {
                return Err(last_error());
            }
            let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
            addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
            let rc = unsafe {
                libc::bind(
                    fd,
                    std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
                    std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                let err = last_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
            Ok(Self { fd })
        }
    }

    impl NetlinkSocket for RouteSocket {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            let rc = unsafe { libc::send(self.fd, data.as_ptr().cast(), data.len(), 0) };
            if rc < 0 {
                return Err(last_error());
            }
            if rc as usize != data.len() {
                return Err(Error::SendMarshal(format!(
                    "short send: {rc} of {} bytes",
                    data.len()
                )));
            }
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
            let rc = unsafe { libc::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
            if rc < 0 {
                return Err(last_error());
            }
            Ok(rc as usize)
        }
    }

    impl Drop for RouteSocket {
        fn drop(&mut self) {
            unsafe { libc::close(self.fd) };
        }
    }

    fn last_error() -> Error {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            Error::Interrupted
        } else {
            Error::Io(err)
        }
    }
}
