use crate::flags::Flags;
use crate::replay_timeline::FrameTime;
use crate::scoped_fd::ScopedFd;
use nix::errno::Errno;
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, InetAddr, SockAddr, SockFlag,
    SockType,
};
use nix::Error;
use std::mem::size_of;
use std::net::SocketAddr;
use std::slice::{from_raw_parts, from_raw_parts_mut};

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum ProbePort {
    DontProbe,
    ProbePort,
}

/// Open a TCP socket on `host`:`port`, listening. If `probe` is
/// `ProbePort`, `port` is bumped until a free one is found; otherwise a
/// busy `port` is fatal. On return `port` holds the port actually bound.
pub fn open_socket(host: &str, port: &mut u16, probe: ProbePort) -> ScopedFd {
    let listen_fd = match socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    ) {
        Ok(fd) => ScopedFd::from_raw(fd),
        Err(e) => fatal!("Couldn't create socket: {}", e),
    };
    if setsockopt(listen_fd.as_raw(), sockopt::ReuseAddr, &true).is_err() {
        fatal!("Couldn't set SO_REUSEADDR");
    }

    loop {
        let std_addr: SocketAddr = match format!("{}:{}", host, port).parse() {
            Ok(addr) => addr,
            Err(_) => fatal!("Couldn't parse address {}:{}", host, port),
        };
        let addr = SockAddr::new_inet(InetAddr::from_std(&std_addr));
        match bind(listen_fd.as_raw(), &addr) {
            Ok(()) => match listen(listen_fd.as_raw(), 1) {
                Ok(()) => return listen_fd,
                Err(Error::Sys(Errno::EADDRINUSE)) if probe == ProbePort::ProbePort => (),
                Err(e) => fatal!("Couldn't listen on port {}: {}", *port, e),
            },
            Err(Error::Sys(Errno::EADDRINUSE)) | Err(Error::Sys(Errno::EACCES))
                if probe == ProbePort::ProbePort => {}
            Err(e) => fatal!("Couldn't bind to port {}: {}", *port, e),
        }
        match port.checked_add(1) {
            Some(p) => *port = p,
            None => fatal!("Couldn't find a free port to probe"),
        }
    }
}

/// View a sized value as its raw bytes.
pub fn u8_slice<T: Sized>(data: &T) -> &[u8] {
    unsafe { from_raw_parts(data as *const T as *const u8, size_of::<T>()) }
}

pub fn u8_slice_mut<T: Sized>(data: &mut T) -> &mut [u8] {
    unsafe { from_raw_parts_mut(data as *mut T as *mut u8, size_of::<T>()) }
}

/// True when the trace is configured to replay instruction-by-instruction
/// up to `event`.
pub fn trace_instructions_up_to_event(event: FrameTime) -> bool {
    event < Flags::get().singlestep_to_event
}

#[cfg(test)]
mod test {
    use super::{open_socket, u8_slice, ProbePort};

    #[test]
    fn probe_finds_a_port() {
        let mut port: u16 = 40000;
        let fd = open_socket("127.0.0.1", &mut port, ProbePort::ProbePort);
        assert!(fd.is_open());
        assert!(port >= 40000);
        // A second bind on the same port must probe past the first.
        let mut port2: u16 = port;
        let fd2 = open_socket("127.0.0.1", &mut port2, ProbePort::ProbePort);
        assert!(fd2.is_open());
        assert!(port2 > port);
    }

    #[test]
    fn bytes_of_value() {
        let v: u32 = 0x0403_0201;
        assert_eq!(u8_slice(&v), &[1, 2, 3, 4]);
    }
}
