use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;
use nix::NixPath;
use std::os::unix::io::RawFd;

/// An owned file descriptor, closed on drop.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> ScopedFd {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> ScopedFd {
        ScopedFd { fd }
    }

    pub fn open_ro<P: ?Sized + NixPath>(path: &P) -> nix::Result<ScopedFd> {
        let fd = open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())?;
        Ok(ScopedFd { fd })
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Hand the fd over to the caller; this ScopedFd no longer owns it.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // Nothing to be done about a failed close here.
            let _ = close(self.fd);
        }
        self.fd = -1;
    }
}

impl Default for ScopedFd {
    fn default() -> ScopedFd {
        ScopedFd::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod test {
    use super::ScopedFd;

    #[test]
    fn open_and_close() {
        let mut fd = ScopedFd::open_ro("/dev/null").unwrap();
        assert!(fd.is_open());
        assert!(fd.as_raw() >= 0);
        fd.close();
        assert!(!fd.is_open());
        assert_eq!(fd.as_raw(), -1);
    }

    #[test]
    fn open_missing() {
        assert!(ScopedFd::open_ro("/nonexistent-revd-test-path").is_err());
    }

    #[test]
    fn extract_disowns() {
        let mut fd = ScopedFd::open_ro("/dev/null").unwrap();
        let raw = fd.extract();
        assert!(!fd.is_open());
        let _ = nix::unistd::close(raw);
    }
}
