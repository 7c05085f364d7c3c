use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

/// A dummy descriptor watched by the reactor, whose sole purpose is to
/// return the reactor from a blocking wait when work is enqueued from
/// another thread.
///
/// A single non-blocking `eventfd` carries the signal: [`wake`] bumps
/// its counter, [`drain`] resets it once the reactor is awake.
///
/// [`wake`]: Waker::wake
/// [`drain`]: Waker::drain
#[derive(Debug, Clone)]
pub struct Waker {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    fd: RawFd,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;

        Ok(Waker {
            inner: Arc::new(Inner { fd }),
        })
    }

    /// Signal the reactor. A saturated counter already means a wake-up
    /// is pending, so would-block counts as delivered.
    pub fn wake(&self) -> io::Result<()> {
        let buf = 1u64.to_ne_bytes();
        let res = syscall!(write(
            self.inner.fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        ));

        match res {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Reset the counter after the reactor has woken. Any number of
    /// wake-ups collapses into one drain; an already-empty counter is
    /// not an error.
    pub fn drain(&self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        let res = syscall!(read(
            self.inner.fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ));

        match res {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.fd
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::io::AsRawFd;

    use super::Waker;

    #[test]
    fn repeated_wakes_collapse_into_one_drain() {
        let waker = Waker::new().unwrap();

        waker.wake().unwrap();
        waker.wake().unwrap();
        waker.wake().unwrap();

        waker.drain().unwrap();

        // Nothing pending; a second drain must neither block nor fail.
        waker.drain().unwrap();
    }

    #[test]
    fn clones_share_one_descriptor() {
        let waker = Waker::new().unwrap();
        let clone = waker.clone();

        assert_eq!(waker.as_raw_fd(), clone.as_raw_fd());

        clone.wake().unwrap();
        waker.drain().unwrap();
    }
}
