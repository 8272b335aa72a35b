use std::cell::UnsafeCell;
use std::io;
use std::time::{Duration, Instant};

/// A process-shared POSIX counting semaphore living inside the mapped
/// segment. The directory header embeds two of these; the core only ever
/// calls acquire/release/timed-acquire on them.
#[repr(transparent)]
pub struct Semaphore(UnsafeCell<libc::sem_t>);

// The sem_* calls are the synchronization; the cell never hands out
// references to its interior.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Initializes the semaphore in place with `pshared = 1`.
    ///
    /// # Safety
    ///
    /// Must be called exactly once per segment, by the creating process,
    /// before any other participant attaches.
    pub unsafe fn init(&self, value: u32) -> io::Result<()> {
        if libc::sem_init(self.0.get(), 1, value as libc::c_uint) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks until a permit is available. EINTR is retried.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.0.get()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Bounded wait. Returns `false` when `deadline` passes without a
    /// permit becoming available.
    pub fn wait_deadline(&self, deadline: Instant) -> io::Result<bool> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let abs = realtime_after(remaining)?;
            if unsafe { libc::sem_timedwait(self.0.get(), &abs) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    /// Releases one permit, waking a blocked waiter if any.
    pub fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.0.get()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Current permit count. Only meaningful for assertions on a quiesced
    /// ring; racy otherwise.
    pub fn value(&self) -> io::Result<i64> {
        let mut v: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.0.get(), &mut v) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(v as i64)
    }
}

/// CLOCK_REALTIME plus `d`, the absolute form sem_timedwait expects.
fn realtime_after(d: Duration) -> io::Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(io::Error::last_os_error());
    }
    const NANOS_PER_SEC: libc::c_long = 1_000_000_000;
    let nsec = now.tv_nsec + d.subsec_nanos() as libc::c_long;
    Ok(libc::timespec {
        tv_sec: now.tv_sec + d.as_secs() as libc::time_t + (nsec / NANOS_PER_SEC) as libc::time_t,
        tv_nsec: nsec % NANOS_PER_SEC,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn boxed_sem(value: u32) -> Arc<Semaphore> {
        // pshared semaphores work for threads of one process on any
        // memory, so heap placement is fine for tests.
        let sem: Arc<Semaphore> = Arc::new(unsafe { std::mem::zeroed() });
        unsafe { sem.init(value) }.unwrap();
        sem
    }

    #[test]
    fn counts_permits() -> io::Result<()> {
        let sem = boxed_sem(2);
        assert_eq!(sem.value()?, 2);
        sem.wait()?;
        sem.wait()?;
        assert_eq!(sem.value()?, 0);
        sem.post()?;
        assert_eq!(sem.value()?, 1);
        Ok(())
    }

    #[test]
    fn bounded_wait_times_out() -> io::Result<()> {
        let sem = boxed_sem(0);
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(!sem.wait_deadline(deadline)?);
        Ok(())
    }

    #[test]
    fn post_wakes_bounded_waiter() -> io::Result<()> {
        let sem = boxed_sem(0);
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait_deadline(Instant::now() + Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        sem.post()?;
        assert!(waiter.join().unwrap()?);
        Ok(())
    }
}
