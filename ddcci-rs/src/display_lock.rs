/* Per-display lock registry: guarantees at most one open display handle
 * per physical device across the whole process.
 *
 * Records are created on first lookup and never destroyed; their count is
 * bounded by the number of I2C buses.  A master mutex serializes record
 * creation, and each record's own mutex guards the ownership inspection. */

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread::{self, ThreadId};

use nix::unistd::gettid;
use tracing::debug;

use crate::display::IoPath;
use crate::status::{DdcError, ErrorInfo};

pub(crate) struct DisplayLockRecord {
    pub io_path: IoPath,
    state: Mutex<LockState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    linux_tid: i32,
}

static LOCK_REGISTRY: OnceLock<Mutex<HashMap<IoPath, Arc<DisplayLockRecord>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<IoPath, Arc<DisplayLockRecord>>> {
    LOCK_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lock_state(rec: &DisplayLockRecord) -> MutexGuard<'_, LockState> {
    rec.state.lock().unwrap_or_else(|e| e.into_inner())
}

/* Look up the record for `io_path`, creating it on first reference. */
pub(crate) fn lock_record(io_path: IoPath) -> Arc<DisplayLockRecord> {
    let mut map = registry().lock().unwrap_or_else(|e| e.into_inner());
    map.entry(io_path)
        .or_insert_with(|| {
            debug!("creating lock record for {io_path}");
            Arc::new(DisplayLockRecord {
                io_path,
                state: Mutex::new(LockState::default()),
                cond: Condvar::new(),
            })
        })
        .clone()
}

/* Acquire the display lock.
 *
 * Re-entry from the owning thread is refused with ALREADY_OPEN and does
 * not change lock depth.  With `wait` the caller blocks until the owner
 * releases; without it a held lock yields LOCKED immediately. */
pub(crate) fn lock_display(rec: &DisplayLockRecord, wait: bool) -> Result<(), ErrorInfo> {
    let me = thread::current().id();
    let mut st = lock_state(rec);

    if st.owner == Some(me) {
        return Err(ErrorInfo::from_ddc(
            DdcError::AlreadyOpen,
            "lock_display",
            format!("{} already locked by this thread", rec.io_path),
        ));
    }

    if st.owner.is_some() {
        if !wait {
            return Err(ErrorInfo::from_ddc(
                DdcError::Locked,
                "lock_display",
                format!("{} locked by another thread", rec.io_path),
            ));
        }
        while st.owner.is_some() {
            st = rec.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }

    st.owner = Some(me);
    st.linux_tid = gettid().as_raw();
    debug!("locked {} (tid {})", rec.io_path, st.linux_tid);
    Ok(())
}

/* Release the display lock.  Refused, and the lock left in place, when
 * the caller is not the recorded owner. */
pub(crate) fn unlock_display(rec: &DisplayLockRecord) -> Result<(), ErrorInfo> {
    let me = thread::current().id();
    let mut st = lock_state(rec);

    if st.owner != Some(me) {
        return Err(ErrorInfo::from_ddc(
            DdcError::Locked,
            "unlock_display",
            format!("{} not locked by this thread", rec.io_path),
        ));
    }

    st.owner = None;
    st.linux_tid = 0;
    debug!("unlocked {}", rec.io_path);
    rec.cond.notify_one();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn relock_by_same_thread_refused() {
        let rec = lock_record(IoPath::I2c { bus: 200 });
        lock_display(&rec, true).unwrap();
        let err = lock_display(&rec, false).unwrap_err();
        assert_eq!(err.status, DdcError::AlreadyOpen.status());
        /* The refusal must not have consumed the lock. */
        unlock_display(&rec).unwrap();
        lock_display(&rec, false).unwrap();
        unlock_display(&rec).unwrap();
    }

    #[test]
    fn contended_try_lock_fails_then_succeeds_after_release() {
        let rec = lock_record(IoPath::I2c { bus: 201 });
        lock_display(&rec, true).unwrap();

        let rec2 = lock_record(IoPath::I2c { bus: 201 });
        let handle = thread::spawn(move || {
            let err = lock_display(&rec2, false).unwrap_err();
            assert_eq!(err.status, DdcError::Locked.status());
        });
        handle.join().unwrap();

        unlock_display(&rec).unwrap();

        let rec3 = lock_record(IoPath::I2c { bus: 201 });
        let handle = thread::spawn(move || {
            lock_display(&rec3, false).unwrap();
            unlock_display(&rec3).unwrap();
        });
        handle.join().unwrap();
    }

    #[test]
    fn waiting_lock_blocks_until_release() {
        let rec = lock_record(IoPath::I2c { bus: 202 });
        lock_display(&rec, true).unwrap();

        let (tx, rx) = mpsc::channel();
        let rec2 = lock_record(IoPath::I2c { bus: 202 });
        let waiter = thread::spawn(move || {
            lock_display(&rec2, true).unwrap();
            tx.send(()).unwrap();
            unlock_display(&rec2).unwrap();
        });

        /* The waiter cannot acquire while we hold the lock. */
        assert!(rx.recv_timeout(std::time::Duration::from_millis(50)).is_err());
        unlock_display(&rec).unwrap();
        assert!(rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok());
        waiter.join().unwrap();
    }

    #[test]
    fn unlock_by_non_owner_refused() {
        let rec = lock_record(IoPath::I2c { bus: 203 });
        lock_display(&rec, true).unwrap();

        let rec2 = lock_record(IoPath::I2c { bus: 203 });
        let handle = thread::spawn(move || {
            let err = unlock_display(&rec2).unwrap_err();
            assert_eq!(err.status, DdcError::Locked.status());
        });
        handle.join().unwrap();

        /* Still ours to release. */
        unlock_display(&rec).unwrap();
    }

    #[test]
    fn records_are_shared_per_io_path() {
        let a = lock_record(IoPath::I2c { bus: 204 });
        let b = lock_record(IoPath::I2c { bus: 204 });
        assert!(Arc::ptr_eq(&a, &b));
        let c = lock_record(IoPath::Usb { hiddev: 204 });
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
