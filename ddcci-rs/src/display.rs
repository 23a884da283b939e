/* Display lifecycle: the three representations of a monitor.
 *
 * An identifier is the caller's ephemeral selection criteria; a display
 * reference (dref) is the persistent record of a detected device; a
 * display handle is an open dref with a live fd.  The per-display lock
 * registry guarantees at most one handle per dref process-wide. */

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use nix::errno::Errno;
use tracing::{debug, warn};

use crate::display_lock::{self, DisplayLockRecord};
use crate::dynamic_features::DynamicFeaturesRec;
use crate::edid::ParsedEdid;
use crate::i2c_io::BusIo;
use crate::sleep::{DynamicSleep, SleepEvent, tuned_sleep};
use crate::status::{DdcError, ErrorInfo, errno_status};

/* Where a display's DDC traffic goes.  The unique key for live drefs. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoPath {
    I2c { bus: u8 },
    Usb { hiddev: u16 },
}

impl fmt::Display for IoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoPath::I2c { bus } => write!(f, "/dev/i2c-{bus}"),
            IoPath::Usb { hiddev } => write!(f, "/dev/usb/hiddev{hiddev}"),
        }
    }
}

/* User-supplied selection criteria, freed once resolution completes. */
#[derive(Debug, Clone)]
pub enum DisplayIdentifier {
    /* 1-based index assigned by detection. */
    DispNo(i32),
    BusNo(u8),
    Edid(Box<[u8; 128]>),
    /* Any subset, at least one present. */
    MfgModelSn {
        mfg: Option<String>,
        model: Option<String>,
        serial: Option<String>,
    },
    UsbBusDev { bus: u16, device: u16 },
    ConnectorName(String),
}

/* Display-number sentinels. */
pub const DISPNO_INVALID: i32 = -1;
pub const DISPNO_PHANTOM: i32 = -2;
pub const DISPNO_REMOVED: i32 = -3;
pub const DISPNO_BUSY: i32 = -4;
pub const DISPNO_DDC_DISABLED: i32 = -5;

bitflags! {
    /* Dref state bits.  Exactly one of the four unsupported-policy bits
     * is set once UNSUPPORTED_CHECKED is; REMOVED is terminal. */
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DrefFlags: u16 {
        const DDC_COMMUNICATION_CHECKED          = 1 << 0;
        const DDC_COMMUNICATION_WORKING          = 1 << 1;
        const DDC_IS_MONITOR_CHECKED             = 1 << 2;
        const DDC_IS_MONITOR                     = 1 << 3;
        const UNSUPPORTED_CHECKED                = 1 << 4;
        const USES_NULL_RESPONSE_FOR_UNSUPPORTED = 1 << 5;
        const USES_ZERO_BYTES_FOR_UNSUPPORTED    = 1 << 6;
        const USES_DDC_FLAG_FOR_UNSUPPORTED      = 1 << 7;
        const DOES_NOT_INDICATE_UNSUPPORTED      = 1 << 8;
        const DYNAMIC_FEATURES_CHECKED           = 1 << 9;
        const TRANSIENT                          = 1 << 10;
        const OPEN                               = 1 << 11;
        const DDC_BUSY                           = 1 << 12;
        const REMOVED                            = 1 << 13;
        const DDC_DISABLED                       = 1 << 14;
        const DPMS_OFF                           = 1 << 15;
    }
}

impl DrefFlags {
    pub(crate) const UNSUPPORTED_POLICY_BITS: DrefFlags = DrefFlags::USES_NULL_RESPONSE_FOR_UNSUPPORTED
        .union(DrefFlags::USES_ZERO_BYTES_FOR_UNSUPPORTED)
        .union(DrefFlags::USES_DDC_FLAG_FOR_UNSUPPORTED)
        .union(DrefFlags::DOES_NOT_INDICATE_UNSUPPORTED);
}

/* How this monitor signals "feature not implemented". */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedPolicy {
    NullResponse,
    ZeroBytes,
    DdcFlag,
    DoesNotIndicate,
}

/* MCCS version advertised by the monitor, cached on the dref. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MccsVersion {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for MccsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MccsVersionState {
    #[default]
    Unqueried,
    Unknown,
    Known(MccsVersion),
}

#[derive(Default)]
pub(crate) struct DrefState {
    pub flags: DrefFlags,
    pub bus_index: Option<usize>,
    pub edid: Option<ParsedEdid>,
    pub mccs_version: MccsVersionState,
    pub dynamic_features: Option<Arc<DynamicFeaturesRec>>,
    pub comm_error_summary: Option<String>,
    pub drm_connector: Option<String>,
    /* Set for monitors known to answer every unsupported feature with
     * EIO; never inferred by the probe. */
    pub eio_means_unsupported: bool,
}

impl Default for DrefFlags {
    fn default() -> Self {
        DrefFlags::empty()
    }
}

/* Persistent record of a detected display. */
pub struct DisplayRef {
    pub io_path: IoPath,
    dispno: AtomicI32,
    pub created_ns: u64,
    state: Mutex<DrefState>,
}

impl fmt::Debug for DisplayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayRef")
            .field("io_path", &self.io_path)
            .field("dispno", &self.dispno())
            .field("flags", &self.flags())
            .finish()
    }
}

impl DisplayRef {
    pub(crate) fn new(io_path: IoPath, dispno: i32) -> Arc<Self> {
        Arc::new(DisplayRef {
            io_path,
            dispno: AtomicI32::new(dispno),
            created_ns: now_ns(),
            state: Mutex::new(DrefState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, DrefState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn dispno(&self) -> i32 {
        self.dispno.load(Ordering::Relaxed)
    }

    pub(crate) fn set_dispno(&self, dispno: i32) {
        self.dispno.store(dispno, Ordering::Relaxed);
    }

    pub fn flags(&self) -> DrefFlags {
        self.state().flags
    }

    /* Mutate the flags word.  Once REMOVED is set the dref is frozen:
     * only the display number may change. */
    pub(crate) fn update_flags(&self, f: impl FnOnce(&mut DrefFlags)) {
        let mut st = self.state();
        if st.flags.contains(DrefFlags::REMOVED) {
            warn!("ignoring flag update on removed dref {}", self.io_path);
            return;
        }
        f(&mut st.flags);
    }

    pub(crate) fn mark_removed(&self) {
        let mut st = self.state();
        st.flags.insert(DrefFlags::REMOVED);
        drop(st);
        self.set_dispno(DISPNO_REMOVED);
        debug!("dref {} marked removed", self.io_path);
    }

    pub fn is_removed(&self) -> bool {
        self.flags().contains(DrefFlags::REMOVED)
    }

    pub fn unsupported_policy(&self) -> Option<UnsupportedPolicy> {
        let flags = self.flags();
        if flags.contains(DrefFlags::USES_NULL_RESPONSE_FOR_UNSUPPORTED) {
            Some(UnsupportedPolicy::NullResponse)
        } else if flags.contains(DrefFlags::USES_ZERO_BYTES_FOR_UNSUPPORTED) {
            Some(UnsupportedPolicy::ZeroBytes)
        } else if flags.contains(DrefFlags::USES_DDC_FLAG_FOR_UNSUPPORTED) {
            Some(UnsupportedPolicy::DdcFlag)
        } else if flags.contains(DrefFlags::DOES_NOT_INDICATE_UNSUPPORTED) {
            Some(UnsupportedPolicy::DoesNotIndicate)
        } else {
            None
        }
    }

    pub fn edid(&self) -> Option<ParsedEdid> {
        self.state().edid.clone()
    }

    pub(crate) fn set_edid(&self, edid: ParsedEdid) {
        let mut st = self.state();
        if st.flags.contains(DrefFlags::REMOVED) {
            return;
        }
        st.edid = Some(edid);
    }

    pub(crate) fn bus_index(&self) -> Option<usize> {
        self.state().bus_index
    }

    pub(crate) fn set_bus_index(&self, index: usize) {
        let mut st = self.state();
        if st.flags.contains(DrefFlags::REMOVED) {
            return;
        }
        st.bus_index = Some(index);
    }

    pub fn mccs_version(&self) -> MccsVersionState {
        self.state().mccs_version
    }

    pub(crate) fn set_mccs_version(&self, version: MccsVersionState) {
        let mut st = self.state();
        if st.flags.contains(DrefFlags::REMOVED) {
            return;
        }
        st.mccs_version = version;
    }

    pub fn dynamic_features(&self) -> Option<Arc<DynamicFeaturesRec>> {
        self.state().dynamic_features.clone()
    }

    pub(crate) fn set_dynamic_features(&self, rec: Option<Arc<DynamicFeaturesRec>>) {
        let mut st = self.state();
        if st.flags.contains(DrefFlags::REMOVED) {
            return;
        }
        st.dynamic_features = rec;
    }

    pub fn comm_error_summary(&self) -> Option<String> {
        self.state().comm_error_summary.clone()
    }

    pub(crate) fn set_comm_error_summary(&self, summary: String) {
        let mut st = self.state();
        if st.flags.contains(DrefFlags::REMOVED) {
            return;
        }
        st.comm_error_summary = Some(summary);
    }

    pub fn drm_connector(&self) -> Option<String> {
        self.state().drm_connector.clone()
    }

    pub(crate) fn set_drm_connector(&self, connector: Option<String>) {
        let mut st = self.state();
        if st.flags.contains(DrefFlags::REMOVED) {
            return;
        }
        st.drm_connector = connector;
    }

    pub fn eio_means_unsupported(&self) -> bool {
        self.state().eio_means_unsupported
    }

    pub fn set_eio_means_unsupported(&self, value: bool) {
        let mut st = self.state();
        if st.flags.contains(DrefFlags::REMOVED) {
            return;
        }
        st.eio_means_unsupported = value;
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/* Bypass the initial-checks probe entirely and assume the DDC-flag
 * unsupported policy. */
static SKIP_DDC_CHECKS: AtomicBool = AtomicBool::new(false);

pub fn set_skip_ddc_checks(skip: bool) {
    SKIP_DDC_CHECKS.store(skip, Ordering::Relaxed);
}

pub fn skip_ddc_checks() -> bool {
    SKIP_DDC_CHECKS.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /* Block for a lock held by another thread instead of failing with
     * LOCKED. */
    pub wait: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions { wait: true }
    }
}

/* An open display: dref plus the kernel fd. */
pub struct DisplayHandle {
    pub dref: Arc<DisplayRef>,
    bus: Option<BusIo>,
    lock_rec: Arc<DisplayLockRecord>,
    pub(crate) dynamic_sleep: DynamicSleep,
    /* Set by the initial-checks probe while it deliberately queries
     * nonexistent features, to silence the retry engine's log line. */
    pub(crate) testing_unsupported: bool,
}

impl DisplayHandle {
    pub(crate) fn bus_mut(&mut self) -> Result<&mut BusIo, ErrorInfo> {
        self.bus.as_mut().ok_or_else(|| {
            ErrorInfo::from_ddc(DdcError::InvalidOperation, "bus_mut", "handle already closed")
        })
    }

    pub fn is_open(&self) -> bool {
        self.bus.is_some()
    }

    /* Close the handle: clear OPEN, drop the fd, release the lock.
     * Closing twice is idempotent and succeeds. */
    pub fn close(&mut self) -> Result<(), ErrorInfo> {
        if self.bus.is_none() {
            return Ok(());
        }
        self.dref.update_flags(|f| f.remove(DrefFlags::OPEN));
        self.bus = None;
        if let Err(e) = display_lock::unlock_display(&self.lock_rec) {
            warn!("unlock on close failed: {e}");
        }
        debug!("closed {}", self.dref.io_path);
        Ok(())
    }
}

impl Drop for DisplayHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for DisplayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayHandle")
            .field("io_path", &self.dref.io_path)
            .field("open", &self.is_open())
            .finish()
    }
}

/* Open a display reference.
 *
 * Acquires the per-display lock, opens the device node, marks the dref
 * OPEN, performs the post-open settle sleep, and on the first open runs
 * the initial-checks probe unless globally disabled.  The lock is
 * released on every error path. */
pub fn open_display(
    dref: &Arc<DisplayRef>,
    options: OpenOptions,
) -> Result<DisplayHandle, ErrorInfo> {
    let lock_rec = display_lock::lock_record(dref.io_path);
    display_lock::lock_display(&lock_rec, options.wait)?;

    match open_locked(dref, lock_rec.clone()) {
        Ok(mut dh) => {
            if skip_ddc_checks() {
                /* Probe bypassed: assume the conventional policy so the
                 * retry engine still has an unsupported answer. */
                if !dref.flags().contains(DrefFlags::UNSUPPORTED_CHECKED) {
                    dref.update_flags(|f| {
                        f.insert(
                            DrefFlags::UNSUPPORTED_CHECKED
                                | DrefFlags::USES_DDC_FLAG_FOR_UNSUPPORTED,
                        )
                    });
                }
            } else if !dref.flags().contains(DrefFlags::DDC_COMMUNICATION_CHECKED) {
                crate::initial_checks::perform_initial_checks(&mut dh);
            }
            Ok(dh)
        }
        Err(e) => {
            if let Err(unlock_err) = display_lock::unlock_display(&lock_rec) {
                warn!("unlock after failed open: {unlock_err}");
            }
            Err(ErrorInfo::new_chained(e, "open_display"))
        }
    }
}

fn open_locked(
    dref: &Arc<DisplayRef>,
    lock_rec: Arc<DisplayLockRecord>,
) -> Result<DisplayHandle, ErrorInfo> {
    if dref.is_removed() {
        return Err(ErrorInfo::from_ddc(
            DdcError::InvalidDisplay,
            "open_locked",
            format!("{} has been removed", dref.io_path),
        ));
    }

    let bus = match dref.io_path {
        IoPath::I2c { bus } => BusIo::open(bus).map_err(|errno| match errno {
            Errno::ENOENT => ErrorInfo::from_ddc(
                DdcError::InvalidDisplay,
                "open_locked",
                format!("{} does not exist", dref.io_path),
            ),
            Errno::EBUSY => {
                dref.update_flags(|f| f.insert(DrefFlags::DDC_BUSY));
                dref.set_dispno(DISPNO_BUSY);
                ErrorInfo::from_errno(errno, "open_locked", format!("{} busy", dref.io_path))
            }
            other => ErrorInfo::new(
                errno_status(other),
                "open_locked",
                format!("open {} failed", dref.io_path),
            ),
        })?,
        IoPath::Usb { .. } => {
            return Err(ErrorInfo::from_ddc(
                DdcError::Unimplemented,
                "open_locked",
                "USB-HID transport is not implemented",
            ));
        }
    };

    dref.update_flags(|f| f.insert(DrefFlags::OPEN));
    tuned_sleep(SleepEvent::PostOpen, None);

    Ok(DisplayHandle {
        dref: dref.clone(),
        bus: Some(bus),
        lock_rec,
        dynamic_sleep: DynamicSleep::new(),
        testing_unsupported: false,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::mock_bus::MockBus;

    #[test]
    fn io_path_equality_and_display() {
        assert_eq!(IoPath::I2c { bus: 4 }, IoPath::I2c { bus: 4 });
        assert_ne!(IoPath::I2c { bus: 4 }, IoPath::I2c { bus: 5 });
        assert_ne!(IoPath::I2c { bus: 4 }, IoPath::Usb { hiddev: 4 });
        assert_eq!(IoPath::I2c { bus: 4 }.to_string(), "/dev/i2c-4");
        assert_eq!(IoPath::Usb { hiddev: 2 }.to_string(), "/dev/usb/hiddev2");
    }

    #[test]
    fn removed_dref_is_frozen_except_dispno() {
        let dref = mock_dref(210);
        dref.update_flags(|f| f.insert(DrefFlags::DDC_COMMUNICATION_CHECKED));
        dref.mark_removed();
        assert_eq!(dref.dispno(), DISPNO_REMOVED);

        dref.update_flags(|f| f.insert(DrefFlags::DPMS_OFF));
        assert!(!dref.flags().contains(DrefFlags::DPMS_OFF));
        dref.set_comm_error_summary("nope".to_string());
        assert_eq!(dref.comm_error_summary(), None);

        /* The display number stays mutable. */
        dref.set_dispno(7);
        assert_eq!(dref.dispno(), 7);
    }

    #[test]
    fn unsupported_policy_from_flags() {
        let dref = mock_dref(211);
        assert_eq!(dref.unsupported_policy(), None);
        dref.update_flags(|f| {
            f.insert(DrefFlags::UNSUPPORTED_CHECKED | DrefFlags::USES_ZERO_BYTES_FOR_UNSUPPORTED)
        });
        assert_eq!(dref.unsupported_policy(), Some(UnsupportedPolicy::ZeroBytes));
    }

    #[test]
    fn close_is_idempotent_and_releases_the_lock() {
        let dref = mock_dref(212);
        let mut dh = open_mock_display(&dref, MockBus::new(212), true).unwrap();
        assert!(dref.flags().contains(DrefFlags::OPEN));

        dh.close().unwrap();
        assert!(!dref.flags().contains(DrefFlags::OPEN));
        dh.close().unwrap();

        /* Lock must be free again. */
        let dh2 = open_mock_display(&dref, MockBus::new(212), false).unwrap();
        drop(dh2);
    }

    #[test]
    fn second_open_same_thread_is_already_open() {
        let dref = mock_dref(213);
        let _dh = open_mock_display(&dref, MockBus::new(213), true).unwrap();
        let err = open_mock_display(&dref, MockBus::new(213), false).unwrap_err();
        assert_eq!(err.status, DdcError::AlreadyOpen.status());
    }

    #[test]
    fn lock_contention_across_threads() {
        /* Thread A holds the open; B's no-wait open fails LOCKED; after A
         * closes, C succeeds. */
        let dref = mock_dref(214);
        let dh = open_mock_display(&dref, MockBus::new(214), true).unwrap();

        let dref_b = dref.clone();
        std::thread::spawn(move || {
            let err = open_mock_display(&dref_b, MockBus::new(214), false).unwrap_err();
            assert_eq!(err.status, DdcError::Locked.status());
        })
        .join()
        .unwrap();

        drop(dh);

        let dref_c = dref.clone();
        std::thread::spawn(move || {
            let dh = open_mock_display(&dref_c, MockBus::new(214), false).unwrap();
            drop(dh);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn open_removed_dref_fails() {
        let dref = mock_dref(215);
        dref.mark_removed();
        let err = open_display(&dref, OpenOptions::default()).unwrap_err();
        assert_eq!(err.status, DdcError::InvalidDisplay.status());
        /* And the lock was released on the error path. */
        let rec = display_lock::lock_record(dref.io_path);
        display_lock::lock_display(&rec, false).unwrap();
        display_lock::unlock_display(&rec).unwrap();
    }
}
