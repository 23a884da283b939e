/* Display registry: the process-global set of known displays and the
 * reconciliation that keeps it matched to the connected hardware.
 *
 * Detection walks the i2c-dev buses udev knows about, filters the ones
 * that cannot be display links, probes for an EDID, and appends a dref
 * per responding monitor.  Reconciliation diffs a fresh snapshot against
 * the live set and emits connect/disconnect events for the differences.
 * Drefs are append-only; removal just sets the terminal flag. */

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::display::{
    DISPNO_PHANTOM, DisplayIdentifier, DisplayRef, DrefFlags, IoPath,
};
use crate::edid::{EdidReadOptions, ParsedEdid, read_edid};
use crate::events::{DisplayEventType, DisplayStatusEvent, emit_status_event};
use crate::i2c_io::BusIo;
use crate::packet::I2C_ADDR_DDC_CI;
use crate::status::{DdcError, ErrorInfo};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusFlags: u8 {
        const PROBED          = 1 << 0;
        const X37_PRESENT     = 1 << 1;
        const X50_PRESENT     = 1 << 2;
        const LAPTOP_PANEL    = 1 << 3;
        const SKIP_DDC_CHECKS = 1 << 4;
    }
}

/* Per-/dev/i2c-N record.  Owns the raw EDID; drefs reference it by
 * index, and indices stay stable because the table is append-only. */
#[allow(dead_code)]
pub(crate) struct BusInfo {
    pub bus_no: u8,
    pub flags: BusFlags,
    pub drm_connector: Option<String>,
    pub edid_raw: Option<Vec<u8>>,
    pub edid: Option<ParsedEdid>,
    pub open_error: Option<String>,
}

#[derive(Default)]
struct Registry {
    drefs: Vec<Arc<DisplayRef>>,
    buses: Vec<BusInfo>,
    next_dispno: i32,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY
        .get_or_init(|| Mutex::new(Registry { next_dispno: 1, ..Default::default() }))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn bus_flags(index: usize) -> Option<BusFlags> {
    registry().buses.get(index).map(|b| b.flags)
}

pub fn all_display_refs() -> Vec<Arc<DisplayRef>> {
    registry().drefs.clone()
}

/* The most-recently-created live dref for an io path.  With
 * `ignore_invalid` false, removed drefs are eligible too. */
pub fn dref_by_io_path(io_path: IoPath, ignore_invalid: bool) -> Option<Arc<DisplayRef>> {
    registry()
        .drefs
        .iter()
        .filter(|d| d.io_path == io_path)
        .filter(|d| !ignore_invalid || !d.is_removed())
        .max_by_key(|d| d.created_ns)
        .cloned()
}

/* One connected display as seen by a detection pass. */
#[derive(Debug, Clone)]
pub(crate) struct BusSnapshot {
    pub bus_no: u8,
    pub connector: Option<String>,
    pub edid: Option<ParsedEdid>,
    pub flags: BusFlags,
    pub phantom: bool,
}

/* Fold a snapshot into the registry.  New buses gain a dref and emit
 * Connected; live drefs whose bus vanished get the terminal flag and
 * emit Disconnected. */
pub(crate) fn reconcile(snapshot: &[BusSnapshot]) {
    recover_duplicate_drefs();

    let live: Vec<Arc<DisplayRef>> = all_display_refs()
        .into_iter()
        .filter(|d| !d.is_removed() && matches!(d.io_path, IoPath::I2c { .. }))
        .collect();

    for snap in snapshot {
        let io_path = IoPath::I2c { bus: snap.bus_no };
        if !live.iter().any(|d| d.io_path == io_path) {
            let dref = add_dref_from_snapshot(snap);
            info!("display connected: {} (display {})", io_path, dref.dispno());
            emit_status_event(DisplayStatusEvent::new(
                DisplayEventType::Connected,
                snap.connector.as_deref().unwrap_or(""),
                Some(io_path),
                Some(dref),
            ));
        }
    }

    for dref in &live {
        let still_present = snapshot.iter().any(|s| IoPath::I2c { bus: s.bus_no } == dref.io_path);
        if !still_present {
            info!("display disconnected: {}", dref.io_path);
            let connector = dref.drm_connector().unwrap_or_default();
            dref.mark_removed();
            emit_status_event(DisplayStatusEvent::new(
                DisplayEventType::Disconnected,
                &connector,
                Some(dref.io_path),
                Some(dref.clone()),
            ));
        }
    }
}

/* Multiple live drefs for one io path are an anomaly; keep the newest. */
fn recover_duplicate_drefs() {
    let reg = registry();
    let mut by_path: std::collections::HashMap<IoPath, Vec<Arc<DisplayRef>>> =
        std::collections::HashMap::new();
    for dref in reg.drefs.iter().filter(|d| !d.is_removed()) {
        by_path.entry(dref.io_path).or_default().push(dref.clone());
    }
    drop(reg);

    for (io_path, mut drefs) in by_path {
        if drefs.len() > 1 {
            warn!("{} has {} live drefs, keeping the newest", io_path, drefs.len());
            drefs.sort_by_key(|d| d.created_ns);
            for stale in &drefs[..drefs.len() - 1] {
                stale.mark_removed();
            }
        }
    }
}

fn add_dref_from_snapshot(snap: &BusSnapshot) -> Arc<DisplayRef> {
    let mut reg = registry();

    let dispno = if snap.phantom {
        DISPNO_PHANTOM
    } else {
        let n = reg.next_dispno;
        reg.next_dispno += 1;
        n
    };

    let dref = DisplayRef::new(IoPath::I2c { bus: snap.bus_no }, dispno);
    let bus_index = reg.buses.len();
    reg.buses.push(BusInfo {
        bus_no: snap.bus_no,
        flags: snap.flags | BusFlags::PROBED,
        drm_connector: snap.connector.clone(),
        edid_raw: snap.edid.as_ref().map(|e| e.raw.clone()),
        edid: snap.edid.clone(),
        open_error: None,
    });
    dref.set_bus_index(bus_index);
    dref.set_drm_connector(snap.connector.clone());
    if let Some(edid) = &snap.edid {
        dref.set_edid(edid.clone());
    }
    reg.drefs.push(dref.clone());
    dref
}

/* Resolve user-supplied selection criteria to a dref. */
pub fn resolve_display_identifier(
    identifier: &DisplayIdentifier,
) -> Result<Arc<DisplayRef>, ErrorInfo> {
    let not_found = |detail: String| {
        ErrorInfo::from_ddc(DdcError::InvalidDisplay, "resolve_display_identifier", detail)
    };

    match identifier {
        DisplayIdentifier::DispNo(n) => all_display_refs()
            .into_iter()
            .find(|d| d.dispno() == *n)
            .ok_or_else(|| not_found(format!("no display number {n}"))),
        DisplayIdentifier::BusNo(bus) => {
            if let Some(dref) = dref_by_io_path(IoPath::I2c { bus: *bus }, true) {
                return Ok(dref);
            }
            /* An explicit bus number is honored even when detection has
             * not seen the bus; the dref lives outside the registry. */
            debug!("bus {bus} not in registry, creating a transient dref");
            let dref = DisplayRef::new(IoPath::I2c { bus: *bus }, crate::display::DISPNO_INVALID);
            dref.update_flags(|f| f.insert(DrefFlags::TRANSIENT));
            Ok(dref)
        }
        DisplayIdentifier::Edid(bytes) => all_display_refs()
            .into_iter()
            .find(|d| {
                !d.is_removed() && d.edid().map(|e| e.raw.as_slice() == &bytes[..]).unwrap_or(false)
            })
            .ok_or_else(|| not_found("no display with matching EDID".to_string())),
        DisplayIdentifier::MfgModelSn { mfg, model, serial } => {
            if mfg.is_none() && model.is_none() && serial.is_none() {
                return Err(ErrorInfo::from_ddc(
                    DdcError::Arg,
                    "resolve_display_identifier",
                    "at least one of mfg, model, serial is required",
                ));
            }
            all_display_refs()
                .into_iter()
                .find(|d| {
                    if d.is_removed() {
                        return false;
                    }
                    let Some(edid) = d.edid() else { return false };
                    mfg.as_deref().is_none_or(|m| m.eq_ignore_ascii_case(&edid.mfg_id))
                        && model.as_deref().is_none_or(|m| m == edid.model_name)
                        && serial.as_deref().is_none_or(|s| s == edid.serial_ascii)
                })
                .ok_or_else(|| not_found("no display matches mfg/model/serial".to_string()))
        }
        DisplayIdentifier::UsbBusDev { bus, device } => all_display_refs()
            .into_iter()
            .find(|d| matches!(d.io_path, IoPath::Usb { hiddev } if hiddev == *device))
            .ok_or_else(|| not_found(format!("no USB display at {bus}:{device}"))),
        DisplayIdentifier::ConnectorName(name) => all_display_refs()
            .into_iter()
            .find(|d| !d.is_removed() && d.drm_connector().as_deref() == Some(name.as_str()))
            .ok_or_else(|| not_found(format!("no display on connector {name}"))),
    }
}

/* ---------------------------------------------------------------------- */
/* Hardware detection                                                     */
/* ---------------------------------------------------------------------- */

/* Sysfs device names that never carry display DDC. */
const IGNORABLE_BUS_NAME_PREFIXES: [&str; 5] = ["SMBus", "soc:i2cdsi", "smu", "mac-io", "u4"];

fn is_ignorable_bus_name(name: &str) -> bool {
    IGNORABLE_BUS_NAME_PREFIXES.iter().any(|p| name.starts_with(p))
}

/* Docking stations can expose a second i2c device for one monitor; the
 * dead twin reports disconnected+disabled in sysfs. */
fn is_phantom_bus(bus_no: u8) -> bool {
    let device = Path::new("/sys/bus/i2c/devices").join(format!("i2c-{bus_no}")).join("device");
    let read_trimmed = |name: &str| {
        std::fs::read_to_string(device.join(name)).map(|s| s.trim().to_string()).ok()
    };
    read_trimmed("status").as_deref() == Some("disconnected")
        && read_trimmed("enabled").as_deref() == Some("disabled")
}

/* Resolve the DRM connector that owns bus N by matching the ddc symlink
 * under /sys/class/drm. */
fn drm_connector_for_bus(bus_no: u8) -> Option<String> {
    let target = format!("i2c-{bus_no}");
    let entries = std::fs::read_dir("/sys/class/drm").ok()?;
    for entry in entries.flatten() {
        let ddc_link = entry.path().join("ddc");
        let Ok(resolved) = std::fs::read_link(&ddc_link) else { continue };
        if resolved.file_name().and_then(|n| n.to_str()) == Some(target.as_str()) {
            let name = entry.file_name().to_string_lossy().to_string();
            /* Strip the "cardN-" prefix. */
            return Some(name.split_once('-').map(|(_, rest)| rest.to_string()).unwrap_or(name));
        }
    }
    None
}

/* Enumerate candidate bus numbers through udev, the way hotplug events
 * will name them later. */
fn enumerate_i2c_buses() -> Vec<u8> {
    let mut buses = Vec::new();
    let Ok(mut enumerator) = udev::Enumerator::new() else {
        warn!("udev enumerator unavailable");
        return buses;
    };
    if enumerator.match_subsystem("i2c-dev").is_err() {
        return buses;
    }
    let Ok(devices) = enumerator.scan_devices() else {
        return buses;
    };
    for device in devices {
        let sysname = device.sysname().to_string_lossy().to_string();
        let Some(bus_no) = sysname.strip_prefix("i2c-").and_then(|n| n.parse::<u8>().ok())
        else {
            continue;
        };
        if let Some(name) = device.attribute_value("name") {
            let name = name.to_string_lossy();
            if is_ignorable_bus_name(&name) {
                debug!("skipping {} ({})", sysname, name);
                continue;
            }
        }
        buses.push(bus_no);
    }
    buses.sort_unstable();
    buses
}

/* Probe one bus: EDID presence at 0x50 and a DDC responder at 0x37. */
fn probe_bus(bus_no: u8) -> Option<BusSnapshot> {
    let mut bus = match BusIo::open(bus_no) {
        Ok(bus) => bus,
        Err(errno) => {
            debug!("cannot open /dev/i2c-{bus_no}: {errno}");
            return None;
        }
    };

    let connector = drm_connector_for_bus(bus_no);
    let mut flags = BusFlags::empty();
    if connector.as_deref().map(|c| c.contains("eDP") || c.contains("LVDS")).unwrap_or(false) {
        flags.insert(BusFlags::LAPTOP_PANEL);
    }

    let opts = EdidReadOptions { read_size: crate::edid::edid_read_size(), ..Default::default() };
    let edid = match read_edid(&mut bus, opts) {
        Ok(edid) => {
            flags.insert(BusFlags::X50_PRESENT);
            Some(edid)
        }
        Err(e) => {
            debug!("/dev/i2c-{bus_no}: no EDID ({e})");
            None
        }
    };
    edid.as_ref()?;

    let mut one = [0u8; 1];
    if bus.read_bytes(I2C_ADDR_DDC_CI, &mut one).is_ok() {
        flags.insert(BusFlags::X37_PRESENT);
    }

    Some(BusSnapshot {
        bus_no,
        connector,
        edid,
        flags,
        phantom: is_phantom_bus(bus_no),
    })
}

fn scan_hardware() -> Vec<BusSnapshot> {
    enumerate_i2c_buses().into_iter().filter_map(probe_bus).collect()
}

/* Full detection pass.  Events raised while the pass runs are queued and
 * flushed together at the end.  Returns the number of live displays. */
pub fn detect_displays() -> usize {
    crate::events::begin_deferred_emits();
    let snapshot = scan_hardware();
    reconcile(&snapshot);
    crate::events::end_deferred_emits();

    let count = all_display_refs().iter().filter(|d| !d.is_removed()).count();
    info!("detection complete: {count} displays");
    count
}

/* Re-scan and reconcile; the watch thread's reaction to a drm event. */
pub fn recheck_displays() {
    let snapshot = scan_hardware();
    reconcile(&snapshot);
}
