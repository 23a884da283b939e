/* Display status event dispatch.
 *
 * The reconciler reports connection and DPMS changes here; registered
 * client callbacks each run on their own short-lived thread so a slow
 * callback cannot stall hotplug processing.  During batch detection the
 * emit gate queues events and flushes them afterwards in order. */

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::display::{DisplayRef, IoPath};

pub const CONNECTOR_NAME_MAX: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEventType {
    Connected,
    Disconnected,
    DpmsAwake,
    DpmsAsleep,
    DdcEnabled,
}

#[derive(Debug, Clone)]
pub struct DisplayStatusEvent {
    pub timestamp_ns: u64,
    pub event_type: DisplayEventType,
    pub connector_name: String,
    pub io_path: Option<IoPath>,
    pub dref: Option<Arc<DisplayRef>>,
}

impl DisplayStatusEvent {
    pub fn new(
        event_type: DisplayEventType,
        connector_name: &str,
        io_path: Option<IoPath>,
        dref: Option<Arc<DisplayRef>>,
    ) -> Self {
        let mut connector_name = connector_name.to_string();
        connector_name.truncate(CONNECTOR_NAME_MAX);
        DisplayStatusEvent {
            timestamp_ns: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
            event_type,
            connector_name,
            io_path,
            dref,
        }
    }
}

pub type StatusEventCallback = Arc<dyn Fn(DisplayStatusEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u32);

/* Copy-on-write callback list: emitters iterate a snapshot while
 * registration swaps in a new vector. */
struct CallbackRegistry {
    callbacks: Arc<Vec<(u32, StatusEventCallback)>>,
}

static CALLBACKS: OnceLock<Mutex<CallbackRegistry>> = OnceLock::new();
static NEXT_CALLBACK_ID: AtomicU32 = AtomicU32::new(1);

fn callback_registry() -> &'static Mutex<CallbackRegistry> {
    CALLBACKS.get_or_init(|| Mutex::new(CallbackRegistry { callbacks: Arc::new(Vec::new()) }))
}

pub fn register_status_callback(callback: StatusEventCallback) -> CallbackId {
    let id = NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed);
    let mut reg = callback_registry().lock().unwrap_or_else(|e| e.into_inner());
    let mut list: Vec<_> = reg.callbacks.as_ref().clone();
    list.push((id, callback));
    reg.callbacks = Arc::new(list);
    debug!("registered status callback {id}");
    CallbackId(id)
}

pub fn unregister_status_callback(id: CallbackId) -> bool {
    let mut reg = callback_registry().lock().unwrap_or_else(|e| e.into_inner());
    let before = reg.callbacks.len();
    let list: Vec<_> =
        reg.callbacks.iter().filter(|(cid, _)| *cid != id.0).cloned().collect();
    reg.callbacks = Arc::new(list);
    reg.callbacks.len() != before
}

fn callback_snapshot() -> Arc<Vec<(u32, StatusEventCallback)>> {
    callback_registry().lock().unwrap_or_else(|e| e.into_inner()).callbacks.clone()
}

/* Emit gate: immediate dispatch normally, queued during batch detection. */
enum EmitMode {
    Immediate,
    Deferred(Vec<DisplayStatusEvent>),
}

static EMIT_MODE: OnceLock<Mutex<EmitMode>> = OnceLock::new();

fn emit_mode() -> &'static Mutex<EmitMode> {
    EMIT_MODE.get_or_init(|| Mutex::new(EmitMode::Immediate))
}

pub(crate) fn begin_deferred_emits() {
    let mut mode = emit_mode().lock().unwrap_or_else(|e| e.into_inner());
    if matches!(*mode, EmitMode::Immediate) {
        *mode = EmitMode::Deferred(Vec::new());
    }
}

pub(crate) fn end_deferred_emits() {
    let queued = {
        let mut mode = emit_mode().lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *mode, EmitMode::Immediate) {
            EmitMode::Deferred(events) => events,
            EmitMode::Immediate => Vec::new(),
        }
    };
    for event in queued {
        dispatch(event);
    }
}

pub(crate) fn emit_status_event(event: DisplayStatusEvent) {
    {
        let mut mode = emit_mode().lock().unwrap_or_else(|e| e.into_inner());
        if let EmitMode::Deferred(ref mut queue) = *mode {
            debug!("queueing {:?} for {}", event.event_type, event.connector_name);
            queue.push(event);
            return;
        }
    }
    dispatch(event);
}

fn dispatch(event: DisplayStatusEvent) {
    let callbacks = callback_snapshot();
    debug!(
        "dispatching {:?} for '{}' to {} callbacks",
        event.event_type,
        event.connector_name,
        callbacks.len()
    );
    for (id, callback) in callbacks.iter() {
        let callback = callback.clone();
        let event = event.clone();
        let id = *id;
        std::thread::Builder::new()
            .name(format!("ddcci-event-cb{id}"))
            .spawn(move || callback(event))
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn callback_receives_event() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        /* The registry is process-global; ignore events other tests emit. */
        let id = register_status_callback(Arc::new(move |event: DisplayStatusEvent| {
            if event.connector_name == "EVT-OWN" {
                let _ = tx.lock().unwrap().send(event.event_type);
            }
        }));

        emit_status_event(DisplayStatusEvent::new(
            DisplayEventType::Connected,
            "EVT-OWN",
            Some(IoPath::I2c { bus: 60 }),
            None,
        ));

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DisplayEventType::Connected
        );
        assert!(unregister_status_callback(id));
        assert!(!unregister_status_callback(id));
    }

    #[test]
    fn slow_callback_does_not_stall_emit() {
        let id = register_status_callback(Arc::new(|_| {
            std::thread::sleep(Duration::from_millis(300));
        }));

        let start = Instant::now();
        emit_status_event(DisplayStatusEvent::new(
            DisplayEventType::DpmsAsleep,
            "HDMI-1",
            None,
            None,
        ));
        assert!(start.elapsed() < Duration::from_millis(200));

        unregister_status_callback(id);
    }

    #[test]
    fn deferred_events_flush_in_order() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        /* Only watch this test's own connectors; other tests share the
         * process-global registry. */
        let id = register_status_callback(Arc::new(move |event: DisplayStatusEvent| {
            if event.connector_name.starts_with("DEF-") {
                let _ = tx.lock().unwrap().send(event.connector_name.clone());
            }
        }));

        begin_deferred_emits();
        emit_status_event(DisplayStatusEvent::new(DisplayEventType::Connected, "DEF-A", None, None));
        emit_status_event(DisplayStatusEvent::new(DisplayEventType::Connected, "DEF-B", None, None));
        /* Nothing delivered while deferred. */
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        end_deferred_emits();
        let mut got = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        got.sort();
        assert_eq!(got, vec!["DEF-A".to_string(), "DEF-B".to_string()]);

        unregister_status_callback(id);
    }

    #[test]
    fn connector_name_truncated() {
        let long = "X".repeat(100);
        let event = DisplayStatusEvent::new(DisplayEventType::DdcEnabled, &long, None, None);
        assert_eq!(event.connector_name.len(), CONNECTOR_NAME_MAX);
    }
}
