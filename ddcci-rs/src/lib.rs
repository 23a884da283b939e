/* ddcci: DDC/CI monitor control over Linux i2c-dev.
 *
 * The stack, bottom up: packet codec, raw I2C strategies, tuned sleeps,
 * the retry engine, EDID retrieval, then the display lifecycle
 * (identifier -> reference -> handle) with its per-display lock
 * registry, the one-shot initial-checks probe, the high-level VCP
 * operations, per-monitor dynamic feature files, and the display
 * registry with hotplug reconciliation and status events. */

pub mod display;
pub mod display_lock;
pub mod dynamic_features;
pub mod edid;
pub mod events;
pub mod i2c_io;
pub mod initial_checks;
#[cfg(test)]
pub(crate) mod mock_bus;
pub mod packet;
pub mod registry;
pub mod retry;
pub mod sleep;
pub mod status;
pub mod udev_watch;
pub mod vcp;

use std::sync::Mutex;

use tracing::{debug, info};

pub use display::{
    DISPNO_BUSY, DISPNO_DDC_DISABLED, DISPNO_INVALID, DISPNO_PHANTOM, DISPNO_REMOVED,
    DisplayHandle, DisplayIdentifier, DisplayRef, DrefFlags, IoPath, MccsVersion,
    MccsVersionState, OpenOptions, UnsupportedPolicy, open_display, set_skip_ddc_checks,
};
pub use dynamic_features::{
    DynamicFeatureMetadata, DynamicFeaturesRec, FeatureFlags, canonicalize_hex,
    get_dynamic_feature_metadata,
};
pub use edid::{EdidReadOptions, ParsedEdid};
pub use events::{
    DisplayEventType, DisplayStatusEvent, StatusEventCallback, register_status_callback,
    unregister_status_callback,
};
pub use i2c_io::{I2cIoStrategy, set_i2c_io_strategy};
pub use packet::NonTableVcpResponse;
pub use registry::{all_display_refs, detect_displays, resolve_display_identifier};
pub use retry::{RetryClass, max_tries, set_max_tries};
pub use sleep::{set_dynamic_sleep_enabled, set_sleep_multiplier, sleep_multiplier};
pub use status::{DdcError, ErrorInfo, Status, status_desc, status_is_not_error, status_name};
pub use udev_watch::WatchMode;
pub use vcp::{
    get_capabilities_string, get_identification, get_mccs_version, get_verify_setvcp, get_vcp,
    save_current_settings, set_vcp, set_verify_setvcp, table_read, table_write,
};

/* Module startup options.  Everything else is tuned through the
 * individual setters, before or after init. */
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /* Start the display-watch thread in this mode. */
    pub watch_mode: Option<WatchMode>,
    /* Run a detection pass as part of init. */
    pub detect: bool,
}

struct ModuleState {
    initialized: bool,
    watch: Option<udev_watch::WatchHandle>,
}

static MODULE_STATE: Mutex<ModuleState> =
    Mutex::new(ModuleState { initialized: false, watch: None });

/* Initialize the library.  Steps run in a fixed order and each is
 * idempotent, so repeated calls only add what is missing (for example a
 * watch thread requested the second time around). */
pub fn init(options: InitOptions) -> Result<(), ErrorInfo> {
    let mut state = MODULE_STATE.lock().unwrap_or_else(|e| e.into_inner());

    if !state.initialized {
        debug!("initializing ddcci");
        /* Statistics first so later steps are counted from zero. */
        sleep::reset_sleep_stats();
        i2c_io::reset_io_stats();
        retry::reset_max_tries();
        /* Touch the registries so their storage exists before any
         * caller-visible operation can race their creation. */
        let _ = registry::all_display_refs();
        let _ = display_lock::lock_record(IoPath::I2c { bus: 255 });
        state.initialized = true;
    }

    if options.detect {
        registry::detect_displays();
    }

    if let Some(mode) = options.watch_mode {
        if state.watch.is_none() {
            state.watch = Some(udev_watch::start_watch_displays(mode)?);
        }
    }

    Ok(())
}

/* Tear down in reverse order.  The watch thread is joined with its
 * built-in timeout; registries persist for the life of the process. */
pub fn teardown() {
    let mut state = MODULE_STATE.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(watch) = state.watch.take() {
        if let Err(e) = udev_watch::stop_watch_displays(watch) {
            debug!("watch stop failed during teardown: {e}");
        }
    }
    if state.initialized {
        info!("ddcci teardown complete");
        state.initialized = false;
    }
}
