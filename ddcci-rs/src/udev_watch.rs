/* Display-watch thread: reacts to connector changes by re-running
 * detection and reconciliation.
 *
 * Udev mode listens on a monitor socket for `drm` subsystem events and
 * waits on its fd with poll(2), timing out every second to honor the
 * stop flag.  Poll mode rescans on a fixed cadence for systems without
 * usable udev events.  The udev crate's types hold raw pointers and are
 * not Send, so everything udev happens inside the watch thread. */

use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::registry::recheck_displays;
use crate::status::{DdcError, ErrorInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Poll,
    Udev,
    Xevent,
    Dynamic,
}

/* Poll-mode rescan cadence, broken into short naps so stop stays
 * responsive. */
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_NAP: Duration = Duration::from_millis(100);

/* How long stop waits for the thread to acknowledge before giving up. */
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(4);

pub struct WatchHandle {
    stop: Arc<AtomicBool>,
    done_rx: mpsc::Receiver<()>,
    join: Option<JoinHandle<()>>,
}

/* Spawn the watch thread.  Dynamic picks udev when a monitor socket can
 * be created; Xevent has no backing here and degrades to polling. */
pub fn start_watch_displays(mode: WatchMode) -> Result<WatchHandle, ErrorInfo> {
    let stop = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel();

    let thread_stop = stop.clone();
    let join = std::thread::Builder::new()
        .name("ddcci-watch".to_string())
        .spawn(move || {
            run_watch(mode, &thread_stop);
            let _ = done_tx.send(());
        })
        .map_err(|e| {
            ErrorInfo::from_ddc(
                DdcError::Other,
                "start_watch_displays",
                format!("cannot spawn watch thread: {e}"),
            )
        })?;

    info!("display watch started in {mode:?} mode");
    Ok(WatchHandle { stop, done_rx, join: Some(join) })
}

/* Signal the watch thread and join it, bounded by the stop timeout. */
pub fn stop_watch_displays(mut handle: WatchHandle) -> Result<(), ErrorInfo> {
    handle.stop.store(true, Ordering::Relaxed);

    match handle.done_rx.recv_timeout(STOP_JOIN_TIMEOUT) {
        Ok(()) => {
            if let Some(join) = handle.join.take() {
                let _ = join.join();
            }
            info!("display watch stopped");
            Ok(())
        }
        Err(_) => {
            warn!("watch thread did not stop within {STOP_JOIN_TIMEOUT:?}, detaching it");
            Ok(())
        }
    }
}

fn run_watch(mode: WatchMode, stop: &AtomicBool) {
    match mode {
        /* Prefer udev, degrade to polling when the socket cannot be
         * created. */
        WatchMode::Udev | WatchMode::Dynamic => {
            if !run_udev(stop) {
                run_poll(stop);
            }
        }
        WatchMode::Poll => run_poll(stop),
        WatchMode::Xevent => {
            debug!("Xevent watch not available, polling instead");
            run_poll(stop);
        }
    }
}

/* Returns false when the udev monitor could not be set up at all. */
fn run_udev(stop: &AtomicBool) -> bool {
    let monitor = udev::MonitorBuilder::new()
        .and_then(|b| b.match_subsystem("drm"))
        .and_then(|b| b.listen());
    let monitor = match monitor {
        Ok(m) => m,
        Err(e) => {
            warn!("udev monitor unavailable: {e}");
            return false;
        }
    };

    info!("watching drm subsystem events");
    let fd = monitor.as_raw_fd();

    while !stop.load(Ordering::Relaxed) {
        let mut pollfd = [nix::poll::PollFd::new(
            /* SAFETY: `monitor` outlives the poll call and keeps the fd
             * open for the borrow's duration. */
            unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
            nix::poll::PollFlags::POLLIN,
        )];

        match nix::poll::poll(&mut pollfd, nix::poll::PollTimeout::from(1000u16)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("poll on udev monitor failed: {e}");
                return true;
            }
        }

        let mut saw_event = false;
        for event in monitor.iter() {
            debug!(
                "drm event: {:?} {}",
                event.event_type(),
                event.device().sysname().to_string_lossy()
            );
            saw_event = true;
        }
        if saw_event {
            recheck_displays();
        }
    }
    true
}

fn run_poll(stop: &AtomicBool) {
    info!("polling for display changes every {POLL_INTERVAL:?}");
    'outer: loop {
        let mut waited = Duration::ZERO;
        while waited < POLL_INTERVAL {
            if stop.load(Ordering::Relaxed) {
                break 'outer;
            }
            std::thread::sleep(POLL_NAP);
            waited += POLL_NAP;
        }
        recheck_displays();
    }
}
