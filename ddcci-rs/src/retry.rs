/* Retry engine: wraps one logical DDC exchange in a bounded retry loop
 * with per-failure classification and history.
 *
 * Three retry classes with independent caps.  Hard failures (EBUSY,
 * device gone) surface immediately; protocol noise (bad checksum, Null
 * Message, doubled bytes) retries until the class budget is exhausted,
 * at which point the caller gets one RETRIES node with one cause per
 * attempt. */

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use tracing::{debug, warn};

use crate::display::{DisplayHandle, UnsupportedPolicy};
use crate::packet::{
    DdcPacket, DdcReply, ExpectedReply, I2C_ADDR_DDC_CI, MAX_REPLY_LEN,
    build_capabilities_request, build_table_read_request, parse_ddc_reply,
};
use crate::sleep::{SleepEvent, sleep_multiplier, tuned_sleep};
use crate::status::{
    DdcError, ErrorInfo, MAX_MAX_TRIES, Status, errno_status, summarize_statuses,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    WriteOnly,
    WriteRead,
    MultiPart,
}

const DEFAULT_MAX_TRIES: [u8; 3] = [4, 4, 8];

static MAX_TRIES: [AtomicU8; 3] = [AtomicU8::new(4), AtomicU8::new(4), AtomicU8::new(8)];

fn class_index(class: RetryClass) -> usize {
    match class {
        RetryClass::WriteOnly => 0,
        RetryClass::WriteRead => 1,
        RetryClass::MultiPart => 2,
    }
}

pub fn max_tries(class: RetryClass) -> u8 {
    MAX_TRIES[class_index(class)].load(Ordering::Relaxed)
}

/* Set the retry cap for one class.  Out-of-range values are refused and
 * leave the setting unchanged. */
pub fn set_max_tries(class: RetryClass, tries: u8) -> Result<(), ErrorInfo> {
    if tries < 1 || tries as usize > MAX_MAX_TRIES {
        return Err(ErrorInfo::from_ddc(
            DdcError::Arg,
            "set_max_tries",
            format!("tries {tries} outside 1..={MAX_MAX_TRIES}"),
        ));
    }
    MAX_TRIES[class_index(class)].store(tries, Ordering::Relaxed);
    Ok(())
}

pub fn reset_max_tries() {
    for (slot, &v) in MAX_TRIES.iter().zip(DEFAULT_MAX_TRIES.iter()) {
        slot.store(v, Ordering::Relaxed);
    }
}

/* Bounded ring of per-attempt statuses for one exchange. */
#[derive(Debug, Clone, Default)]
pub struct RetryHistory {
    statuses: Vec<Status>,
}

impl RetryHistory {
    pub fn push(&mut self, status: Status) {
        if self.statuses.len() < MAX_MAX_TRIES {
            self.statuses.push(status);
        }
    }

    pub fn statuses(&self) -> &[Status] {
        &self.statuses
    }

    pub fn all_same(&self, status: Status) -> bool {
        !self.statuses.is_empty() && self.statuses.iter().all(|&s| s == status)
    }

    pub fn summary(&self) -> String {
        summarize_statuses(&self.statuses)
    }
}

/* Errors that must never be retried: the device is gone or busy, and
 * hammering the bus only makes it worse. */
fn errno_is_fatal(errno: Errno) -> bool {
    matches!(errno, Errno::EBUSY | Errno::ENXIO | Errno::ENODEV | Errno::ENOENT)
}

fn expected_read_len(expected: ExpectedReply) -> usize {
    match expected {
        ExpectedReply::VcpFeature { .. } => 11,
        _ => MAX_REPLY_LEN,
    }
}

/* Worst-case wall clock for one write-read attempt, used to derive the
 * per-operation deadline checked between retries. */
fn attempt_budget() -> Duration {
    let ms = (SleepEvent::WriteToRead.base_millis() * 2
        + SleepEvent::DdcNull.base_millis()
        + 100) as f64
        * sleep_multiplier()
        * 2.0;
    Duration::from_millis(ms as u64)
}

/* One write-only exchange (Set-VCP, Save-Settings) under retry.
 * `post_event` is the settle sleep after a successful write. */
pub(crate) fn ddc_write_only(
    dh: &mut DisplayHandle,
    packet: &DdcPacket,
    post_event: SleepEvent,
) -> Result<(), ErrorInfo> {
    let tries = max_tries(RetryClass::WriteOnly);
    let mut causes = Vec::new();
    let mut history = RetryHistory::default();

    for attempt in 1..=tries {
        if attempt > 1 {
            tuned_sleep(SleepEvent::WriteToRead, Some(&mut dh.dynamic_sleep));
        }
        let write_result = {
            let bus = dh.bus_mut()?;
            bus.write_bytes(I2C_ADDR_DDC_CI, packet.wire_bytes())
        };
        match write_result {
            Ok(()) => {
                tuned_sleep(post_event, Some(&mut dh.dynamic_sleep));
                dh.dynamic_sleep.note_success();
                return Ok(());
            }
            Err(errno) if errno_is_fatal(errno) => {
                return Err(ErrorInfo::from_errno(errno, "ddc_write_only", "write failed"));
            }
            Err(errno) => {
                debug!("write attempt {attempt} failed: {errno}");
                history.push(errno_status(errno));
                causes.push(ErrorInfo::from_errno(
                    errno,
                    "ddc_write_only",
                    format!("attempt {attempt}"),
                ));
                dh.dynamic_sleep.note_retry_failure();
            }
        }
    }

    Err(finish_exhausted(dh, "ddc_write_only", history, causes))
}

/* The write-read hot path. */
pub(crate) fn ddc_write_read(
    dh: &mut DisplayHandle,
    packet: &DdcPacket,
    expected: ExpectedReply,
) -> Result<DdcReply, ErrorInfo> {
    let tries = max_tries(RetryClass::WriteRead);
    let deadline = Instant::now() + attempt_budget() * tries as u32;
    let mut causes = Vec::new();
    let mut history = RetryHistory::default();
    let policy = dh.dref.unsupported_policy();
    let eio_unsupported = dh.dref.eio_means_unsupported();

    for attempt in 1..=tries {
        if attempt > 1 && Instant::now() >= deadline {
            debug!("per-operation deadline reached after {} attempts", attempt - 1);
            break;
        }

        let event = if attempt == 1 { SleepEvent::PostRead } else { SleepEvent::WriteToRead };
        tuned_sleep(event, Some(&mut dh.dynamic_sleep));

        let write_result = {
            let bus = dh.bus_mut()?;
            bus.write_bytes(I2C_ADDR_DDC_CI, packet.wire_bytes())
        };
        if let Err(errno) = write_result {
            if errno_is_fatal(errno) {
                return Err(ErrorInfo::from_errno(errno, "ddc_write_read", "write failed"));
            }
            history.push(errno_status(errno));
            causes.push(ErrorInfo::from_errno(
                errno,
                "ddc_write_read",
                format!("write, attempt {attempt}"),
            ));
            dh.dynamic_sleep.note_retry_failure();
            continue;
        }

        tuned_sleep(SleepEvent::WriteToRead, Some(&mut dh.dynamic_sleep));

        let mut buf = vec![0u8; expected_read_len(expected)];
        let read_result = {
            let bus = dh.bus_mut()?;
            bus.read_bytes(I2C_ADDR_DDC_CI, &mut buf)
        };
        if let Err(errno) = read_result {
            if errno == Errno::EIO && eio_unsupported {
                return Err(ErrorInfo::from_ddc(
                    DdcError::DeterminedUnsupported,
                    "ddc_write_read",
                    "monitor signals unsupported features with EIO",
                ));
            }
            if errno_is_fatal(errno) {
                return Err(ErrorInfo::from_errno(errno, "ddc_write_read", "read failed"));
            }
            history.push(errno_status(errno));
            causes.push(ErrorInfo::from_errno(
                errno,
                "ddc_write_read",
                format!("read, attempt {attempt}"),
            ));
            dh.dynamic_sleep.note_retry_failure();
            continue;
        }

        match parse_ddc_reply(&buf, expected, packet) {
            Ok(DdcReply::Null) => {
                history.push(DdcError::NullResponse.status());
                causes.push(ErrorInfo::from_ddc(
                    DdcError::NullResponse,
                    "ddc_write_read",
                    format!("attempt {attempt}"),
                ));
                dh.dynamic_sleep.note_null_response();
                if policy == Some(UnsupportedPolicy::NullResponse) {
                    /* For this monitor a Null Message is an answer, not a
                     * hiccup. */
                    return Err(ErrorInfo::from_ddc(
                        DdcError::NullResponse,
                        "ddc_write_read",
                        "monitor signals unsupported features with the Null Message",
                    ));
                }
                tuned_sleep(SleepEvent::DdcNull, Some(&mut dh.dynamic_sleep));
            }
            Ok(DdcReply::Vcp(v)) => {
                if !v.supported_opcode {
                    if !dh.testing_unsupported {
                        debug!(
                            "monitor reports feature {:#04x} unsupported",
                            v.feature_code
                        );
                    }
                    return Err(ErrorInfo::from_ddc(
                        DdcError::ReportedUnsupported,
                        "ddc_write_read",
                        format!("feature {:#04x}", v.feature_code),
                    ));
                }
                if v.all_value_bytes_zero() && policy == Some(UnsupportedPolicy::ZeroBytes) {
                    return Err(ErrorInfo::from_ddc(
                        DdcError::DeterminedUnsupported,
                        "ddc_write_read",
                        format!(
                            "feature {:#04x}: all-zero values on a zero-bytes monitor",
                            v.feature_code
                        ),
                    ));
                }
                note_eventual_success(dh, &history);
                tuned_sleep(SleepEvent::PostRead, Some(&mut dh.dynamic_sleep));
                return Ok(DdcReply::Vcp(v));
            }
            Ok(reply) => {
                note_eventual_success(dh, &history);
                tuned_sleep(SleepEvent::PostRead, Some(&mut dh.dynamic_sleep));
                return Ok(reply);
            }
            Err(parse_err) => {
                debug!("attempt {attempt} rejected: {parse_err}");
                history.push(parse_err.status);
                causes.push(parse_err);
                dh.dynamic_sleep.note_retry_failure();
            }
        }
    }

    Err(finish_exhausted(dh, "ddc_write_read", history, causes))
}

/* Success after failed attempts still leaves the attempt trail on the
 * dref for diagnostics. */
fn note_eventual_success(dh: &mut DisplayHandle, history: &RetryHistory) {
    dh.dynamic_sleep.note_success();
    if !history.statuses().is_empty() {
        debug!(
            "{}: succeeded after {} failed attempts ({})",
            dh.dref.io_path,
            history.statuses().len(),
            history.summary()
        );
        dh.dref.set_comm_error_summary(history.summary());
    }
}

fn finish_exhausted(
    dh: &mut DisplayHandle,
    function: &str,
    history: RetryHistory,
    causes: Vec<ErrorInfo>,
) -> ErrorInfo {
    let summary = history.summary();
    dh.dref.set_comm_error_summary(summary.clone());
    if !dh.testing_unsupported {
        warn!("{} exhausted {} attempts on {}: {}", function, causes.len(), dh.dref.io_path, summary);
    }

    /* A uniform run of Null Messages is a statement, not flakiness. */
    let status = if history.all_same(DdcError::NullResponse.status()) {
        DdcError::AllResponsesNull.status()
    } else {
        DdcError::Retries.status()
    };
    ErrorInfo::new_with_causes(
        status,
        function,
        format!("{} attempts: {}", causes.len(), summary),
        causes,
    )
}

/* What a multi-part read sequence fetches. */
#[derive(Debug, Clone, Copy)]
pub(crate) enum MultiPartRequest {
    Capabilities,
    TableRead { feature: u8 },
}

/* Cap on an assembled multi-part buffer. */
pub const MULTI_PART_MAX_BYTES: usize = 32 * 1024;

/* Issue fragment requests at increasing offsets until the monitor
 * confirms the end of the value.
 *
 * A single empty fragment is re-requested once before being taken as the
 * terminator, so a monitor that hiccups an empty answer mid-sequence
 * does not silently truncate the value.  Fragment offsets must echo the
 * request exactly; the assembled length is the running offset by
 * construction. */
pub(crate) fn multi_part_read(
    dh: &mut DisplayHandle,
    request: MultiPartRequest,
) -> Result<Vec<u8>, ErrorInfo> {
    let mut assembled: Vec<u8> = Vec::new();
    let mut offset: u16 = 0;
    let mut empties_at_offset = 0u8;

    loop {
        let (packet, expected) = match request {
            MultiPartRequest::Capabilities => {
                (build_capabilities_request(offset), ExpectedReply::Capabilities)
            }
            MultiPartRequest::TableRead { feature } => (
                build_table_read_request(feature, offset),
                ExpectedReply::TableRead { feature },
            ),
        };

        let reply = ddc_write_read(dh, &packet, expected)
            .map_err(|e| ErrorInfo::new_chained(e, "multi_part_read"))?;

        let (reply_offset, data) = match reply {
            DdcReply::Fragment { offset, data } => (offset, data),
            other => {
                return Err(ErrorInfo::from_ddc(
                    DdcError::MultiPartReadFragment,
                    "multi_part_read",
                    format!("unexpected reply kind {other:?}"),
                ));
            }
        };

        if reply_offset != offset {
            return Err(ErrorInfo::from_ddc(
                DdcError::MultiPartReadFragment,
                "multi_part_read",
                format!("fragment offset {reply_offset}, requested {offset}"),
            ));
        }

        if data.is_empty() {
            empties_at_offset += 1;
            if empties_at_offset >= 2 {
                debug!("multi-part read complete: {} bytes", assembled.len());
                return Ok(assembled);
            }
            continue;
        }
        empties_at_offset = 0;

        assembled.extend_from_slice(&data);
        if assembled.len() > MULTI_PART_MAX_BYTES {
            return Err(ErrorInfo::from_ddc(
                DdcError::MultiPartReadFragment,
                "multi_part_read",
                format!("assembled size exceeds {MULTI_PART_MAX_BYTES} bytes"),
            ));
        }
        offset = offset.wrapping_add(data.len() as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::test_support::{mock_dref, open_mock_display, take_mock};
    use crate::display::DrefFlags;
    use crate::mock_bus::MockBus;
    use crate::packet::test_support::{
        fragment_reply, null_reply, vcp_reply, vcp_unsupported_reply,
    };
    use crate::packet::{OP_CAPABILITIES_REPLY, build_get_vcp_request};
    use crate::status::status_name;

    fn fast() {
        crate::sleep::set_sleep_multiplier(0.1).unwrap();
    }

    #[test]
    fn max_tries_range_enforced() {
        let before = max_tries(RetryClass::WriteRead);
        assert!(set_max_tries(RetryClass::WriteRead, 0).is_err());
        assert!(set_max_tries(RetryClass::WriteRead, 16).is_err());
        assert_eq!(max_tries(RetryClass::WriteRead), before);
    }

    #[test]
    fn happy_path_get_vcp() {
        fast();
        let dref = mock_dref(220);
        let mut mock = MockBus::new(220);
        mock.push_reply(vcp_reply(0x10, 0x00, 100, 50));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        let req = build_get_vcp_request(0x10);
        let reply =
            ddc_write_read(&mut dh, &req, ExpectedReply::VcpFeature { feature: 0x10 }).unwrap();
        let DdcReply::Vcp(v) = reply else { panic!("expected Vcp") };
        assert!(v.supported_opcode);
        assert_eq!(v.max(), 100);
        assert_eq!(v.cur(), 50);

        /* The request reached the wire exactly as framed. */
        let mock = take_mock(&mut dh);
        assert_eq!(mock.ddc_writes(), vec![req.wire_bytes()]);
    }

    #[test]
    fn reported_unsupported_surfaces_immediately() {
        fast();
        let dref = mock_dref(221);
        let mut mock = MockBus::new(221);
        mock.push_reply(vcp_unsupported_reply(0xdd));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        let req = build_get_vcp_request(0xdd);
        let err = ddc_write_read(&mut dh, &req, ExpectedReply::VcpFeature { feature: 0xdd })
            .unwrap_err();
        assert_eq!(err.status, DdcError::ReportedUnsupported.status());
    }

    #[test]
    fn retries_then_success_keeps_history() {
        fast();
        let dref = mock_dref(222);
        let mut mock = MockBus::new(222);
        mock.push_reply(null_reply());
        mock.push_reply(null_reply());
        mock.push_reply(null_reply());
        mock.push_reply(vcp_reply(0x10, 0x00, 100, 50));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        set_max_tries(RetryClass::WriteRead, 5).unwrap();
        let req = build_get_vcp_request(0x10);
        let reply =
            ddc_write_read(&mut dh, &req, ExpectedReply::VcpFeature { feature: 0x10 }).unwrap();
        reset_max_tries();

        let DdcReply::Vcp(v) = reply else { panic!("expected Vcp") };
        assert_eq!(v.cur(), 50);

        /* The three nulls stay visible as the dref's attempt trail. */
        assert_eq!(
            dref.comm_error_summary().as_deref(),
            Some("DDCRC_NULL_RESPONSE(x3)")
        );
    }

    #[test]
    fn all_null_promoted() {
        fast();
        let dref = mock_dref(223);
        let mut mock = MockBus::new(223);
        mock.push_reply_times(null_reply(), 3);
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        set_max_tries(RetryClass::WriteRead, 3).unwrap();
        let req = build_get_vcp_request(0x10);
        let err = ddc_write_read(&mut dh, &req, ExpectedReply::VcpFeature { feature: 0x10 })
            .unwrap_err();
        reset_max_tries();

        assert_eq!(err.status, DdcError::AllResponsesNull.status());
        assert_eq!(err.causes.len(), 3);
        assert!(err.causes.iter().all(|c| c.status == DdcError::NullResponse.status()));
    }

    #[test]
    fn mixed_failures_yield_retries_with_cause_per_attempt() {
        fast();
        let dref = mock_dref(224);
        let mut mock = MockBus::new(224);
        mock.push_reply(null_reply());
        let mut garbled = vcp_reply(0x10, 0x00, 100, 50);
        *garbled.last_mut().unwrap() ^= 0xff;
        mock.push_reply(garbled);
        mock.push_reply(null_reply());
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        set_max_tries(RetryClass::WriteRead, 3).unwrap();
        let req = build_get_vcp_request(0x10);
        let err = ddc_write_read(&mut dh, &req, ExpectedReply::VcpFeature { feature: 0x10 })
            .unwrap_err();
        reset_max_tries();

        assert_eq!(err.status, DdcError::Retries.status());
        assert_eq!(err.causes.len(), 3);
        assert!(err.detail.contains("DDCRC_NULL_RESPONSE"));
        assert!(dref.comm_error_summary().is_some());
    }

    #[test]
    fn null_policy_monitor_short_circuits() {
        fast();
        let dref = mock_dref(225);
        dref.update_flags(|f| {
            f.insert(
                DrefFlags::UNSUPPORTED_CHECKED | DrefFlags::USES_NULL_RESPONSE_FOR_UNSUPPORTED,
            )
        });
        let mut mock = MockBus::new(225);
        mock.push_reply(null_reply());
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        let req = build_get_vcp_request(0xdd);
        let err = ddc_write_read(&mut dh, &req, ExpectedReply::VcpFeature { feature: 0xdd })
            .unwrap_err();
        assert_eq!(err.status, DdcError::NullResponse.status());
    }

    #[test]
    fn zero_bytes_policy_synthesizes_determined_unsupported() {
        fast();
        let dref = mock_dref(226);
        dref.update_flags(|f| {
            f.insert(DrefFlags::UNSUPPORTED_CHECKED | DrefFlags::USES_ZERO_BYTES_FOR_UNSUPPORTED)
        });
        let mut mock = MockBus::new(226);
        mock.push_reply(vcp_reply(0xdd, 0x00, 0, 0));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        let req = build_get_vcp_request(0xdd);
        let err = ddc_write_read(&mut dh, &req, ExpectedReply::VcpFeature { feature: 0xdd })
            .unwrap_err();
        assert_eq!(err.status, DdcError::DeterminedUnsupported.status());
    }

    #[test]
    fn eio_with_quirk_means_unsupported() {
        fast();
        let dref = mock_dref(227);
        dref.set_eio_means_unsupported(true);
        let mut mock = MockBus::new(227);
        mock.push_error(Errno::EIO);
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        let req = build_get_vcp_request(0xdd);
        let err = ddc_write_read(&mut dh, &req, ExpectedReply::VcpFeature { feature: 0xdd })
            .unwrap_err();
        assert_eq!(err.status, DdcError::DeterminedUnsupported.status());
    }

    #[test]
    fn ebusy_is_never_retried() {
        fast();
        let dref = mock_dref(228);
        let mut mock = MockBus::new(228);
        mock.push_error(Errno::EBUSY);
        /* A second staged reply must never be consumed. */
        mock.push_reply(vcp_reply(0x10, 0x00, 100, 50));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        let req = build_get_vcp_request(0x10);
        let err = ddc_write_read(&mut dh, &req, ExpectedReply::VcpFeature { feature: 0x10 })
            .unwrap_err();
        assert_eq!(err.status, errno_status(Errno::EBUSY));

        let mock = take_mock(&mut dh);
        assert_eq!(mock.ddc_writes().len(), 1);
    }

    #[test]
    fn multi_part_assembles_fragments() {
        fast();
        let dref = mock_dref(229);
        let mut mock = MockBus::new(229);
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 0, b"(prot(monitor)type(lcd)"));
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 23, b"model(P2720))"));
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 36, &[]));
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 36, &[]));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        let assembled = multi_part_read(&mut dh, MultiPartRequest::Capabilities).unwrap();
        assert_eq!(assembled, b"(prot(monitor)type(lcd)model(P2720))");
    }

    #[test]
    fn multi_part_tolerates_interleaved_empty_fragment() {
        fast();
        let dref = mock_dref(230);
        let mut mock = MockBus::new(230);
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 0, b"abc"));
        /* A lone empty mid-sequence is a hiccup, not the end. */
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 3, &[]));
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 3, b"def"));
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 6, &[]));
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 6, &[]));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        let assembled = multi_part_read(&mut dh, MultiPartRequest::Capabilities).unwrap();
        assert_eq!(assembled, b"abcdef");
    }

    #[test]
    fn multi_part_offset_mismatch_rejected() {
        fast();
        let dref = mock_dref(231);
        let mut mock = MockBus::new(231);
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 0, b"abc"));
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 9, b"def"));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        let err = multi_part_read(&mut dh, MultiPartRequest::Capabilities).unwrap_err();
        assert_eq!(err.status, DdcError::MultiPartReadFragment.status());
        assert!(err.detail.contains("offset"));
    }

    #[test]
    fn retry_history_ring_is_bounded() {
        let mut history = RetryHistory::default();
        for _ in 0..MAX_MAX_TRIES + 5 {
            history.push(DdcError::NullResponse.status());
        }
        assert_eq!(history.statuses().len(), MAX_MAX_TRIES);
        assert!(history.all_same(DdcError::NullResponse.status()));
    }

    #[test]
    fn history_summary_names_the_failures() {
        let mut history = RetryHistory::default();
        history.push(DdcError::NullResponse.status());
        history.push(DdcError::NullResponse.status());
        history.push(DdcError::DdcData.status());
        assert_eq!(history.summary(), "DDCRC_NULL_RESPONSE(x2), DDCRC_DDC_DATA");
        assert_eq!(status_name(history.statuses()[2]), "DDCRC_DDC_DATA");
    }
}
