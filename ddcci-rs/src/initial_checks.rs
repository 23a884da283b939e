/* Initial-checks probe, run once per dref on first open.
 *
 * Determines whether the bus talks DDC at all, then classifies how this
 * particular monitor signals "unsupported feature" by querying features
 * that cannot legally exist.  The outcome lands in dref flags; probe
 * failures are classifications, not errors, and nothing propagates to
 * the caller. */

use nix::errno::Errno;
use tracing::{debug, info, warn};

use crate::display::{DISPNO_BUSY, DisplayHandle, DrefFlags};
use crate::packet::{ExpectedReply, build_get_vcp_request};
use crate::registry;
use crate::retry::ddc_write_read;
use crate::status::{DdcError, ErrorInfo, errno_status};

/* Luminance: the one feature every MCCS monitor must implement. */
const PROBE_SUPPORTED_FEATURE: u8 = 0x10;

/* Features that cannot legally exist, used to provoke the monitor's
 * unsupported-feature signalling.  0x41 is only probed on digital
 * inputs. */
const PROBE_BOGUS_FEATURE: u8 = 0xdd;
const PROBE_BOGUS_FEATURE_DIGITAL: u8 = 0x41;
const PROBE_BOGUS_FEATURE_LAST: u8 = 0x00;

pub(crate) fn perform_initial_checks(dh: &mut DisplayHandle) {
    let dref = dh.dref.clone();

    if let Some(index) = dref.bus_index() {
        if let Some(flags) = registry::bus_flags(index) {
            if !flags.contains(registry::BusFlags::X37_PRESENT) {
                debug!("{}: no DDC responder at 0x37, skipping probe", dref.io_path);
                dref.update_flags(|f| f.insert(DrefFlags::DDC_COMMUNICATION_CHECKED));
                return;
            }
            if flags.contains(registry::BusFlags::LAPTOP_PANEL) {
                debug!("{}: laptop panel, skipping probe", dref.io_path);
                dref.update_flags(|f| f.insert(DrefFlags::DDC_COMMUNICATION_CHECKED));
                return;
            }
        }
    }
    if let Some(connector) = dref.drm_connector() {
        if is_laptop_connector(&connector) {
            debug!("{}: connector {} is a panel, skipping probe", dref.io_path, connector);
            dref.update_flags(|f| f.insert(DrefFlags::DDC_COMMUNICATION_CHECKED));
            return;
        }
    }

    /* The probe deliberately provokes failures; dynamic sleep feedback
     * would oscillate, and the retry engine's unsupported log line would
     * alarm for nothing. */
    let dyn_was_enabled = dh.dynamic_sleep.is_enabled();
    dh.dynamic_sleep.set_enabled(false);
    dh.testing_unsupported = true;

    run_probe(dh);

    dh.testing_unsupported = false;
    dh.dynamic_sleep.set_enabled(dyn_was_enabled);
}

fn run_probe(dh: &mut DisplayHandle) {
    let dref = dh.dref.clone();

    let mut result = probe_feature(dh, PROBE_SUPPORTED_FEATURE);
    if matches!(&result, ProbeOutcome::Error(e) if e.status == DdcError::Retries.status()) {
        /* One more shot with dynamic sleep already off; a monitor that is
         * merely slow often answers the second round. */
        debug!("{}: retrying supported-feature probe once", dref.io_path);
        result = probe_feature(dh, PROBE_SUPPORTED_FEATURE);
    }

    let communication_working = match result {
        ProbeOutcome::Value | ProbeOutcome::ZeroValue => true,
        ProbeOutcome::ReportedUnsupported
        | ProbeOutcome::DeterminedUnsupported
        | ProbeOutcome::AllNull => true,
        ProbeOutcome::Error(ref e) if e.status == errno_status(Errno::EBUSY) => {
            /* Another client owns the bus right now; leave the dref
             * unchecked so a later open probes again. */
            info!("{}: bus busy, deferring initial checks", dref.io_path);
            dref.update_flags(|f| f.insert(DrefFlags::DDC_BUSY));
            dref.set_dispno(DISPNO_BUSY);
            return;
        }
        ProbeOutcome::Error(ref e)
            if e.status == errno_status(Errno::ENXIO)
                || e.status == errno_status(Errno::ENODEV) =>
        {
            info!("{}: device disappeared during initial checks", dref.io_path);
            dref.mark_removed();
            return;
        }
        ProbeOutcome::Error(ref e) if e.status == DdcError::Retries.status() => {
            /* Persistent retry exhaustion: assume the monitor talks and
             * guess the conventional unsupported policy. */
            warn!("{}: probe kept failing ({}), assuming DDC-flag policy", dref.io_path, e);
            dref.update_flags(|f| {
                f.insert(
                    DrefFlags::DDC_COMMUNICATION_CHECKED
                        | DrefFlags::DDC_COMMUNICATION_WORKING
                        | DrefFlags::UNSUPPORTED_CHECKED
                        | DrefFlags::USES_DDC_FLAG_FOR_UNSUPPORTED,
                )
            });
            return;
        }
        ProbeOutcome::Error(ref e) => {
            debug!("{}: supported-feature probe failed: {}", dref.io_path, e);
            false
        }
    };

    if !communication_working {
        dref.update_flags(|f| f.insert(DrefFlags::DDC_COMMUNICATION_CHECKED));
        return;
    }

    classify_unsupported_quirk(dh);

    dref.update_flags(|f| {
        f.insert(DrefFlags::DDC_COMMUNICATION_CHECKED | DrefFlags::DDC_COMMUNICATION_WORKING)
    });
    debug!("{}: initial checks complete, flags {:?}", dref.io_path, dref.flags());
}

fn classify_unsupported_quirk(dh: &mut DisplayHandle) {
    let dref = dh.dref.clone();

    let mut probes = vec![PROBE_BOGUS_FEATURE];
    if dref.edid().map(|e| e.is_digital_input).unwrap_or(false) {
        probes.push(PROBE_BOGUS_FEATURE_DIGITAL);
    }
    probes.push(PROBE_BOGUS_FEATURE_LAST);

    for feature in probes {
        match probe_feature(dh, feature) {
            ProbeOutcome::ZeroValue => {
                debug!("{}: zero-bytes unsupported quirk", dref.io_path);
                dref.update_flags(|f| {
                    f.insert(
                        DrefFlags::UNSUPPORTED_CHECKED
                            | DrefFlags::USES_ZERO_BYTES_FOR_UNSUPPORTED,
                    )
                });
                return;
            }
            ProbeOutcome::AllNull => {
                debug!("{}: null-response unsupported quirk", dref.io_path);
                dref.update_flags(|f| {
                    f.insert(
                        DrefFlags::UNSUPPORTED_CHECKED
                            | DrefFlags::USES_NULL_RESPONSE_FOR_UNSUPPORTED,
                    )
                });
                return;
            }
            ProbeOutcome::ReportedUnsupported | ProbeOutcome::DeterminedUnsupported => {
                dref.update_flags(|f| {
                    f.insert(
                        DrefFlags::UNSUPPORTED_CHECKED | DrefFlags::USES_DDC_FLAG_FOR_UNSUPPORTED,
                    )
                });
                return;
            }
            ProbeOutcome::Value => {
                /* A "value" for a feature that cannot exist; try the next
                 * probe before concluding the monitor lies. */
                continue;
            }
            ProbeOutcome::Error(ref e) if is_eio(e) => {
                /* Some monitors EIO every unsupported feature, but that
                 * cannot be relied on; leave the quirk unclassified. */
                warn!("{}: EIO probing feature {feature:#04x}, not classifying", dref.io_path);
                return;
            }
            ProbeOutcome::Error(e) => {
                debug!("{}: quirk probe failed: {}", dref.io_path, e);
                return;
            }
        }
    }

    /* Every bogus feature came back with a plausible value. */
    debug!("{}: monitor does not indicate unsupported features", dref.io_path);
    dref.update_flags(|f| {
        f.insert(DrefFlags::UNSUPPORTED_CHECKED | DrefFlags::DOES_NOT_INDICATE_UNSUPPORTED)
    });
}

enum ProbeOutcome {
    Value,
    ZeroValue,
    ReportedUnsupported,
    DeterminedUnsupported,
    AllNull,
    Error(ErrorInfo),
}

/* EIO, either surfaced directly or as the uniform cause of a retry
 * exhaustion. */
fn is_eio(e: &ErrorInfo) -> bool {
    e.status == errno_status(Errno::EIO)
        || (e.status == DdcError::Retries.status()
            && !e.causes.is_empty()
            && e.causes.iter().all(|c| c.status == errno_status(Errno::EIO)))
}

fn probe_feature(dh: &mut DisplayHandle, feature: u8) -> ProbeOutcome {
    let packet = build_get_vcp_request(feature);
    match ddc_write_read(dh, &packet, ExpectedReply::VcpFeature { feature }) {
        Ok(crate::packet::DdcReply::Vcp(v)) if v.all_value_bytes_zero() => {
            ProbeOutcome::ZeroValue
        }
        Ok(crate::packet::DdcReply::Vcp(_)) => ProbeOutcome::Value,
        Ok(other) => ProbeOutcome::Error(ErrorInfo::from_ddc(
            DdcError::DdcData,
            "probe_feature",
            format!("unexpected reply {other:?}"),
        )),
        Err(e) if e.status == DdcError::ReportedUnsupported.status() => {
            ProbeOutcome::ReportedUnsupported
        }
        Err(e) if e.status == DdcError::DeterminedUnsupported.status() => {
            ProbeOutcome::DeterminedUnsupported
        }
        Err(e)
            if e.status == DdcError::AllResponsesNull.status()
                || e.status == DdcError::NullResponse.status() =>
        {
            ProbeOutcome::AllNull
        }
        Err(e) => ProbeOutcome::Error(e),
    }
}

fn is_laptop_connector(connector: &str) -> bool {
    connector.contains("eDP") || connector.contains("LVDS")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::test_support::{mock_dref, open_mock_display, replace_mock};
    use crate::mock_bus::MockBus;
    use crate::packet::test_support::{null_reply, vcp_reply, vcp_unsupported_reply};
    use crate::retry::{RetryClass, max_tries};

    fn fast() {
        crate::sleep::set_sleep_multiplier(0.1).unwrap();
    }

    #[test]
    fn zero_bytes_quirk_classified() {
        fast();
        let dref = mock_dref(240);
        let mut mock = MockBus::new(240);
        /* 0x10 answers, the bogus features answer all-zero. */
        mock.push_reply(vcp_reply(0x10, 0x00, 100, 50));
        mock.push_reply(vcp_reply(PROBE_BOGUS_FEATURE, 0x00, 0, 0));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        perform_initial_checks(&mut dh);

        let flags = dref.flags();
        assert!(flags.contains(DrefFlags::DDC_COMMUNICATION_CHECKED));
        assert!(flags.contains(DrefFlags::DDC_COMMUNICATION_WORKING));
        assert!(flags.contains(DrefFlags::UNSUPPORTED_CHECKED));
        assert!(flags.contains(DrefFlags::USES_ZERO_BYTES_FOR_UNSUPPORTED));
        assert_eq!((flags & DrefFlags::UNSUPPORTED_POLICY_BITS).bits().count_ones(), 1);
    }

    #[test]
    fn null_response_quirk_classified() {
        fast();
        let dref = mock_dref(241);
        let mut mock = MockBus::new(241);
        mock.push_reply(vcp_reply(0x10, 0x00, 100, 50));
        /* Every attempt against the bogus feature returns a Null. */
        mock.push_reply_times(null_reply(), max_tries(RetryClass::WriteRead) as usize);
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        perform_initial_checks(&mut dh);

        let flags = dref.flags();
        assert!(flags.contains(DrefFlags::USES_NULL_RESPONSE_FOR_UNSUPPORTED));
        assert_eq!((flags & DrefFlags::UNSUPPORTED_POLICY_BITS).bits().count_ones(), 1);
    }

    #[test]
    fn ddc_flag_quirk_classified() {
        fast();
        let dref = mock_dref(242);
        let mut mock = MockBus::new(242);
        mock.push_reply(vcp_reply(0x10, 0x00, 100, 50));
        mock.push_reply(vcp_unsupported_reply(PROBE_BOGUS_FEATURE));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        perform_initial_checks(&mut dh);

        assert!(dref.flags().contains(DrefFlags::USES_DDC_FLAG_FOR_UNSUPPORTED));
    }

    #[test]
    fn lying_monitor_classified() {
        fast();
        let dref = mock_dref(243);
        let mut mock = MockBus::new(243);
        mock.push_reply(vcp_reply(0x10, 0x00, 100, 50));
        /* No EDID on the dref, so the probe list is 0xdd then 0x00; both
         * come back with plausible values. */
        mock.push_reply(vcp_reply(PROBE_BOGUS_FEATURE, 0x00, 10, 5));
        mock.push_reply(vcp_reply(PROBE_BOGUS_FEATURE_LAST, 0x00, 10, 5));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        perform_initial_checks(&mut dh);

        let flags = dref.flags();
        assert!(flags.contains(DrefFlags::DOES_NOT_INDICATE_UNSUPPORTED));
        assert_eq!((flags & DrefFlags::UNSUPPORTED_POLICY_BITS).bits().count_ones(), 1);
    }

    #[test]
    fn ebusy_defers_the_checks() {
        fast();
        let dref = mock_dref(244);
        let mut mock = MockBus::new(244);
        mock.push_error(Errno::EBUSY);
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        perform_initial_checks(&mut dh);

        let flags = dref.flags();
        assert!(flags.contains(DrefFlags::DDC_BUSY));
        assert!(!flags.contains(DrefFlags::DDC_COMMUNICATION_CHECKED));
        assert!(!flags.contains(DrefFlags::DDC_COMMUNICATION_WORKING));
        assert_eq!(dref.dispno(), DISPNO_BUSY);
    }

    #[test]
    fn eio_on_quirk_probe_leaves_unclassified() {
        fast();
        let dref = mock_dref(245);
        let mut mock = MockBus::new(245);
        mock.push_reply(vcp_reply(0x10, 0x00, 100, 50));
        for _ in 0..max_tries(RetryClass::WriteRead) {
            mock.push_error(Errno::EIO);
        }
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        perform_initial_checks(&mut dh);

        let flags = dref.flags();
        assert!(flags.contains(DrefFlags::DDC_COMMUNICATION_WORKING));
        assert!(!flags.contains(DrefFlags::UNSUPPORTED_CHECKED));
        assert!((flags & DrefFlags::UNSUPPORTED_POLICY_BITS).is_empty());
    }

    #[test]
    fn device_gone_marks_removed() {
        fast();
        let dref = mock_dref(246);
        let mut mock = MockBus::new(246);
        mock.push_error(Errno::ENODEV);
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        perform_initial_checks(&mut dh);
        assert!(dref.is_removed());
    }

    #[test]
    fn digital_input_adds_the_0x41_probe() {
        fast();
        let dref = mock_dref(247);
        dref.set_edid(
            crate::edid::parse_edid(&crate::edid::test_support::synth_edid(
                "ACM", "M27", "S", 7,
            ))
            .unwrap(),
        );
        let mut mock = MockBus::new(247);
        mock.push_reply(vcp_reply(0x10, 0x00, 100, 50));
        mock.push_reply(vcp_reply(PROBE_BOGUS_FEATURE, 0x00, 10, 5));
        mock.push_reply(vcp_reply(PROBE_BOGUS_FEATURE_DIGITAL, 0x00, 10, 5));
        mock.push_reply(vcp_reply(PROBE_BOGUS_FEATURE_LAST, 0x00, 10, 5));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        perform_initial_checks(&mut dh);
        assert!(dref.flags().contains(DrefFlags::DOES_NOT_INDICATE_UNSUPPORTED));

        /* All three bogus probes hit the wire after the 0x10 check. */
        let mock = replace_mock(&mut dh, MockBus::new(247));
        assert_eq!(mock.ddc_writes().len(), 4);
    }

    #[test]
    fn quirk_follows_through_on_next_query() {
        /* After classification, a query for a bogus feature synthesizes
         * DETERMINED_UNSUPPORTED via the zero-bytes policy. */
        fast();
        let dref = mock_dref(248);
        let mut mock = MockBus::new(248);
        mock.push_reply(vcp_reply(0x10, 0x00, 100, 50));
        mock.push_reply(vcp_reply(PROBE_BOGUS_FEATURE, 0x00, 0, 0));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();
        perform_initial_checks(&mut dh);
        assert!(dref.flags().contains(DrefFlags::USES_ZERO_BYTES_FOR_UNSUPPORTED));

        let mut next = MockBus::new(248);
        next.push_reply(vcp_reply(0xdd, 0x00, 0, 0));
        replace_mock(&mut dh, next);

        let packet = build_get_vcp_request(0xdd);
        let err = ddc_write_read(&mut dh, &packet, ExpectedReply::VcpFeature { feature: 0xdd })
            .unwrap_err();
        assert_eq!(err.status, DdcError::DeterminedUnsupported.status());
    }
}
