/* High-level VCP operations on an open display: get/set of non-table
 * features, save-settings, the capabilities string, and table values.
 * All bus traffic goes through the retry engine. */

use std::cell::Cell;

use tracing::debug;

use crate::display::{DisplayHandle, MccsVersion, MccsVersionState};
use crate::dynamic_features::{FeatureFlags, get_dynamic_feature_metadata};
use crate::packet::{
    DdcReply, ExpectedReply, NonTableVcpResponse, build_get_vcp_request,
    build_identification_request, build_save_settings_request, build_set_vcp_request,
    build_table_write_request,
};
use crate::retry::{
    MultiPartRequest, RetryClass, ddc_write_only, ddc_write_read, max_tries, multi_part_read,
};
use crate::sleep::SleepEvent;
use crate::status::{DdcError, ErrorInfo};

/* MCCS version feature. */
const VCP_FEATURE_MCCS_VERSION: u8 = 0xdf;

thread_local! {
    static VERIFY_SETVCP: Cell<bool> = const { Cell::new(false) };
}

/* Verify-after-set applies to the calling thread only. */
pub fn set_verify_setvcp(verify: bool) {
    VERIFY_SETVCP.with(|v| v.set(verify));
}

pub fn get_verify_setvcp() -> bool {
    VERIFY_SETVCP.with(|v| v.get())
}

/* Fetch the current and maximum value of a non-table feature. */
pub fn get_vcp(dh: &mut DisplayHandle, feature: u8) -> Result<NonTableVcpResponse, ErrorInfo> {
    if let Some(meta) = get_dynamic_feature_metadata(&dh.dref, feature) {
        if meta.flags.contains(FeatureFlags::WO) && !meta.flags.contains(FeatureFlags::RO) {
            return Err(ErrorInfo::from_ddc(
                DdcError::InvalidOperation,
                "get_vcp",
                format!("feature {feature:#04x} is write-only"),
            ));
        }
    }
    get_vcp_raw(dh, feature)
}

fn get_vcp_raw(dh: &mut DisplayHandle, feature: u8) -> Result<NonTableVcpResponse, ErrorInfo> {
    let packet = build_get_vcp_request(feature);
    match ddc_write_read(dh, &packet, ExpectedReply::VcpFeature { feature })? {
        DdcReply::Vcp(v) => Ok(v),
        other => Err(ErrorInfo::from_ddc(
            DdcError::DdcData,
            "get_vcp",
            format!("unexpected reply kind {other:?}"),
        )),
    }
}

/* Write a non-table feature value.  With the thread's verify option on,
 * a read-back follows and a mismatch reports VERIFY. */
pub fn set_vcp(dh: &mut DisplayHandle, feature: u8, value: u16) -> Result<(), ErrorInfo> {
    if let Some(meta) = get_dynamic_feature_metadata(&dh.dref, feature) {
        if meta.flags.contains(FeatureFlags::RO) && !meta.flags.contains(FeatureFlags::WO) {
            return Err(ErrorInfo::from_ddc(
                DdcError::InvalidOperation,
                "set_vcp",
                format!("feature {feature:#04x} is read-only"),
            ));
        }
    }

    let packet = build_set_vcp_request(feature, value);
    ddc_write_only(dh, &packet, SleepEvent::PostWrite)?;

    if !get_verify_setvcp() {
        return Ok(());
    }

    /* Verify reads stay outside the dynamic-sleep feedback; a slow
     * verify is not evidence about the monitor's pacing. */
    let dyn_was_enabled = dh.dynamic_sleep.is_enabled();
    dh.dynamic_sleep.set_enabled(false);
    let readback = get_vcp_raw(dh, feature);
    dh.dynamic_sleep.set_enabled(dyn_was_enabled);

    match readback {
        Ok(v) if v.cur() == value => Ok(()),
        Ok(v) => Err(ErrorInfo::from_ddc(
            DdcError::Verify,
            "set_vcp",
            format!("feature {feature:#04x}: wrote {value}, read back {}", v.cur()),
        )),
        Err(e) => Err(ErrorInfo::new_with_causes(
            DdcError::Verify.status(),
            "set_vcp",
            format!("feature {feature:#04x}: verify read failed"),
            vec![e],
        )),
    }
}

/* Ask the monitor to persist its current settings. */
pub fn save_current_settings(dh: &mut DisplayHandle) -> Result<(), ErrorInfo> {
    let packet = build_save_settings_request();
    ddc_write_only(dh, &packet, SleepEvent::PostSaveSettings)
}

/* Fetch the raw capabilities string.
 *
 * The bytes are returned verbatim; parsing the capabilities DSL is the
 * caller's concern.  A sequence that dies on a fragment violation is
 * restarted from offset zero, up to the multi-part retry cap. */
pub fn get_capabilities_string(dh: &mut DisplayHandle) -> Result<Vec<u8>, ErrorInfo> {
    let tries = max_tries(RetryClass::MultiPart);
    let mut causes = Vec::new();

    for attempt in 1..=tries {
        match multi_part_read(dh, MultiPartRequest::Capabilities) {
            Ok(bytes) => {
                debug!("capabilities string: {} bytes", bytes.len());
                return Ok(bytes);
            }
            Err(e) if e.status == DdcError::MultiPartReadFragment.status() => {
                debug!("capabilities sequence {attempt} failed, restarting: {e}");
                causes.push(e);
            }
            Err(e) => return Err(ErrorInfo::new_chained(e, "get_capabilities_string")),
        }
    }

    let attempts = causes.len();
    Err(ErrorInfo::new_with_causes(
        DdcError::Retries.status(),
        "get_capabilities_string",
        format!("{attempts} fragment sequences failed"),
        causes,
    ))
}

/* Read a table feature's full byte value. */
pub fn table_read(dh: &mut DisplayHandle, feature: u8) -> Result<Vec<u8>, ErrorInfo> {
    if let Some(meta) = get_dynamic_feature_metadata(&dh.dref, feature) {
        if meta.flags.contains(FeatureFlags::WO) && !meta.flags.contains(FeatureFlags::RO) {
            return Err(ErrorInfo::from_ddc(
                DdcError::InvalidOperation,
                "table_read",
                format!("feature {feature:#04x} is write-only"),
            ));
        }
    }
    multi_part_read(dh, MultiPartRequest::TableRead { feature })
}

/* Write a table feature value in 32-byte fragments. */
pub fn table_write(dh: &mut DisplayHandle, feature: u8, value: &[u8]) -> Result<(), ErrorInfo> {
    let mut offset: u16 = 0;
    for chunk in value.chunks(crate::packet::MAX_FRAGMENT_BYTES) {
        let packet = build_table_write_request(feature, offset, chunk);
        ddc_write_only(dh, &packet, SleepEvent::PostWrite)
            .map_err(|e| ErrorInfo::new_chained(e, "table_write"))?;
        offset = offset.wrapping_add(chunk.len() as u16);
    }
    Ok(())
}

/* Issue the identification request.  Most monitors answer with a Null
 * Message; the raw reply bytes are returned for the few that do not. */
pub fn get_identification(dh: &mut DisplayHandle) -> Result<Vec<u8>, ErrorInfo> {
    let packet = build_identification_request();
    match ddc_write_read(dh, &packet, ExpectedReply::Identification)? {
        DdcReply::Identification { data } => Ok(data),
        other => Err(ErrorInfo::from_ddc(
            DdcError::DdcData,
            "get_identification",
            format!("unexpected reply kind {other:?}"),
        )),
    }
}

/* The monitor's MCCS version, queried once and cached on the dref. */
pub fn get_mccs_version(dh: &mut DisplayHandle) -> MccsVersionState {
    match dh.dref.mccs_version() {
        MccsVersionState::Unqueried => {}
        cached => return cached,
    }

    let state = match get_vcp_raw(dh, VCP_FEATURE_MCCS_VERSION) {
        Ok(v) => {
            let version = MccsVersion { major: v.sh, minor: v.sl };
            debug!("{}: MCCS version {}", dh.dref.io_path, version);
            MccsVersionState::Known(version)
        }
        Err(e) => {
            debug!("{}: MCCS version query failed: {}", dh.dref.io_path, e);
            MccsVersionState::Unknown
        }
    };
    dh.dref.set_mccs_version(state);
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::test_support::{mock_dref, open_mock_display, replace_mock, take_mock};
    use crate::display::DrefFlags;
    use crate::dynamic_features::{DynamicFeatureMetadata, DynamicFeaturesRec};
    use crate::mock_bus::MockBus;
    use crate::packet::test_support::{fragment_reply, vcp_reply};
    use crate::packet::{OP_CAPABILITIES_REPLY, OP_TABLE_READ_REPLY, checksum};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn fast() {
        crate::sleep::set_sleep_multiplier(0.1).unwrap();
    }

    /* A dref whose dynamic-features slot is already populated, so the
     * loader never goes hunting for files on disk. */
    fn dref_with_feature(bus: u8, code: u8, flags: FeatureFlags) -> Arc<crate::display::DisplayRef> {
        let dref = mock_dref(bus);
        let mut features = HashMap::new();
        features.insert(
            code,
            DynamicFeatureMetadata { code, name: "Test".to_string(), flags, values: Vec::new() },
        );
        dref.set_dynamic_features(Some(Arc::new(DynamicFeaturesRec {
            mfg_id: "ACM".to_string(),
            model_name: "M".to_string(),
            product_code: 1,
            source_filename: "test".to_string(),
            mccs_version: None,
            features,
        })));
        dref.update_flags(|f| f.insert(DrefFlags::DYNAMIC_FEATURES_CHECKED));
        dref
    }

    #[test]
    fn get_vcp_round_trip() {
        fast();
        let dref = mock_dref(2);
        /* Mark checked so the loader skips the filesystem. */
        dref.update_flags(|f| f.insert(DrefFlags::DYNAMIC_FEATURES_CHECKED));
        let mut mock = MockBus::new(2);
        mock.push_reply(vcp_reply(0x10, 0x00, 100, 50));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        let v = get_vcp(&mut dh, 0x10).unwrap();
        assert_eq!(v.cur(), 50);
        assert_eq!(v.max(), 100);

        let mock = take_mock(&mut dh);
        assert_eq!(mock.ddc_writes(), vec![&[0x51, 0x82, 0x01, 0x10, 0xac][..]]);
    }

    #[test]
    fn set_then_get_honors_written_value() {
        fast();
        set_verify_setvcp(true);
        let dref = mock_dref(3);
        dref.update_flags(|f| f.insert(DrefFlags::DYNAMIC_FEATURES_CHECKED));
        let mut mock = MockBus::new(3);
        /* The verify read sees the value we just wrote. */
        mock.push_reply(vcp_reply(0x10, 0x00, 100, 42));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        set_vcp(&mut dh, 0x10, 42).unwrap();
        set_verify_setvcp(false);

        let mock = take_mock(&mut dh);
        let writes = mock.ddc_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0][2..6], [0x03, 0x10, 0x00, 0x2a]);
        assert_eq!(writes[1][2..4], [0x01, 0x10]);
    }

    #[test]
    fn verify_mismatch_reports_verify() {
        fast();
        set_verify_setvcp(true);
        let dref = mock_dref(4);
        dref.update_flags(|f| f.insert(DrefFlags::DYNAMIC_FEATURES_CHECKED));
        let mut mock = MockBus::new(4);
        mock.push_reply(vcp_reply(0x10, 0x00, 100, 41));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        let err = set_vcp(&mut dh, 0x10, 42).unwrap_err();
        set_verify_setvcp(false);
        assert_eq!(err.status, DdcError::Verify.status());
        assert!(err.detail.contains("wrote 42"));
    }

    #[test]
    fn verify_flag_is_thread_local() {
        set_verify_setvcp(true);
        let other = std::thread::spawn(get_verify_setvcp).join().unwrap();
        assert!(!other);
        assert!(get_verify_setvcp());
        set_verify_setvcp(false);
    }

    #[test]
    fn save_settings_wire_format() {
        fast();
        let dref = mock_dref(5);
        let mut dh = open_mock_display(&dref, MockBus::new(5), true).unwrap();
        save_current_settings(&mut dh).unwrap();

        let mock = take_mock(&mut dh);
        let writes = mock.ddc_writes();
        let expected_chk = checksum([0x6e, 0x51, 0x81, 0x0c].into_iter());
        assert_eq!(writes, vec![&[0x51, 0x81, 0x0c, expected_chk][..]]);
    }

    #[test]
    fn capabilities_restart_after_fragment_violation() {
        fast();
        let dref = mock_dref(6);
        let mut mock = MockBus::new(6);
        /* First sequence dies on an offset mismatch, the restart reads
         * the whole string. */
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 0, b"abc"));
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 9, b"zzz"));
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 0, b"abc"));
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 3, b"def"));
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 6, &[]));
        mock.push_reply(fragment_reply(OP_CAPABILITIES_REPLY, 6, &[]));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        let caps = get_capabilities_string(&mut dh).unwrap();
        assert_eq!(caps, b"abcdef");
    }

    #[test]
    fn table_read_assembles() {
        fast();
        let dref = mock_dref(7);
        dref.update_flags(|f| f.insert(DrefFlags::DYNAMIC_FEATURES_CHECKED));
        let mut mock = MockBus::new(7);
        mock.push_reply(fragment_reply(OP_TABLE_READ_REPLY, 0, &[1, 2, 3, 4]));
        mock.push_reply(fragment_reply(OP_TABLE_READ_REPLY, 4, &[]));
        mock.push_reply(fragment_reply(OP_TABLE_READ_REPLY, 4, &[]));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        assert_eq!(table_read(&mut dh, 0x73).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn table_write_fragments_at_32_bytes() {
        fast();
        let dref = mock_dref(8);
        dref.update_flags(|f| f.insert(DrefFlags::DYNAMIC_FEATURES_CHECKED));
        let mut dh = open_mock_display(&dref, MockBus::new(8), true).unwrap();

        let value: Vec<u8> = (0..40).collect();
        table_write(&mut dh, 0x73, &value).unwrap();

        let mock = take_mock(&mut dh);
        let writes = mock.ddc_writes();
        assert_eq!(writes.len(), 2);
        /* [src, len, opcode, feature, off_hi, off_lo, data...] */
        assert_eq!(writes[0][2..6], [0xe7, 0x73, 0x00, 0x00]);
        assert_eq!(writes[0].len(), 3 + 4 + 32 + 1 - 1);
        assert_eq!(writes[1][2..6], [0xe7, 0x73, 0x00, 0x20]);
        assert_eq!(writes[1].len(), 3 + 4 + 8 + 1 - 1);
    }

    #[test]
    fn identification_reply_round_trip() {
        fast();
        let dref = mock_dref(13);
        let mut mock = MockBus::new(13);
        mock.push_reply(crate::packet::test_support::frame_reply(&[
            crate::packet::OP_IDENTIFICATION_REPLY,
            0x41,
            0x42,
        ]));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        assert_eq!(get_identification(&mut dh).unwrap(), vec![0x41, 0x42]);
    }

    #[test]
    fn mccs_version_queried_once_and_cached() {
        fast();
        let dref = mock_dref(9);
        let mut mock = MockBus::new(9);
        mock.push_reply(vcp_reply(VCP_FEATURE_MCCS_VERSION, 0x00, 0, 0x0201));
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        let version = get_mccs_version(&mut dh);
        assert_eq!(version, MccsVersionState::Known(MccsVersion { major: 2, minor: 1 }));

        /* Cached: a second call must not touch the bus. */
        replace_mock(&mut dh, MockBus::new(9));
        let again = get_mccs_version(&mut dh);
        assert_eq!(again, version);
        let mock = take_mock(&mut dh);
        assert!(mock.ddc_writes().is_empty());
    }

    #[test]
    fn mccs_version_failure_cached_as_unknown() {
        fast();
        let dref = mock_dref(10);
        let mut mock = MockBus::new(10);
        mock.push_error(nix::errno::Errno::ENXIO);
        let mut dh = open_mock_display(&dref, mock, true).unwrap();

        assert_eq!(get_mccs_version(&mut dh), MccsVersionState::Unknown);
        assert_eq!(dref.mccs_version(), MccsVersionState::Unknown);
    }

    #[test]
    fn write_only_feature_refuses_read() {
        fast();
        let dref = dref_with_feature(11, 0x90, FeatureFlags::WO | FeatureFlags::NC);
        let mut dh = open_mock_display(&dref, MockBus::new(11), true).unwrap();

        let err = get_vcp(&mut dh, 0x90).unwrap_err();
        assert_eq!(err.status, DdcError::InvalidOperation.status());
    }

    #[test]
    fn read_only_feature_refuses_write() {
        fast();
        let dref = dref_with_feature(12, 0xc9, FeatureFlags::RO | FeatureFlags::CONT);
        let mut dh = open_mock_display(&dref, MockBus::new(12), true).unwrap();

        let err = set_vcp(&mut dh, 0xc9, 1).unwrap_err();
        assert_eq!(err.status, DdcError::InvalidOperation.status());
    }
}
