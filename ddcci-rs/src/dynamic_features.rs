/* Loader for per-monitor feature definition files.
 *
 * A monitor model may ship a `<MFG>-<MODEL>-<PRODUCT>.mccs` file naming
 * extra VCP features and value tables.  The file is located on a fixed
 * search path, parsed line by line with errors accumulated rather than
 * short-circuited, and the result is cached on the dref under the
 * DYNAMIC_FEATURES_CHECKED guard. */

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::display::{DisplayRef, DrefFlags, MccsVersion};
use crate::status::{DdcError, ErrorInfo};

bitflags! {
    /* Feature attribute bits from ATTRS statements plus the flags
     * synthesized at finalisation. */
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureFlags: u16 {
        const RO        = 1 << 0;
        const WO        = 1 << 1;
        const RW        = Self::RO.bits() | Self::WO.bits();
        const CONT      = 1 << 2;
        const NC        = 1 << 3;
        const TABLE     = 1 << 4;
        const SIMPLE_NC = 1 << 5;
        const WO_NC     = 1 << 6;
    }
}

/* One user-defined feature. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicFeatureMetadata {
    pub code: u8,
    pub name: String,
    pub flags: FeatureFlags,
    /* NC value code -> display name. */
    pub values: Vec<(u8, String)>,
}

/* A parsed `.mccs` file. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicFeaturesRec {
    pub mfg_id: String,
    pub model_name: String,
    pub product_code: u16,
    pub source_filename: String,
    pub mccs_version: Option<MccsVersion>,
    pub features: HashMap<u8, DynamicFeatureMetadata>,
}

/* Accept 0xHH, xHH, XHH, HHh and HHH spellings of a hex byte. */
pub fn parse_hex_byte(s: &str) -> Option<u8> {
    let digits = if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        rest
    } else if let Some(rest) = s.strip_prefix('x').or_else(|| s.strip_prefix('X')) {
        rest
    } else if let Some(rest) = s.strip_suffix('h').or_else(|| s.strip_suffix('H')) {
        rest
    } else {
        return None;
    };
    if digits.is_empty() || digits.len() > 2 {
        return None;
    }
    u8::from_str_radix(digits, 16).ok()
}

/* Canonical spelling: "0x" plus two lowercase digits. */
pub fn canonicalize_hex(s: &str) -> Option<String> {
    parse_hex_byte(s).map(|b| format!("{b:#04x}"))
}

/* Filename key: every non-alphanumeric model character becomes '_'. */
pub fn feature_definition_filename(mfg: &str, model: &str, product_code: u16) -> String {
    let model_key: String = model
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{mfg}-{model_key}-{product_code}.mccs")
}

fn search_directories() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(dir) = std::env::var("DDCCI_DATA_DIR") {
        dirs.push(PathBuf::from(dir));
    }
    dirs.push(PathBuf::from("."));
    if let Ok(home) = std::env::var("HOME") {
        dirs.push(Path::new(&home).join(".local/share/ddcutil"));
    }
    dirs.push(PathBuf::from("/usr/local/share/ddcutil"));
    dirs.push(PathBuf::from("/usr/share/ddcutil"));
    dirs
}

/* First readable file on the search path wins. */
pub fn find_feature_definition_file(mfg: &str, model: &str, product_code: u16) -> Option<PathBuf> {
    find_feature_definition_file_in(&search_directories(), mfg, model, product_code)
}

pub fn find_feature_definition_file_in(
    dirs: &[PathBuf],
    mfg: &str,
    model: &str,
    product_code: u16,
) -> Option<PathBuf> {
    let filename = feature_definition_filename(mfg, model, product_code);
    for dir in dirs {
        let candidate = dir.join(&filename);
        if candidate.is_file() {
            debug!("found feature definition file {}", candidate.display());
            return Some(candidate);
        }
    }
    None
}

struct ParseState {
    rec: DynamicFeaturesRec,
    current: Option<DynamicFeatureMetadata>,
    errors: Vec<ErrorInfo>,
    saw_mfg: bool,
    saw_model: bool,
    saw_product: bool,
}

impl ParseState {
    fn error(&mut self, line_no: usize, detail: String) {
        self.errors.push(ErrorInfo::from_ddc(
            DdcError::BadData,
            "parse_feature_definition",
            format!("line {line_no}: {detail}"),
        ));
    }

    fn finish_current(&mut self) {
        if let Some(mut feature) = self.current.take() {
            finalize_feature(&mut feature, &mut self.errors);
            self.rec.features.insert(feature.code, feature);
        }
    }
}

fn finalize_feature(feature: &mut DynamicFeatureMetadata, errors: &mut Vec<ErrorInfo>) {
    if feature.flags.contains(FeatureFlags::NC) {
        if feature.flags.contains(FeatureFlags::WO) && !feature.flags.contains(FeatureFlags::RO) {
            feature.flags.insert(FeatureFlags::WO_NC);
        } else if !feature.values.is_empty() {
            feature.flags.insert(FeatureFlags::SIMPLE_NC);
        }
    } else if !feature.values.is_empty() {
        errors.push(ErrorInfo::from_ddc(
            DdcError::BadData,
            "parse_feature_definition",
            format!(
                "feature {:#04x}: VALUE statements are only valid for NC features",
                feature.code
            ),
        ));
    }
}

/* Parse the text of a feature definition file.
 *
 * Lines starting with '*' or '#' are comments.  Errors accumulate; the
 * result is the record only when every line parsed cleanly. */
pub fn parse_feature_definition(
    text: &str,
    filename: &str,
) -> Result<DynamicFeaturesRec, ErrorInfo> {
    let mut st = ParseState {
        rec: DynamicFeaturesRec {
            mfg_id: String::new(),
            model_name: String::new(),
            product_code: 0,
            source_filename: filename.to_string(),
            mccs_version: None,
            features: HashMap::new(),
        },
        current: None,
        errors: Vec::new(),
        saw_mfg: false,
        saw_model: false,
        saw_product: false,
    };

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('*') || line.starts_with('#') {
            continue;
        }

        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (line, ""),
        };

        match keyword.to_ascii_uppercase().as_str() {
            "MFG_ID" => {
                if rest.len() != 3 {
                    st.error(line_no, format!("MFG_ID '{rest}' is not three characters"));
                } else {
                    st.rec.mfg_id = rest.to_ascii_uppercase();
                    st.saw_mfg = true;
                }
            }
            "MODEL" => {
                if rest.is_empty() {
                    st.error(line_no, "MODEL is empty".to_string());
                } else {
                    st.rec.model_name = rest.to_string();
                    st.saw_model = true;
                }
            }
            "PRODUCT_CODE" => match rest.parse::<u16>() {
                Ok(code) => {
                    st.rec.product_code = code;
                    st.saw_product = true;
                }
                Err(_) => st.error(line_no, format!("PRODUCT_CODE '{rest}' is not a decimal integer")),
            },
            "MCCS_VERSION" | "VCP_VERSION" => match parse_version(rest) {
                Some(v) => st.rec.mccs_version = Some(v),
                None => st.error(line_no, format!("version '{rest}' is not M.N")),
            },
            "FEATURE_CODE" => {
                st.finish_current();
                let (code_str, name) = match rest.split_once(char::is_whitespace) {
                    Some((c, n)) => (c, n.trim()),
                    None => (rest, ""),
                };
                match parse_hex_byte(code_str) {
                    Some(code) => {
                        st.current = Some(DynamicFeatureMetadata {
                            code,
                            name: name.to_string(),
                            flags: FeatureFlags::empty(),
                            values: Vec::new(),
                        });
                    }
                    None => st.error(line_no, format!("feature code '{code_str}' is not a hex byte")),
                }
            }
            "ATTRS" => match st.current {
                Some(ref mut feature) => {
                    for attr in rest.split_whitespace() {
                        match parse_attr(attr) {
                            Some(flags) => feature.flags.insert(flags),
                            None => {
                                let detail = format!("unrecognized attribute '{attr}'");
                                st.errors.push(ErrorInfo::from_ddc(
                                    DdcError::BadData,
                                    "parse_feature_definition",
                                    format!("line {line_no}: {detail}"),
                                ));
                            }
                        }
                    }
                }
                None => st.error(line_no, "ATTRS before any FEATURE_CODE".to_string()),
            },
            "VALUE" => {
                let (value_str, name) = match rest.split_once(char::is_whitespace) {
                    Some((v, n)) => (v, n.trim()),
                    None => (rest, ""),
                };
                let Some(value) = parse_hex_byte(value_str) else {
                    st.error(line_no, format!("value '{value_str}' is not a hex byte"));
                    continue;
                };
                match st.current {
                    Some(ref mut feature) => feature.values.push((value, name.to_string())),
                    None => st.error(line_no, "VALUE before any FEATURE_CODE".to_string()),
                }
            }
            other => st.error(line_no, format!("unrecognized keyword '{other}'")),
        }
    }

    st.finish_current();

    if !st.saw_mfg {
        st.error(0, "missing MFG_ID".to_string());
    }
    if !st.saw_model {
        st.error(0, "missing MODEL".to_string());
    }
    if !st.saw_product {
        st.error(0, "missing PRODUCT_CODE".to_string());
    }
    if st.rec.features.is_empty() {
        st.error(0, "no features defined".to_string());
    }

    if st.errors.is_empty() {
        Ok(st.rec)
    } else {
        Err(ErrorInfo::new_with_causes(
            DdcError::BadData.status(),
            "parse_feature_definition",
            format!("{}: {} errors", filename, st.errors.len()),
            st.errors,
        ))
    }
}

fn parse_attr(attr: &str) -> Option<FeatureFlags> {
    match attr.to_ascii_uppercase().as_str() {
        "RW" => Some(FeatureFlags::RW),
        "RO" => Some(FeatureFlags::RO),
        "WO" => Some(FeatureFlags::WO),
        "C" | "CCONT" => Some(FeatureFlags::CONT),
        "NC" => Some(FeatureFlags::NC),
        "T" => Some(FeatureFlags::TABLE),
        _ => None,
    }
}

fn parse_version(s: &str) -> Option<MccsVersion> {
    let (major, minor) = s.split_once('.')?;
    Some(MccsVersion { major: major.trim().parse().ok()?, minor: minor.trim().parse().ok()? })
}

/* Load the dref's feature definition file if one exists, once.  The
 * record must name the same monitor as the EDID or it is rejected. */
pub(crate) fn load_dynamic_features(dref: &Arc<DisplayRef>) {
    if dref.flags().contains(DrefFlags::DYNAMIC_FEATURES_CHECKED) {
        return;
    }
    dref.update_flags(|f| f.insert(DrefFlags::DYNAMIC_FEATURES_CHECKED));

    let Some(edid) = dref.edid() else {
        debug!("{}: no EDID, skipping dynamic features", dref.io_path);
        return;
    };

    let Some(path) =
        find_feature_definition_file(&edid.mfg_id, &edid.model_name, edid.product_code)
    else {
        debug!(
            "{}: no feature definition file for {}/{}/{}",
            dref.io_path, edid.mfg_id, edid.model_name, edid.product_code
        );
        return;
    };

    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) => {
            warn!("cannot read {}: {}", path.display(), e);
            return;
        }
    };

    match parse_feature_definition(&text, &path.display().to_string()) {
        Ok(rec) => {
            if rec.mfg_id != edid.mfg_id
                || rec.model_name != edid.model_name
                || rec.product_code != edid.product_code
            {
                warn!(
                    "{} names {}/{}/{}, monitor is {}/{}/{}",
                    path.display(),
                    rec.mfg_id,
                    rec.model_name,
                    rec.product_code,
                    edid.mfg_id,
                    edid.model_name,
                    edid.product_code
                );
                return;
            }
            debug!("{}: loaded {} features from {}", dref.io_path, rec.features.len(), path.display());
            dref.set_dynamic_features(Some(Arc::new(rec)));
        }
        Err(e) => {
            warn!("feature definition rejected:\n{}", e.report());
        }
    }
}

/* Per-feature metadata lookup; triggers the one-shot load. */
pub fn get_dynamic_feature_metadata(
    dref: &Arc<DisplayRef>,
    feature: u8,
) -> Option<DynamicFeatureMetadata> {
    load_dynamic_features(dref);
    dref.dynamic_features().and_then(|rec| rec.features.get(&feature).cloned())
}
