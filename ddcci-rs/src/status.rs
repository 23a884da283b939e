/* Status-code space: merges negated POSIX errno, DDC protocol codes, and
 * library-synthesized codes into one signed integer range, with symbolic
 * names, descriptions, and the ErrorInfo causal tree used for reporting. */
use std::fmt;

use nix::errno::Errno;
use thiserror::Error;

/* Unified return code.
 *
 * -999..=-1    negated POSIX errno
 * -3999..=-3000  DDC protocol / library codes, -(RCRANGE_DDC_START + n)
 * 0            success
 * >0           qualified success (reserved) */
pub type Status = i32;

pub const DDCRC_OK: Status = 0;

/* Base of the DDC/library code range; codes are returned as -(3000 + n). */
pub const RCRANGE_DDC_START: i32 = 3000;

/* Upper bound (inclusive, negated) of the errno range. */
pub const RCRANGE_ERRNO_MAX: i32 = 999;

/* Hard ceiling on any retry-count setting. */
pub const MAX_MAX_TRIES: usize = 15;

/* DDC protocol and library-synthesized failures.
 *
 * Each variant owns a stable slot in the -(3000+n) range; the numeric
 * code, short name, and description are reachable both from the enum and
 * from a bare `Status` via the range lookups below. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DdcError {
    #[error("DDC packet validation failed")]
    DdcData,
    #[error("monitor returned the DDC Null Message")]
    NullResponse,
    #[error("fragment offset or length violation in multi-part exchange")]
    MultiPartReadFragment,
    #[error("maximum retries exceeded")]
    Retries,
    #[error("monitor reported unsupported VCP feature")]
    ReportedUnsupported,
    #[error("read returned only zero bytes")]
    ReadAllZero,
    #[error("every retry attempt returned the Null Message")]
    AllResponsesNull,
    #[error("unsupported VCP feature inferred from monitor quirk")]
    DeterminedUnsupported,
    #[error("EDID read failed")]
    ReadEdid,
    #[error("EDID header or checksum invalid")]
    InvalidEdid,
    #[error("value read after set did not match value written")]
    Verify,
    #[error("display identifier did not resolve")]
    InvalidDisplay,
    #[error("display locked by another thread")]
    Locked,
    #[error("display already open in this thread")]
    AlreadyOpen,
    #[error("operation invalid for this feature")]
    InvalidOperation,
    #[error("not implemented")]
    Unimplemented,
    #[error("invalid argument")]
    Arg,
    #[error("invalid data")]
    BadData,
    #[error("unspecified error")]
    Other,
}

/* One row of the DDC-range lookup table. */
#[derive(Debug, Clone, Copy)]
pub struct StatusInfo {
    pub code: Status,
    pub name: &'static str,
    pub description: &'static str,
}

/* (variant, offset n, name, description).  Offsets are append-only: codes
 * are part of the public surface and must stay stable across releases. */
const DDC_STATUS_TABLE: &[(DdcError, i32, &str, &str)] = &[
    (DdcError::DdcData, 1, "DDCRC_DDC_DATA", "DDC packet validation failed"),
    (DdcError::NullResponse, 2, "DDCRC_NULL_RESPONSE", "received DDC Null Message"),
    (
        DdcError::MultiPartReadFragment,
        3,
        "DDCRC_MULTI_PART_READ_FRAGMENT",
        "multi-part fragment offset or length violation",
    ),
    (DdcError::Retries, 4, "DDCRC_RETRIES", "maximum retries exceeded"),
    (
        DdcError::ReportedUnsupported,
        5,
        "DDCRC_REPORTED_UNSUPPORTED",
        "monitor reported unsupported feature",
    ),
    (DdcError::ReadAllZero, 6, "DDCRC_READ_ALL_ZERO", "response contained only zero bytes"),
    (
        DdcError::AllResponsesNull,
        7,
        "DDCRC_ALL_RESPONSES_NULL",
        "all retry attempts returned the Null Message",
    ),
    (
        DdcError::DeterminedUnsupported,
        8,
        "DDCRC_DETERMINED_UNSUPPORTED",
        "unsupported feature inferred from monitor behavior",
    ),
    (DdcError::ReadEdid, 9, "DDCRC_READ_EDID", "EDID read failed"),
    (DdcError::InvalidEdid, 10, "DDCRC_INVALID_EDID", "EDID invalid"),
    (DdcError::Verify, 11, "DDCRC_VERIFY", "read after set did not match"),
    (DdcError::InvalidDisplay, 12, "DDCRC_INVALID_DISPLAY", "display not found"),
    (DdcError::Locked, 13, "DDCRC_LOCKED", "display locked by another thread"),
    (DdcError::AlreadyOpen, 14, "DDCRC_ALREADY_OPEN", "display already open in this thread"),
    (
        DdcError::InvalidOperation,
        15,
        "DDCRC_INVALID_OPERATION",
        "operation invalid for this feature",
    ),
    (DdcError::Unimplemented, 16, "DDCRC_UNIMPLEMENTED", "not implemented"),
    (DdcError::Arg, 17, "DDCRC_ARG", "invalid argument"),
    (DdcError::BadData, 18, "DDCRC_BAD_DATA", "invalid data"),
    (DdcError::Other, 19, "DDCRC_OTHER", "unspecified error"),
];

impl DdcError {
    /* The stable signed code for this error. */
    pub fn status(self) -> Status {
        for &(variant, offset, _, _) in DDC_STATUS_TABLE {
            if variant == self {
                return -(RCRANGE_DDC_START + offset);
            }
        }
        unreachable!("every variant has a table row")
    }

    /* The symbolic name, e.g. "DDCRC_NULL_RESPONSE". */
    pub fn name(self) -> &'static str {
        for &(variant, _, name, _) in DDC_STATUS_TABLE {
            if variant == self {
                return name;
            }
        }
        unreachable!("every variant has a table row")
    }

    pub fn from_status(status: Status) -> Option<Self> {
        let n = -status - RCRANGE_DDC_START;
        DDC_STATUS_TABLE
            .iter()
            .find(|&&(_, offset, _, _)| offset == n)
            .map(|&(variant, _, _, _)| variant)
    }
}

/* Convert a syscall failure into the unified space. */
pub fn errno_status(errno: Errno) -> Status {
    -(errno as i32)
}

fn in_errno_range(status: Status) -> bool {
    status < 0 && -status <= RCRANGE_ERRNO_MAX
}

fn in_ddc_range(status: Status) -> bool {
    -status >= RCRANGE_DDC_START && -status < RCRANGE_DDC_START + 1000
}

/* Short symbolic name for any status. */
pub fn status_name(status: Status) -> String {
    if status == DDCRC_OK {
        return "DDCRC_OK".to_string();
    }
    if status > 0 {
        return format!("ok({status})");
    }
    if in_errno_range(status) {
        return format!("-{:?}", Errno::from_raw(-status));
    }
    if in_ddc_range(status) {
        if let Some(err) = DdcError::from_status(status) {
            return err.name().to_string();
        }
    }
    format!("unknown_status({status})")
}

/* Human-readable description for any status. */
pub fn status_desc(status: Status) -> String {
    if status == DDCRC_OK {
        return "success".to_string();
    }
    if status > 0 {
        return format!("qualified success ({status})");
    }
    if in_errno_range(status) {
        return Errno::from_raw(-status).desc().to_string();
    }
    if in_ddc_range(status) {
        let n = -status - RCRANGE_DDC_START;
        if let Some(&(_, _, _, desc)) = DDC_STATUS_TABLE.iter().find(|&&(_, o, _, _)| o == n) {
            return desc.to_string();
        }
    }
    format!("unrecognized status code {status}")
}

/* Table-row view of a status in the DDC range. */
pub fn ddc_status_info(status: Status) -> Option<StatusInfo> {
    let n = -status - RCRANGE_DDC_START;
    DDC_STATUS_TABLE
        .iter()
        .find(|&&(_, offset, _, _)| offset == n)
        .map(|&(_, _, name, description)| StatusInfo { code: status, name, description })
}

/* True for codes that classify an observation rather than report a failure.
 * An "unsupported feature" answer is a successful determination about the
 * monitor, not a communication breakdown. */
pub fn status_is_not_error(status: Status) -> bool {
    matches!(
        DdcError::from_status(status),
        Some(
            DdcError::ReportedUnsupported
                | DdcError::DeterminedUnsupported
                | DdcError::AllResponsesNull
        )
    )
}

/* A node in the causal error tree.
 *
 * A retry-exhausted exchange is one node with one cause per attempt; a
 * multi-feature operation is one node with one cause per feature. */
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub status: Status,
    pub function: String,
    pub detail: String,
    pub causes: Vec<ErrorInfo>,
}

impl ErrorInfo {
    pub fn new(status: Status, function: &str, detail: impl Into<String>) -> Self {
        ErrorInfo {
            status,
            function: function.to_string(),
            detail: detail.into(),
            causes: Vec::new(),
        }
    }

    pub fn from_ddc(err: DdcError, function: &str, detail: impl Into<String>) -> Self {
        Self::new(err.status(), function, detail)
    }

    pub fn from_errno(errno: Errno, function: &str, detail: impl Into<String>) -> Self {
        Self::new(errno_status(errno), function, detail)
    }

    /* Wrap a cause in a new node, inheriting its status. */
    pub fn new_chained(cause: ErrorInfo, function: &str) -> Self {
        ErrorInfo {
            status: cause.status,
            function: function.to_string(),
            detail: String::new(),
            causes: vec![cause],
        }
    }

    pub fn new_with_causes(
        status: Status,
        function: &str,
        detail: impl Into<String>,
        causes: Vec<ErrorInfo>,
    ) -> Self {
        ErrorInfo { status, function: function.to_string(), detail: detail.into(), causes }
    }

    /* One line: name, origin, detail, and a collapsed causes summary. */
    pub fn summary(&self) -> String {
        let mut s = format!("{} in {}", status_name(self.status), self.function);
        if !self.detail.is_empty() {
            s.push_str(": ");
            s.push_str(&self.detail);
        }
        if !self.causes.is_empty() {
            let statuses: Vec<Status> = self.causes.iter().map(|c| c.status).collect();
            s.push_str(&format!(" [{}]", summarize_statuses(&statuses)));
        }
        s
    }

    /* Pretty-print the root, then each cause recursively with indentation. */
    pub fn report(&self) -> String {
        let mut out = String::new();
        self.report_into(&mut out, 0);
        out
    }

    fn report_into(&self, out: &mut String, depth: usize) {
        for _ in 0..depth {
            out.push_str("   ");
        }
        out.push_str(&self.summary_line());
        out.push('\n');
        for cause in &self.causes {
            cause.report_into(out, depth + 1);
        }
    }

    fn summary_line(&self) -> String {
        let mut s = format!("{} in {}", status_name(self.status), self.function);
        if !self.detail.is_empty() {
            s.push_str(": ");
            s.push_str(&self.detail);
        }
        s
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

impl std::error::Error for ErrorInfo {}

/* Collapse runs of identical statuses: [N,N,N,D] -> "DDCRC_NULL_RESPONSE(x3), DDCRC_DDC_DATA". */
pub fn summarize_statuses(statuses: &[Status]) -> String {
    if statuses.is_empty() {
        return "ok".to_string();
    }
    let mut parts: Vec<String> = Vec::new();
    let mut run_status = statuses[0];
    let mut run_len = 1usize;
    for &s in &statuses[1..] {
        if s == run_status {
            run_len += 1;
        } else {
            parts.push(format_run(run_status, run_len));
            run_status = s;
            run_len = 1;
        }
    }
    parts.push(format_run(run_status, run_len));
    parts.join(", ")
}

fn format_run(status: Status, len: usize) -> String {
    if len == 1 {
        status_name(status)
    } else {
        format!("{}(x{})", status_name(status), len)
    }
}
