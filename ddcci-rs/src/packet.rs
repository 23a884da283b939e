/* DDC/CI packet codec: request framing, XOR checksums, and response
 * parsing with the full validation pipeline.
 *
 * Every packet on the wire is framed as
 *   [dest_addr, src_addr, length | 0x80, payload..., checksum]
 * where the checksum XORs everything before it, both addresses included.
 * The destination byte never crosses the i2c-dev fd (the kernel emits the
 * address from the slave setting), but it participates in the checksum. */

use crate::status::{DdcError, ErrorInfo};

/* I2C slave addresses */
pub const I2C_ADDR_EDID: u16 = 0x50;
pub const I2C_ADDR_EDID_SEGMENT: u16 = 0x30;
pub const I2C_ADDR_DDC_CI: u16 = 0x37;

/* Destination byte of a host-to-monitor packet: 0x37 shifted for write. */
pub const DDC_DEST_BYTE: u8 = (I2C_ADDR_DDC_CI as u8) << 1;

/* Host source-address byte in requests. */
pub const DDC_HOST_SOURCE: u8 = 0x51;

/* Monitors compute reply checksums against this virtual host address
 * rather than the real one. */
pub const DDC_VIRTUAL_HOST: u8 = 0x50;

/* First byte of a monitor-to-host reply (host echo). */
pub const DDC_REPLY_SOURCE: u8 = 0x6e;

/* Request opcodes */
pub const OP_GET_VCP_REQUEST: u8 = 0x01;
pub const OP_SET_VCP_REQUEST: u8 = 0x03;
pub const OP_SAVE_SETTINGS: u8 = 0x0c;
pub const OP_IDENTIFICATION_REQUEST: u8 = 0xf1;
pub const OP_CAPABILITIES_REQUEST: u8 = 0xf3;
pub const OP_TABLE_READ_REQUEST: u8 = 0xe2;
pub const OP_TABLE_WRITE: u8 = 0xe7;

/* Reply opcodes */
pub const OP_GET_VCP_REPLY: u8 = 0x02;
pub const OP_IDENTIFICATION_REPLY: u8 = 0xe1;
pub const OP_CAPABILITIES_REPLY: u8 = 0xe3;
pub const OP_TABLE_READ_REPLY: u8 = 0xe4;

/* Maximum data bytes per multi-part fragment. */
pub const MAX_FRAGMENT_BYTES: usize = 32;

/* Worst-case reply buffer: src + length + (opcode + offset + 32 data) + checksum. */
pub const MAX_REPLY_LEN: usize = 2 + 3 + MAX_FRAGMENT_BYTES + 1;

/* XOR checksum over an iterator of bytes. */
pub fn checksum<I: IntoIterator<Item = u8>>(bytes: I) -> u8 {
    bytes.into_iter().fold(0u8, |acc, b| acc ^ b)
}

/* A framed DDC request.
 *
 * `bytes[0]` is the destination byte 0x6e; `wire_bytes()` strips it for
 * the actual write since the kernel supplies the slave address. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdcPacket {
    bytes: Vec<u8>,
}

impl DdcPacket {
    fn from_payload(payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= 36);
        let mut bytes = Vec::with_capacity(payload.len() + 4);
        bytes.push(DDC_DEST_BYTE);
        bytes.push(DDC_HOST_SOURCE);
        bytes.push(0x80 | payload.len() as u8);
        bytes.extend_from_slice(payload);
        let chk = checksum(bytes.iter().copied());
        bytes.push(chk);
        DdcPacket { bytes }
    }

    /* The full frame, destination byte included. */
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /* What actually goes to write(2) on the i2c fd. */
    pub fn wire_bytes(&self) -> &[u8] {
        &self.bytes[1..]
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[3..self.bytes.len() - 1]
    }
}

pub fn build_get_vcp_request(feature: u8) -> DdcPacket {
    DdcPacket::from_payload(&[OP_GET_VCP_REQUEST, feature])
}

pub fn build_set_vcp_request(feature: u8, value: u16) -> DdcPacket {
    DdcPacket::from_payload(&[
        OP_SET_VCP_REQUEST,
        feature,
        (value >> 8) as u8,
        (value & 0xff) as u8,
    ])
}

pub fn build_save_settings_request() -> DdcPacket {
    DdcPacket::from_payload(&[OP_SAVE_SETTINGS])
}

pub fn build_identification_request() -> DdcPacket {
    DdcPacket::from_payload(&[OP_IDENTIFICATION_REQUEST])
}

pub fn build_capabilities_request(offset: u16) -> DdcPacket {
    DdcPacket::from_payload(&[
        OP_CAPABILITIES_REQUEST,
        (offset >> 8) as u8,
        (offset & 0xff) as u8,
    ])
}

pub fn build_table_read_request(feature: u8, offset: u16) -> DdcPacket {
    DdcPacket::from_payload(&[
        OP_TABLE_READ_REQUEST,
        feature,
        (offset >> 8) as u8,
        (offset & 0xff) as u8,
    ])
}

pub fn build_table_write_request(feature: u8, offset: u16, data: &[u8]) -> DdcPacket {
    debug_assert!(data.len() <= MAX_FRAGMENT_BYTES);
    let mut payload = Vec::with_capacity(4 + data.len());
    payload.push(OP_TABLE_WRITE);
    payload.push(feature);
    payload.push((offset >> 8) as u8);
    payload.push((offset & 0xff) as u8);
    payload.extend_from_slice(data);
    DdcPacket::from_payload(&payload)
}

/* What kind of reply the current exchange expects. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedReply {
    VcpFeature { feature: u8 },
    Capabilities,
    TableRead { feature: u8 },
    Identification,
}

/* A parsed monitor reply. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdcReply {
    Vcp(NonTableVcpResponse),
    /* Capabilities or table-read fragment; empty data ends the sequence. */
    Fragment { offset: u16, data: Vec<u8> },
    Identification { data: Vec<u8> },
    /* The DDC Null Message: "I have nothing to say". */
    Null,
}

/* Decoded Get-VCP reply for a non-table feature. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonTableVcpResponse {
    pub valid_response: bool,
    pub supported_opcode: bool,
    pub feature_code: u8,
    pub value_type: u8,
    pub mh: u8,
    pub ml: u8,
    pub sh: u8,
    pub sl: u8,
}

pub const VCP_TYPE_CONTINUOUS: u8 = 0x00;
pub const VCP_TYPE_NON_CONTINUOUS: u8 = 0x01;

impl NonTableVcpResponse {
    pub fn max(&self) -> u16 {
        ((self.mh as u16) << 8) | self.ml as u16
    }

    pub fn cur(&self) -> u16 {
        ((self.sh as u16) << 8) | self.sl as u16
    }

    /* The mh=ml=sh=sl=0 answer some monitors give for features they do
     * not implement.  Whether it means "unsupported" depends on the
     * per-monitor quirk policy. */
    pub fn all_value_bytes_zero(&self) -> bool {
        self.mh == 0 && self.ml == 0 && self.sh == 0 && self.sl == 0
    }
}

fn ddc_data(detail: impl Into<String>) -> ErrorInfo {
    ErrorInfo::from_ddc(DdcError::DdcData, "parse_ddc_reply", detail)
}

/* Parse and validate a raw reply buffer.
 *
 * `buf` starts at the monitor's source byte as read from the fd.
 * `request` is the frame we sent, used for the read-equals-write check.
 *
 * Validation order: pathological buffers (all zero, echoed request,
 * doubled bytes), then framing (length bit, byte count, checksum), then
 * the opcode and feature-code echo against `expected`. */
pub fn parse_ddc_reply(
    buf: &[u8],
    expected: ExpectedReply,
    request: &DdcPacket,
) -> Result<DdcReply, ErrorInfo> {
    if buf.len() < 2 {
        return Err(ddc_data(format!("response too short: {} bytes", buf.len())));
    }

    if buf.iter().all(|&b| b == 0) {
        return Err(ErrorInfo::from_ddc(
            DdcError::ReadAllZero,
            "parse_ddc_reply",
            "response contained only zero bytes",
        ));
    }

    let wire = request.wire_bytes();
    if buf.len() >= wire.len() && &buf[..wire.len()] == wire {
        return Err(ddc_data("response echoes the request bytes"));
    }

    if is_double_byte(buf) {
        return Err(ddc_data("each response byte duplicated"));
    }

    if buf[1] & 0x80 == 0 {
        return Err(ddc_data(format!("length byte {:#04x} lacks the high bit", buf[1])));
    }

    let len = (buf[1] & 0x7f) as usize;
    if buf.len() < len + 3 {
        return Err(ddc_data(format!(
            "length field says {} payload bytes, buffer holds {}",
            len,
            buf.len().saturating_sub(3)
        )));
    }

    let expected_chk = checksum(
        std::iter::once(DDC_VIRTUAL_HOST).chain(buf[..2 + len].iter().copied()),
    );
    if buf[2 + len] != expected_chk {
        return Err(ddc_data(format!(
            "checksum {:#04x}, expected {:#04x}",
            buf[2 + len],
            expected_chk
        )));
    }

    if len == 0 {
        return Ok(DdcReply::Null);
    }

    let payload = &buf[2..2 + len];
    match expected {
        ExpectedReply::VcpFeature { feature } => parse_vcp_payload(payload, feature),
        ExpectedReply::Capabilities => parse_fragment_payload(payload, OP_CAPABILITIES_REPLY),
        ExpectedReply::TableRead { feature: _ } => {
            parse_fragment_payload(payload, OP_TABLE_READ_REPLY)
        }
        ExpectedReply::Identification => {
            if payload[0] != OP_IDENTIFICATION_REPLY {
                return Err(ddc_data(format!(
                    "opcode {:#04x}, expected identification reply {:#04x}",
                    payload[0], OP_IDENTIFICATION_REPLY
                )));
            }
            Ok(DdcReply::Identification { data: payload[1..].to_vec() })
        }
    }
}

fn parse_vcp_payload(payload: &[u8], requested_feature: u8) -> Result<DdcReply, ErrorInfo> {
    if payload[0] != OP_GET_VCP_REPLY {
        return Err(ddc_data(format!(
            "opcode {:#04x}, expected VCP reply {:#04x}",
            payload[0], OP_GET_VCP_REPLY
        )));
    }
    if payload.len() != 8 {
        return Err(ddc_data(format!("VCP reply payload is {} bytes, expected 8", payload.len())));
    }

    let supported = match payload[1] {
        0x00 => true,
        0x01 => false,
        rc => {
            return Err(ddc_data(format!("unrecognized VCP result code {rc:#04x}")));
        }
    };

    /* A supported reply must echo the requested feature.  An unsupported
     * reply often echoes garbage, so only the supported path checks. */
    if supported && payload[2] != requested_feature {
        return Err(ddc_data(format!(
            "feature echo {:#04x}, requested {:#04x}",
            payload[2], requested_feature
        )));
    }

    Ok(DdcReply::Vcp(NonTableVcpResponse {
        valid_response: true,
        supported_opcode: supported,
        feature_code: payload[2],
        value_type: payload[3],
        mh: payload[4],
        ml: payload[5],
        sh: payload[6],
        sl: payload[7],
    }))
}

fn parse_fragment_payload(payload: &[u8], expected_opcode: u8) -> Result<DdcReply, ErrorInfo> {
    if payload[0] != expected_opcode {
        return Err(ddc_data(format!(
            "opcode {:#04x}, expected fragment reply {:#04x}",
            payload[0], expected_opcode
        )));
    }
    if payload.len() < 3 {
        return Err(ddc_data(format!(
            "fragment payload is {} bytes, minimum 3",
            payload.len()
        )));
    }
    let offset = ((payload[1] as u16) << 8) | payload[2] as u16;
    Ok(DdcReply::Fragment { offset, data: payload[3..].to_vec() })
}

/* Monitors that cannot answer sometimes return every byte doubled. */
fn is_double_byte(buf: &[u8]) -> bool {
    if buf.len() < 4 || buf.len() % 2 != 0 {
        return false;
    }
    buf.chunks_exact(2).all(|pair| pair[0] == pair[1])
}
