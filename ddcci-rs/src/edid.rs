/* EDID retrieval and parsing.
 *
 * The 128-byte EDID block lives behind I2C address 0x50.  Some monitors
 * only answer bytewise, some need a zero-byte write to reset the EEPROM
 * pointer first, some serve 256 bytes with the real EDID in the second
 * block.  The reader walks a fixed table of option combinations until
 * one produces a block that validates. */

use tracing::{debug, warn};

use crate::i2c_io::BusIo;
use crate::packet::I2C_ADDR_EDID;
use crate::status::{DdcError, ErrorInfo};

pub const EDID_BLOCK_SIZE: usize = 128;

static DEFAULT_READ_SIZE: std::sync::atomic::AtomicUsize =
    std::sync::atomic::AtomicUsize::new(EDID_BLOCK_SIZE);

/* Process-wide default for how many bytes detection reads at 0x50. */
pub fn set_edid_read_size(size: usize) -> Result<(), ErrorInfo> {
    if size != EDID_BLOCK_SIZE && size != 2 * EDID_BLOCK_SIZE {
        return Err(ErrorInfo::from_ddc(
            DdcError::Arg,
            "set_edid_read_size",
            format!("size {size} is neither 128 nor 256"),
        ));
    }
    DEFAULT_READ_SIZE.store(size, std::sync::atomic::Ordering::Relaxed);
    Ok(())
}

pub fn edid_read_size() -> usize {
    DEFAULT_READ_SIZE.load(std::sync::atomic::Ordering::Relaxed)
}

const EDID_HEADER: [u8; 8] = [0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];

/* CEA-861 extension tag in the second block of a 256-byte read. */
const CEA_EXTENSION_TAG: u8 = 0x02;

/* How a single EDID read attempt is performed. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdidReadOptions {
    pub bytewise: bool,
    pub write_before_read: bool,
    pub read_size: usize,
}

impl Default for EdidReadOptions {
    fn default() -> Self {
        EdidReadOptions { bytewise: false, write_before_read: false, read_size: EDID_BLOCK_SIZE }
    }
}

/* Attempt sequence: bulk first, then the workarounds. */
const ATTEMPT_OPTIONS: [(bool, bool); 4] =
    [(false, false), (true, true), (false, true), (true, false)];

/* Fields carried forward from a validated EDID block. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEdid {
    pub raw: Vec<u8>,
    pub mfg_id: String,
    pub model_name: String,
    pub serial_ascii: String,
    pub product_code: u16,
    pub serial_number: u32,
    pub is_digital_input: bool,
}

/* Read and validate the EDID, trying up to four option combinations.
 * `base.read_size` is honored on every attempt; the bytewise and
 * write-before-read toggles cycle through the attempt table. */
pub(crate) fn read_edid(bus: &mut BusIo, base: EdidReadOptions) -> Result<ParsedEdid, ErrorInfo> {
    let mut causes = Vec::new();

    for (attempt, &(bytewise, write_before_read)) in ATTEMPT_OPTIONS.iter().enumerate() {
        let opts = EdidReadOptions { bytewise, write_before_read, read_size: base.read_size };
        debug!("EDID read attempt {} with {:?}", attempt + 1, opts);

        match read_edid_once(bus, opts) {
            Ok(bytes) => match select_and_parse(&bytes) {
                Ok(parsed) => {
                    debug!(
                        "EDID valid on attempt {}: {} {} product {:#06x}",
                        attempt + 1,
                        parsed.mfg_id,
                        parsed.model_name,
                        parsed.product_code
                    );
                    return Ok(parsed);
                }
                Err(e) => causes.push(e),
            },
            Err(errno) => {
                causes.push(ErrorInfo::from_errno(
                    errno,
                    "read_edid_once",
                    format!("attempt {}", attempt + 1),
                ));
            }
        }
    }

    Err(ErrorInfo::new_with_causes(
        DdcError::ReadEdid.status(),
        "read_edid",
        format!("no valid EDID after {} attempts", ATTEMPT_OPTIONS.len()),
        causes,
    ))
}

fn read_edid_once(bus: &mut BusIo, opts: EdidReadOptions) -> Result<Vec<u8>, nix::errno::Errno> {
    bus.set_addr(I2C_ADDR_EDID)?;

    let mut bytes = vec![0u8; opts.read_size];
    if opts.write_before_read && !opts.bytewise {
        /* Pointer reset and bulk read as one combined transaction. */
        bus.write_then_read(I2C_ADDR_EDID, &[0x00], &mut bytes)?;
        return Ok(bytes);
    }

    if opts.write_before_read {
        /* Reset the EEPROM's internal pointer to offset 0. */
        bus.write_bytes(I2C_ADDR_EDID, &[0x00])?;
    }

    if opts.bytewise {
        let mut one = [0u8; 1];
        for byte in bytes.iter_mut() {
            bus.read_bytes(I2C_ADDR_EDID, &mut one)?;
            *byte = one[0];
        }
    } else {
        bus.read_bytes(I2C_ADDR_EDID, &mut bytes)?;
    }
    Ok(bytes)
}

/* Pick the block that carries the EDID out of a 128- or 256-byte read
 * and parse it. */
fn select_and_parse(bytes: &[u8]) -> Result<ParsedEdid, ErrorInfo> {
    if bytes.len() >= EDID_BLOCK_SIZE && validate_block(&bytes[..EDID_BLOCK_SIZE]).is_ok() {
        if bytes.len() >= 2 * EDID_BLOCK_SIZE {
            let ext = &bytes[EDID_BLOCK_SIZE..2 * EDID_BLOCK_SIZE];
            if ext[0] == CEA_EXTENSION_TAG {
                debug!("EDID carries a CEA-861 extension block");
            }
        }
        return parse_edid(&bytes[..EDID_BLOCK_SIZE]);
    }

    /* Some monitors serve the real EDID in the second half of a 256-byte
     * read. */
    if bytes.len() >= 2 * EDID_BLOCK_SIZE {
        let second = &bytes[EDID_BLOCK_SIZE..2 * EDID_BLOCK_SIZE];
        if validate_block(second).is_ok() {
            warn!("EDID found in block 1 of a 256-byte read, using it as block 0");
            return parse_edid(second);
        }
    }

    validate_block(&bytes[..bytes.len().min(EDID_BLOCK_SIZE)])?;
    unreachable!("validate_block rejected the block above")
}

fn validate_block(block: &[u8]) -> Result<(), ErrorInfo> {
    if block.len() < EDID_BLOCK_SIZE {
        return Err(ErrorInfo::from_ddc(
            DdcError::InvalidEdid,
            "validate_block",
            format!("{} bytes, expected {}", block.len(), EDID_BLOCK_SIZE),
        ));
    }
    if block[..8] != EDID_HEADER {
        return Err(ErrorInfo::from_ddc(
            DdcError::InvalidEdid,
            "validate_block",
            format!("bad header {:02x?}", &block[..8]),
        ));
    }
    let sum: u8 = block.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != 0 {
        return Err(ErrorInfo::from_ddc(
            DdcError::InvalidEdid,
            "validate_block",
            format!("checksum residue {sum:#04x}"),
        ));
    }
    Ok(())
}

/* Parse a validated 128-byte block. */
pub fn parse_edid(block: &[u8]) -> Result<ParsedEdid, ErrorInfo> {
    validate_block(block)?;

    let mfg_id = decode_pnp_id(((block[8] as u16) << 8) | block[9] as u16);
    let product_code = u16::from_le_bytes([block[10], block[11]]);
    let serial_number = u32::from_le_bytes([block[12], block[13], block[14], block[15]]);
    let is_digital_input = block[20] & 0x80 != 0;

    let mut model_name = String::new();
    let mut serial_ascii = String::new();
    for k in 0..4 {
        let d = &block[54 + 18 * k..54 + 18 * (k + 1)];
        /* Display descriptors start with a zero pixel clock. */
        if d[0] != 0 || d[1] != 0 || d[2] != 0 {
            continue;
        }
        match d[3] {
            0xfc => model_name = decode_descriptor_text(&d[5..18]),
            0xff => serial_ascii = decode_descriptor_text(&d[5..18]),
            _ => {}
        }
    }

    Ok(ParsedEdid {
        raw: block.to_vec(),
        mfg_id,
        model_name,
        serial_ascii,
        product_code,
        serial_number,
        is_digital_input,
    })
}

/* Three five-bit letters, 'A' encoded as 1. */
fn decode_pnp_id(word: u16) -> String {
    let letters = [(word >> 10) & 0x1f, (word >> 5) & 0x1f, word & 0x1f];
    letters
        .iter()
        .map(|&l| {
            if (1..=26).contains(&l) {
                (b'A' + (l as u8) - 1) as char
            } else {
                '?'
            }
        })
        .collect()
}

/* Descriptor text ends at the first 0x0A and pads with spaces. */
fn decode_descriptor_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0x0a).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}
