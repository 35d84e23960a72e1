//! APDU construction and the ISO 7816 / PIV wire constants

use zeroize::Zeroizing;

// Class bytes
pub(crate) const CLA_ISO: u8 = 0x00;
pub(crate) const CLA_CHAIN: u8 = 0x10;

// Instructions
pub(crate) const INS_SELECT: u8 = 0xA4;
pub(crate) const INS_VERIFY: u8 = 0x20;
pub(crate) const INS_CHANGE_PIN: u8 = 0x24;
pub(crate) const INS_GET_DATA: u8 = 0xCB;
pub(crate) const INS_PUT_DATA: u8 = 0xDB;
pub(crate) const INS_GEN_ASYM: u8 = 0x47;
pub(crate) const INS_GEN_AUTH: u8 = 0x87;
pub(crate) const INS_CONTINUE: u8 = 0xC0;
pub(crate) const INS_GET_VER: u8 = 0xFD;

// SELECT P1: select application by AID
pub(crate) const SEL_APP_AID: u8 = 0x04;

// Status words
pub(crate) const SW_NO_ERROR: u16 = 0x9000;
pub(crate) const SW_BYTES_REMAINING_00: u16 = 0x6100;
pub(crate) const SW_WARNING_NO_CHANGE_00: u16 = 0x6200;
pub(crate) const SW_WARNING_00: u16 = 0x6300;
pub(crate) const SW_INCORRECT_PIN: u16 = 0x63C0;
pub(crate) const SW_WRONG_DATA: u16 = 0x6A80;
pub(crate) const SW_FUNC_NOT_SUPPORTED: u16 = 0x6A81;
pub(crate) const SW_FILE_NOT_FOUND: u16 = 0x6A82;
pub(crate) const SW_OUT_OF_MEMORY: u16 = 0x6A84;
pub(crate) const SW_INCORRECT_P1P2: u16 = 0x6B00;
pub(crate) const SW_SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;

/// Largest reply to a single short APDU exchange: 256 data bytes,
/// the status word, and a little slack for quirky readers.
pub(crate) const SHORT_APDU_REPLY: usize = 261;

/// Reply buffer size used when response chaining may occur. Bounds the
/// largest PIV data object this library will reassemble.
pub(crate) const MAX_APDU_REPLY: usize = 16384;

/// One command/response APDU exchange.
///
/// The reply buffer is written at `reply_off`; after chaining,
/// `(reply_off, reply_len)` spans the reassembled reply. Command and
/// reply buffers may carry key material and are wiped on drop.
pub(crate) struct Apdu {
    pub cls: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    cmd: Zeroizing<Vec<u8>>,
    pub cmd_off: usize,
    pub cmd_len: usize,
    pub reply: Zeroizing<Vec<u8>>,
    pub reply_off: usize,
    pub reply_len: usize,
    pub sw: u16,
}

impl Apdu {
    pub fn new(cls: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Apdu {
            cls,
            ins,
            p1,
            p2,
            cmd: Zeroizing::new(Vec::new()),
            cmd_off: 0,
            cmd_len: 0,
            reply: Zeroizing::new(Vec::new()),
            reply_off: 0,
            reply_len: 0,
            sw: 0,
        }
    }

    /// Attach command data; the transmit window initially covers all of it.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.cmd_off = 0;
        self.cmd_len = data.len();
        self.cmd = Zeroizing::new(data);
    }

    pub fn clear_data(&mut self) {
        self.cmd = Zeroizing::new(Vec::new());
        self.cmd_off = 0;
        self.cmd_len = 0;
    }

    pub fn data_len(&self) -> usize {
        self.cmd.len()
    }

    /// Serialize the header and the current command window as a
    /// short-form APDU. Extended APDUs are not supported; a window
    /// larger than 255 bytes is a programmer error.
    pub fn encode(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(5 + self.cmd_len));
        out.push(self.cls);
        out.push(self.ins);
        out.push(self.p1);
        out.push(self.p2);
        if self.cmd_len == 0 {
            out.push(0x00);
        } else {
            assert!(self.cmd_len <= 0xFF, "short APDU data over 255 bytes");
            out.push(self.cmd_len as u8);
            out.extend_from_slice(&self.cmd[self.cmd_off..self.cmd_off + self.cmd_len]);
        }
        out
    }

    /// Grow the reply buffer to at least `cap` bytes.
    pub fn ensure_reply(&mut self, cap: usize) {
        if self.reply.len() < cap {
            self.reply.resize(cap, 0);
        }
    }

    /// The reassembled reply data (status word excluded).
    pub fn reply_data(&self) -> &[u8] {
        &self.reply[self.reply_off..self.reply_off + self.reply_len]
    }

    /// High byte of the last status word.
    pub fn sw_hi(&self) -> u8 {
        (self.sw >> 8) as u8
    }
}
