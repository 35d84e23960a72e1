//! PIV command surface over an open transaction
//!
//! Implements SELECT, GET/PUT DATA, GENERATE ASYMMETRIC, GENERAL
//! AUTHENTICATE (admin challenge/response, signing, ECDH), VERIFY and
//! CHANGE REFERENCE DATA per NIST SP 800-73, plus the YubiKey version
//! probe. All operations assume the caller holds a `Transaction`.

use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use rsa::{BigUint, RsaPublicKey};
use sha2::Digest;
use zeroize::Zeroizing;

use crate::apdu::{
    Apdu, CLA_ISO, INS_CHANGE_PIN, INS_GEN_ASYM, INS_GEN_AUTH, INS_GET_DATA, INS_GET_VER,
    INS_PUT_DATA, INS_SELECT, INS_VERIFY, SEL_APP_AID, SW_FILE_NOT_FOUND, SW_FUNC_NOT_SUPPORTED,
    SW_INCORRECT_P1P2, SW_INCORRECT_PIN, SW_NO_ERROR, SW_OUT_OF_MEMORY,
    SW_SECURITY_STATUS_NOT_SATISFIED, SW_WRONG_DATA,
};
use crate::error::{Error, Result};
use crate::keys::{self, PublicKey};
use crate::tlv::{TlvReader, TlvWriter};
use crate::token::{Slot, Transaction};

/// PIV application identifier
pub const PIV_AID: [u8; 11] = [
    0xA0, 0x00, 0x00, 0x03, 0x08, 0x00, 0x00, 0x10, 0x00, 0x01, 0x00,
];

/// Well-known default PIV administrative (management) key
pub const DEFAULT_ADMIN_KEY: [u8; 24] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
    0x08, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
];

/// Card management key reference (not an asymmetric key slot)
pub const SLOT_ADMIN: u8 = 0x9B;

// Application property template tags (SELECT reply)
const PIV_TAG_APT: u32 = 0x61;
const PIV_TAG_AID: u32 = 0x4F;
const PIV_TAG_AUTHORITY: u32 = 0x79;
const PIV_TAG_APP_LABEL: u32 = 0x50;
const PIV_TAG_URI: u32 = 0x5F50;
const PIV_TAG_ALGS: u32 = 0xAC;

// Data object tags
pub(crate) const PIV_TAG_CHUID: u32 = 0x5FC102;
pub(crate) const PIV_TAG_CERT_9A: u32 = 0x5FC105;
pub(crate) const PIV_TAG_CERT_9C: u32 = 0x5FC10A;
pub(crate) const PIV_TAG_CERT_9D: u32 = 0x5FC10B;
pub(crate) const PIV_TAG_CERT_9E: u32 = 0x5FC101;

// GENERAL AUTHENTICATE dynamic authentication template tags
const GA_TAG_WITNESS: u32 = 0x80;
const GA_TAG_CHALLENGE: u32 = 0x81;
const GA_TAG_RESPONSE: u32 = 0x82;
const GA_TAG_EXP: u32 = 0x85;

// Certificate info byte (tag 0x71)
const CI_COMPTYPE_MASK: u8 = 0x03;
const CI_COMP_NONE: u8 = 0x00;
const CI_X509: u8 = 0x04;

/// Asymmetric key slots addressed by this library.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotId {
    /// 9A, PIV authentication
    Authentication = 0x9A,
    /// 9C, digital signature
    Signature = 0x9C,
    /// 9D, key management
    KeyManagement = 0x9D,
    /// 9E, card authentication
    CardAuthentication = 0x9E,
}

impl SlotId {
    pub fn from_u8(v: u8) -> Option<SlotId> {
        match v {
            0x9A => Some(SlotId::Authentication),
            0x9C => Some(SlotId::Signature),
            0x9D => Some(SlotId::KeyManagement),
            0x9E => Some(SlotId::CardAuthentication),
            _ => None,
        }
    }

    pub(crate) fn cert_tag(&self) -> u32 {
        match self {
            SlotId::Authentication => PIV_TAG_CERT_9A,
            SlotId::Signature => PIV_TAG_CERT_9C,
            SlotId::KeyManagement => PIV_TAG_CERT_9D,
            SlotId::CardAuthentication => PIV_TAG_CERT_9E,
        }
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}", *self as u8)
    }
}

/// PIV algorithm identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Algorithm {
    TripleDes = 0x03,
    Rsa1024 = 0x06,
    Rsa2048 = 0x07,
    Aes128 = 0x08,
    Aes192 = 0x0A,
    Aes256 = 0x0C,
    EccP256 = 0x11,
    EccP384 = 0x14,
    /// Vendor extension: P-256 with SHA-1 computed on the card
    EccP256Sha1 = 0xF0,
    /// Vendor extension: P-256 with SHA-256 computed on the card
    EccP256Sha256 = 0xF2,
}

impl Algorithm {
    pub fn from_u8(v: u8) -> Option<Algorithm> {
        match v {
            0x03 => Some(Algorithm::TripleDes),
            0x06 => Some(Algorithm::Rsa1024),
            0x07 => Some(Algorithm::Rsa2048),
            0x08 => Some(Algorithm::Aes128),
            0x0A => Some(Algorithm::Aes192),
            0x0C => Some(Algorithm::Aes256),
            0x11 => Some(Algorithm::EccP256),
            0x14 => Some(Algorithm::EccP384),
            0xF0 => Some(Algorithm::EccP256Sha1),
            0xF2 => Some(Algorithm::EccP256Sha256),
            _ => None,
        }
    }
}

/// Hash algorithms accepted by the signing path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgo {
    Sha1,
    Sha256,
    Sha384,
}

impl HashAlgo {
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha384 => 48,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgo::Sha1 => sha1::Sha1::digest(data).to_vec(),
            HashAlgo::Sha256 => sha2::Sha256::digest(data).to_vec(),
            HashAlgo::Sha384 => sha2::Sha384::digest(data).to_vec(),
        }
    }

    /// SHA-1 stays as requested; everything else upgrades to SHA-256.
    fn coerced(self) -> HashAlgo {
        if self == HashAlgo::Sha1 {
            HashAlgo::Sha1
        } else {
            HashAlgo::Sha256
        }
    }
}

// DER AlgorithmIdentifier + OCTET STRING header preceding the digest in
// a PKCS#1 v1.5 DigestInfo.
const DI_PREFIX_SHA1: &[u8] = &[
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2B, 0x0E, 0x03, 0x02, 0x1A, 0x05, 0x00, 0x04, 0x14,
];
const DI_PREFIX_SHA256: &[u8] = &[
    0x30, 0x31, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];
const DI_PREFIX_SHA384: &[u8] = &[
    0x30, 0x41, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02,
    0x05, 0x00, 0x04, 0x30,
];

pub(crate) fn digest_info(hash: HashAlgo, digest: &[u8]) -> Vec<u8> {
    let prefix = match hash {
        HashAlgo::Sha1 => DI_PREFIX_SHA1,
        HashAlgo::Sha256 => DI_PREFIX_SHA256,
        HashAlgo::Sha384 => DI_PREFIX_SHA384,
    };
    debug_assert_eq!(prefix[prefix.len() - 1] as usize, digest.len());
    let mut out = Vec::with_capacity(prefix.len() + digest.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(digest);
    out
}

/// EMSA-PKCS1-v1_5: `00 01 FF .. FF 00 || T`, sized to the modulus.
pub(crate) fn pkcs1_v15_pad(t: &[u8], modulus_len: usize) -> Result<Vec<u8>> {
    if t.len() + 11 > modulus_len {
        return Err(Error::Invalid(format!(
            "DigestInfo of {} bytes does not fit a {}-byte modulus",
            t.len(),
            modulus_len
        )));
    }
    let mut out = vec![0xFF; modulus_len];
    out[0] = 0x00;
    out[1] = 0x01;
    out[modulus_len - t.len() - 1] = 0x00;
    out[modulus_len - t.len()..].copy_from_slice(t);
    Ok(out)
}

/// 3DES-CBC with a zero IV, the PIV admin challenge transform.
pub(crate) fn tdes_cbc_encrypt(key: &[u8], data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if data.is_empty() || data.len() % 8 != 0 {
        return Err(Error::Invalid(format!(
            "3DES input of {} bytes is not block-aligned",
            data.len()
        )));
    }
    let mut enc = cbc::Encryptor::<des::TdesEde3>::new_from_slices(key, &[0u8; 8])
        .map_err(|_| Error::Invalid("admin key must be 24 bytes".into()))?;
    let mut out = Zeroizing::new(data.to_vec());
    for block in out.chunks_exact_mut(8) {
        enc.encrypt_block_mut(cbc::cipher::Block::<cbc::Encryptor<des::TdesEde3>>::from_mut_slice(
            block,
        ));
    }
    Ok(out)
}

/// 0xFF-pad a PIN to the 8-byte VERIFY format.
fn encode_pin(pin: &str) -> Result<Zeroizing<[u8; 8]>> {
    let bytes = pin.as_bytes();
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(Error::Invalid(format!(
            "PIN must be 1 to 8 bytes, got {}",
            bytes.len()
        )));
    }
    let mut buf = Zeroizing::new([0xFFu8; 8]);
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

fn parse_ga_response(reply: &[u8]) -> Result<Vec<u8>> {
    let mut r = TlvReader::new(reply);
    if r.read_tag()? != 0x7C {
        return Err(Error::Unsupported(
            "GENERAL AUTHENTICATE reply is not a dynamic auth template".into(),
        ));
    }
    if r.read_tag()? != GA_TAG_RESPONSE {
        return Err(Error::Unsupported(
            "GENERAL AUTHENTICATE reply carries no response value".into(),
        ));
    }
    let out = r.read_remaining().to_vec();
    r.end()?;
    r.end()?;
    Ok(out)
}

impl Transaction<'_> {
    /// SELECT the PIV applet and record the card's declared algorithms.
    pub fn select(&mut self) -> Result<()> {
        let mut apdu = Apdu::new(CLA_ISO, INS_SELECT, SEL_APP_AID, 0x00);
        apdu.set_data(PIV_AID.to_vec());
        self.transceive(&mut apdu)?;

        if apdu.sw != SW_NO_ERROR {
            log::debug!(
                "{}: card did not accept SELECT for PIV (sw {:04x})",
                self.state.reader,
                apdu.sw
            );
            return Err(Error::NotFound("no PIV applet on card"));
        }

        let mut r = TlvReader::new(apdu.reply_data());
        if r.read_tag()? != PIV_TAG_APT {
            return Err(Error::Unsupported(
                "SELECT reply is not an application property template".into(),
            ));
        }
        while !r.at_end() {
            let tag = r.read_tag()?;
            match tag {
                PIV_TAG_AID | PIV_TAG_AUTHORITY | PIV_TAG_APP_LABEL | PIV_TAG_URI => r.skip(),
                PIV_TAG_ALGS => {
                    if !self.state.algs.is_empty() {
                        r.skip();
                        continue;
                    }
                    while !r.at_end() {
                        let t = r.read_tag()?;
                        if t == 0x80 {
                            let alg = r.read_uint()?;
                            self.state.push_alg(alg as u8);
                            r.end()?;
                        } else if t == 0x06 {
                            r.skip();
                        } else {
                            return Err(Error::Unsupported(format!(
                                "tag {:#04x} in algorithm list",
                                t
                            )));
                        }
                    }
                    r.end()?;
                }
                other => {
                    log::debug!(
                        "{}: unknown tag {:#x} in SELECT reply",
                        self.state.reader,
                        other
                    );
                    return Err(Error::Unsupported(format!(
                        "tag {:#x} in application property template",
                        other
                    )));
                }
            }
        }
        r.end()?;
        Ok(())
    }

    /// Read the CHUID file and record the 16-byte card GUID.
    pub fn read_chuid(&mut self) -> Result<()> {
        let obj = self.read_file(PIV_TAG_CHUID)?;
        let mut r = TlvReader::new(&obj);
        while !r.at_end() {
            let tag = r.read_tag()?;
            match tag {
                // buffer length, FASC-N, org ident, DUNS, expiry,
                // cardholder UUID, signature, CRC
                0xEE | 0x30 | 0x32 | 0x33 | 0x35 | 0x36 | 0x3E | 0xFE => r.skip(),
                0x34 => {
                    if r.rem() != 16 {
                        return Err(Error::Invalid(format!(
                            "CHUID GUID is {} bytes, wanted 16",
                            r.rem()
                        )));
                    }
                    let mut guid = [0u8; 16];
                    r.read(&mut guid)?;
                    r.end()?;
                    self.state.guid = guid;
                }
                other => {
                    return Err(Error::Unsupported(format!("tag {:#04x} in CHUID", other)));
                }
            }
        }
        Ok(())
    }

    /// Try the YubiKey GET VERSION vendor command. Cards that do not
    /// answer it are simply not YubiKeys; only transport failures error.
    pub fn probe_yk_version(&mut self) -> Result<()> {
        let mut apdu = Apdu::new(CLA_ISO, INS_GET_VER, 0x00, 0x00);
        self.transceive(&mut apdu)?;
        if apdu.sw == SW_NO_ERROR && apdu.reply_len >= 3 {
            let reply = apdu.reply_data();
            self.state.ykver = [reply[0], reply[1], reply[2]];
            self.state.ykpiv = true;
            log::debug!(
                "{}: YubiKey applet version {}.{}.{}",
                self.state.reader,
                reply[0],
                reply[1],
                reply[2]
            );
        } else {
            self.state.ykpiv = false;
        }
        Ok(())
    }

    /// Authenticate with the 24-byte 3DES admin (management) key.
    pub fn auth_admin(&mut self, key: &[u8]) -> Result<()> {
        if key.len() != 24 {
            return Err(Error::Invalid(format!(
                "admin key must be 24 bytes, got {}",
                key.len()
            )));
        }

        let mut tlv = TlvWriter::new();
        tlv.push(0x7C);
        tlv.push(GA_TAG_WITNESS);
        tlv.pop();
        tlv.pop();
        let mut apdu = Apdu::new(CLA_ISO, INS_GEN_AUTH, Algorithm::TripleDes as u8, SLOT_ADMIN);
        apdu.set_data(tlv.into_bytes());
        self.transceive(&mut apdu)?;

        if apdu.sw != SW_NO_ERROR {
            log::debug!(
                "{}: card returned no admin challenge (sw {:04x})",
                self.state.reader,
                apdu.sw
            );
            return Err(Error::Invalid(format!(
                "admin challenge request rejected, status {:04x}",
                apdu.sw
            )));
        }

        let mut challenge: Option<Zeroizing<Vec<u8>>> = None;
        {
            let mut r = TlvReader::new(apdu.reply_data());
            if r.read_tag()? != 0x7C {
                return Err(Error::Unsupported(
                    "admin challenge reply is not a dynamic auth template".into(),
                ));
            }
            while !r.at_end() {
                let tag = r.read_tag()?;
                if tag == GA_TAG_WITNESS {
                    challenge = Some(Zeroizing::new(r.read_remaining().to_vec()));
                    r.end()?;
                } else {
                    r.skip();
                }
            }
            r.end()?;
        }
        let challenge =
            challenge.ok_or_else(|| Error::Invalid("card sent no admin challenge".into()))?;
        let response = tdes_cbc_encrypt(key, &challenge)?;

        let mut tlv = TlvWriter::new();
        tlv.push(0x7C);
        tlv.push(GA_TAG_RESPONSE);
        tlv.write(&response);
        tlv.pop();
        tlv.pop();

        // the card's security state may change from here on
        self.reset = true;

        let mut apdu = Apdu::new(CLA_ISO, INS_GEN_AUTH, Algorithm::TripleDes as u8, SLOT_ADMIN);
        apdu.set_data(tlv.into_bytes());
        self.transceive(&mut apdu)?;

        match apdu.sw {
            SW_NO_ERROR => Ok(()),
            SW_INCORRECT_P1P2 => Err(Error::NotFound("card has no admin key")),
            SW_WRONG_DATA => Err(Error::Permission("admin key rejected")),
            sw => Err(Error::Invalid(format!(
                "admin response rejected, status {:04x}",
                sw
            ))),
        }
    }

    /// Verify the card PIN.
    ///
    /// With `min_retries` set, the retry counter is queried first and
    /// the PIN is withheld when no more than that many attempts remain,
    /// so a stored-but-stale PIN cannot burn the last try.
    pub fn verify_pin(&mut self, pin: &str, min_retries: Option<u8>) -> Result<()> {
        let pinbuf = encode_pin(pin)?;

        if let Some(min) = min_retries.filter(|m| *m > 0) {
            let mut apdu = Apdu::new(CLA_ISO, INS_VERIFY, 0x00, 0x80);
            self.transceive(&mut apdu)?;
            if apdu.sw & 0xFFF0 == SW_INCORRECT_PIN {
                let remaining = (apdu.sw & 0x000F) as u8;
                if remaining <= min {
                    return Err(Error::RetriesTooLow { retries: remaining });
                }
            } else {
                return Err(Error::Invalid(format!(
                    "retry counter query returned {:04x}",
                    apdu.sw
                )));
            }
        }

        let mut apdu = Apdu::new(CLA_ISO, INS_VERIFY, 0x00, 0x80);
        apdu.set_data(pinbuf.to_vec());
        self.transceive(&mut apdu)?;

        match apdu.sw {
            SW_NO_ERROR => {
                self.reset = true;
                Ok(())
            }
            sw if sw & 0xFFF0 == SW_INCORRECT_PIN => Err(Error::IncorrectPin {
                retries: (sw & 0x000F) as u8,
            }),
            sw => {
                log::debug!(
                    "{}: card did not accept VERIFY (sw {:04x})",
                    self.state.reader,
                    sw
                );
                Err(Error::Invalid(format!("VERIFY rejected, status {:04x}", sw)))
            }
        }
    }

    /// Change the card PIN.
    pub fn change_pin(&mut self, pin: &str, new_pin: &str) -> Result<()> {
        let old = encode_pin(pin)?;
        let new = encode_pin(new_pin)?;
        let mut buf = Zeroizing::new(Vec::with_capacity(16));
        buf.extend_from_slice(&*old);
        buf.extend_from_slice(&*new);

        let mut apdu = Apdu::new(CLA_ISO, INS_CHANGE_PIN, 0x00, 0x80);
        apdu.set_data(buf.to_vec());
        self.transceive(&mut apdu)?;

        match apdu.sw {
            SW_NO_ERROR => {
                self.reset = true;
                Ok(())
            }
            sw if sw & 0xFFF0 == SW_INCORRECT_PIN => Err(Error::IncorrectPin {
                retries: (sw & 0x000F) as u8,
            }),
            sw => {
                log::debug!(
                    "{}: card did not accept CHANGE REFERENCE DATA (sw {:04x})",
                    self.state.reader,
                    sw
                );
                Err(Error::Invalid(format!(
                    "CHANGE REFERENCE DATA rejected, status {:04x}",
                    sw
                )))
            }
        }
    }

    /// Read a PIV data object, returning the contents of its 0x53
    /// container.
    pub fn read_file(&mut self, tag: u32) -> Result<Vec<u8>> {
        let mut tlv = TlvWriter::new();
        tlv.push(0x5C);
        tlv.write_uint(tag);
        tlv.pop();
        let mut apdu = Apdu::new(CLA_ISO, INS_GET_DATA, 0x3F, 0xFF);
        apdu.set_data(tlv.into_bytes());
        self.transceive_chain(&mut apdu)?;

        match apdu.sw {
            SW_NO_ERROR => {
                let mut r = TlvReader::new(apdu.reply_data());
                let t = r.read_tag()?;
                if t != 0x53 {
                    log::debug!(
                        "{}: GET DATA reply opened with tag {:#x}",
                        self.state.reader,
                        t
                    );
                    return Err(Error::Unsupported(format!(
                        "tag {:#x} in GET DATA reply",
                        t
                    )));
                }
                let data = r.read_remaining().to_vec();
                r.end()?;
                Ok(data)
            }
            SW_FILE_NOT_FOUND => Err(Error::NotFound("data object not found")),
            sw => {
                log::debug!(
                    "{}: card did not accept GET DATA (sw {:04x})",
                    self.state.reader,
                    sw
                );
                Err(Error::Invalid(format!(
                    "GET DATA rejected, status {:04x}",
                    sw
                )))
            }
        }
    }

    /// Write a PIV data object.
    pub fn write_file(&mut self, tag: u32, data: &[u8]) -> Result<()> {
        let mut tlv = TlvWriter::new();
        tlv.push(0x5C);
        tlv.write_uint(tag);
        tlv.pop();
        tlv.push_with_cap(0x53, data.len() + 8);
        tlv.write(data);
        tlv.pop();

        let mut apdu = Apdu::new(CLA_ISO, INS_PUT_DATA, 0x3F, 0xFF);
        apdu.set_data(tlv.into_bytes());
        self.transceive_chain(&mut apdu)?;

        match apdu.sw {
            SW_NO_ERROR => Ok(()),
            SW_OUT_OF_MEMORY => Err(Error::NoSpace),
            SW_SECURITY_STATUS_NOT_SATISFIED => {
                Err(Error::Permission("writing objects requires admin authentication"))
            }
            SW_FUNC_NOT_SUPPORTED => Err(Error::NotFound("card has no such data object")),
            sw => {
                log::debug!(
                    "{}: card did not accept PUT DATA (sw {:04x})",
                    self.state.reader,
                    sw
                );
                Err(Error::Invalid(format!(
                    "PUT DATA rejected, status {:04x}",
                    sw
                )))
            }
        }
    }

    /// Store a certificate in a slot's data object.
    pub fn write_cert(&mut self, slot: SlotId, der: &[u8], certinfo: u8) -> Result<()> {
        let mut tlv = TlvWriter::new();
        tlv.push_with_cap(0x70, der.len() + 3);
        tlv.write(der);
        tlv.pop();
        tlv.push(0x71);
        tlv.write_byte(certinfo);
        tlv.pop();
        self.write_file(slot.cert_tag(), &tlv.into_bytes())
    }

    /// Read a slot's certificate and cache the parsed slot record on
    /// the token.
    pub fn read_cert(&mut self, slot: SlotId) -> Result<()> {
        let obj = self.read_file(slot.cert_tag())?;

        let mut certinfo = 0u8;
        let mut der: Option<&[u8]> = None;
        let mut r = TlvReader::new(&obj);
        while !r.at_end() {
            let tag = r.read_tag()?;
            if tag == 0x71 {
                certinfo = r.read_byte()?;
                r.end()?;
            } else if tag == 0x70 {
                der = Some(r.read_remaining());
                r.end()?;
            } else {
                r.skip();
            }
        }

        // NIST reserves this bit; a card setting it is not to be trusted
        if certinfo & CI_X509 != 0 {
            log::debug!(
                "{}: slot {} certificate has the X.509 validity bit set",
                self.state.reader,
                slot
            );
            return Err(Error::Invalid(
                "certificate flagged invalid by the card".into(),
            ));
        }
        if certinfo & CI_COMPTYPE_MASK != CI_COMP_NONE {
            log::warn!(
                "{}: slot {} holds a compressed certificate",
                self.state.reader,
                slot
            );
            return Err(Error::Unsupported("compressed certificates".into()));
        }

        let der = der
            .ok_or_else(|| Error::Invalid("certificate object has no 0x70 payload".into()))?;
        let (pubkey, subject) = keys::from_cert(der).map_err(|e| {
            log::warn!(
                "{}: slot {} returned an unparseable certificate: {}",
                self.state.reader,
                slot,
                e
            );
            e
        })?;
        let alg = pubkey.algorithm()?;

        let record = Slot {
            id: slot,
            alg,
            cert_der: der.to_vec(),
            subject,
            pubkey,
        };
        match self.state.slots.iter_mut().find(|s| s.id == slot) {
            Some(s) => *s = record,
            None => self.state.slots.push(record),
        }
        Ok(())
    }

    /// Read every slot certificate the card holds. Empty slots and
    /// unsupported payloads are skipped; hard errors abort.
    pub fn read_all_certs(&mut self) -> Result<()> {
        for slot in [
            SlotId::CardAuthentication,
            SlotId::Authentication,
            SlotId::Signature,
            SlotId::KeyManagement,
        ] {
            match self.read_cert(slot) {
                Ok(()) | Err(Error::NotFound(_)) | Err(Error::Unsupported(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Generate a fresh key pair in a slot, returning its public half.
    pub fn generate(&mut self, slot: SlotId, alg: Algorithm) -> Result<PublicKey> {
        match alg {
            Algorithm::Rsa1024
            | Algorithm::Rsa2048
            | Algorithm::EccP256
            | Algorithm::EccP384 => {}
            other => panic!("cannot generate {:?} keys in an asymmetric slot", other),
        }

        let mut tlv = TlvWriter::new();
        tlv.push(0xAC);
        tlv.push(0x80);
        tlv.write_uint(alg as u32);
        tlv.pop();
        tlv.pop();

        let mut apdu = Apdu::new(CLA_ISO, INS_GEN_ASYM, 0x00, slot as u8);
        apdu.set_data(tlv.into_bytes());
        self.transceive_chain(&mut apdu)?;

        match apdu.sw {
            SW_NO_ERROR => {}
            SW_SECURITY_STATUS_NOT_SATISFIED => {
                return Err(Error::Permission(
                    "key generation requires admin authentication",
                ))
            }
            sw => {
                log::debug!(
                    "{}: card did not accept GENERATE ASYMMETRIC (sw {:04x})",
                    self.state.reader,
                    sw
                );
                return Err(Error::Invalid(format!(
                    "GENERATE ASYMMETRIC rejected, status {:04x}",
                    sw
                )));
            }
        }

        let mut r = TlvReader::new(apdu.reply_data());
        if r.read_tag()? != 0x7F49 {
            return Err(Error::Unsupported(
                "GENERATE ASYMMETRIC reply is not a public key template".into(),
            ));
        }
        let mut modulus: Option<Vec<u8>> = None;
        let mut exponent: Option<Vec<u8>> = None;
        let mut point: Option<Vec<u8>> = None;
        while !r.at_end() {
            let tag = r.read_tag()?;
            match (alg, tag) {
                (Algorithm::Rsa1024 | Algorithm::Rsa2048, 0x81) => {
                    modulus = Some(r.read_remaining().to_vec());
                    r.end()?;
                }
                (Algorithm::Rsa1024 | Algorithm::Rsa2048, 0x82) => {
                    exponent = Some(r.read_remaining().to_vec());
                    r.end()?;
                }
                (Algorithm::EccP256 | Algorithm::EccP384, 0x86) => {
                    point = Some(r.read_remaining().to_vec());
                    r.end()?;
                }
                (_, tag) => {
                    return Err(Error::Unsupported(format!(
                        "tag {:#04x} in public key template",
                        tag
                    )))
                }
            }
        }
        r.end()?;

        let key = match alg {
            Algorithm::Rsa1024 | Algorithm::Rsa2048 => {
                let n = modulus
                    .ok_or_else(|| Error::Invalid("public key template lacks a modulus".into()))?;
                let e = exponent
                    .ok_or_else(|| Error::Invalid("public key template lacks an exponent".into()))?;
                RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
                    .map(PublicKey::Rsa)
                    .map_err(|e| Error::Invalid(format!("card generated a bad RSA key: {}", e)))?
            }
            _ => {
                let point = point
                    .ok_or_else(|| Error::Invalid("public key template lacks an EC point".into()))?;
                let key = PublicKey::from_ec_point(&point)?;
                if key.algorithm()? != alg {
                    return Err(Error::Invalid(
                        "card generated a key on the wrong curve".into(),
                    ));
                }
                key
            }
        };
        Ok(key)
    }

    /// Hash `data` and sign it with the slot's key.
    ///
    /// The requested hash may be coerced to fit the slot algorithm (see
    /// `HashAlgo::coerced`; P-384 forces SHA-384); the hash actually
    /// used is returned with the signature. When the card advertises an
    /// on-card-hash P-256 variant matching the effective hash, the raw
    /// message is handed to the card instead of a digest.
    pub fn sign(
        &mut self,
        slot_id: SlotId,
        data: &[u8],
        hash: HashAlgo,
    ) -> Result<(HashAlgo, Vec<u8>)> {
        let slot = self
            .state
            .slot(slot_id)
            .ok_or(Error::NotFound("slot has no cached certificate"))?;
        let alg = slot.alg;

        let (eff, card_alg, rsa_len) = match alg {
            Algorithm::Rsa1024 => (hash.coerced(), alg, 128usize),
            Algorithm::Rsa2048 => (hash.coerced(), alg, 256),
            Algorithm::EccP256 => {
                let eff = hash.coerced();
                let variant = match eff {
                    HashAlgo::Sha1 => Algorithm::EccP256Sha1,
                    _ => Algorithm::EccP256Sha256,
                };
                if self.state.algs.contains(&(variant as u8)) {
                    (eff, variant, 0)
                } else {
                    (eff, alg, 0)
                }
            }
            Algorithm::EccP384 => (HashAlgo::Sha384, alg, 0),
            other => unreachable!("slot algorithm {:?} cannot sign", other),
        };

        let input = if card_alg == Algorithm::EccP256Sha1 || card_alg == Algorithm::EccP256Sha256 {
            log::trace!("{}: hashing on card", self.state.reader);
            data.to_vec()
        } else {
            let digest = eff.digest(data);
            match alg {
                Algorithm::Rsa1024 | Algorithm::Rsa2048 => {
                    pkcs1_v15_pad(&digest_info(eff, &digest), rsa_len)?
                }
                _ => digest,
            }
        };

        let sig = self.sign_prehash(slot_id, card_alg, &input)?;
        Ok((eff, sig))
    }

    /// GENERAL AUTHENTICATE, sign usage: the card signs `input` as-is.
    pub fn sign_prehash(&mut self, slot: SlotId, alg: Algorithm, input: &[u8]) -> Result<Vec<u8>> {
        let mut tlv = TlvWriter::new();
        tlv.push_with_cap(0x7C, input.len() + 16);
        tlv.push(GA_TAG_RESPONSE);
        tlv.pop();
        tlv.push_with_cap(GA_TAG_CHALLENGE, input.len());
        tlv.write(input);
        tlv.pop();
        tlv.pop();

        let mut apdu = Apdu::new(CLA_ISO, INS_GEN_AUTH, alg as u8, slot as u8);
        apdu.set_data(tlv.into_bytes());
        self.transceive_chain(&mut apdu)?;

        match apdu.sw {
            SW_NO_ERROR => parse_ga_response(apdu.reply_data()),
            SW_SECURITY_STATUS_NOT_SATISFIED => {
                Err(Error::Permission("signing requires PIN verification"))
            }
            sw => {
                log::debug!(
                    "{}: card did not accept GENERAL AUTHENTICATE for slot {} (sw {:04x})",
                    self.state.reader,
                    slot,
                    sw
                );
                Err(Error::Invalid(format!(
                    "GENERAL AUTHENTICATE rejected, status {:04x}",
                    sw
                )))
            }
        }
    }

    /// GENERAL AUTHENTICATE, key agreement usage: the card multiplies
    /// its slot private key with `peer` and returns the shared X
    /// coordinate.
    pub fn ecdh(&mut self, slot_id: SlotId, peer: &PublicKey) -> Result<Zeroizing<Vec<u8>>> {
        let alg = self
            .state
            .slot(slot_id)
            .ok_or(Error::NotFound("slot has no cached certificate"))?
            .alg;
        let point = peer.ec_point()?;

        let mut tlv = TlvWriter::new();
        tlv.push_with_cap(0x7C, point.len() + 16);
        tlv.push(GA_TAG_RESPONSE);
        tlv.pop();
        tlv.push_with_cap(GA_TAG_EXP, point.len());
        tlv.write(&point);
        tlv.pop();
        tlv.pop();

        let mut apdu = Apdu::new(CLA_ISO, INS_GEN_AUTH, alg as u8, slot_id as u8);
        apdu.set_data(tlv.into_bytes());
        self.transceive_chain(&mut apdu)?;

        match apdu.sw {
            SW_NO_ERROR => parse_ga_response(apdu.reply_data()).map(Zeroizing::new),
            SW_SECURITY_STATUS_NOT_SATISFIED => {
                Err(Error::Permission("key agreement requires PIN verification"))
            }
            sw => {
                log::debug!(
                    "{}: card did not accept GENERAL AUTHENTICATE for slot {} (sw {:04x})",
                    self.state.reader,
                    slot_id,
                    sw
                );
                Err(Error::Invalid(format!(
                    "GENERAL AUTHENTICATE rejected, status {:04x}",
                    sw
                )))
            }
        }
    }
}
