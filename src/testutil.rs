//! Software PIV card for exercising the protocol engine in tests
//!
//! `MockCard` answers the subset of ISO 7816 this library speaks:
//! SELECT, GET DATA, PUT DATA, GENERATE ASYMMETRIC, GENERAL
//! AUTHENTICATE, VERIFY, CHANGE REFERENCE DATA, GET RESPONSE and the
//! YubiKey version command, with real key material so signatures and
//! shared secrets verify. It also chunks replies at 256 bytes and
//! reassembles chained commands, which is what the transport tests
//! are after.

use std::collections::HashMap;

use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::signature::Signer;
use rand::RngCore;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::BigUint;
use sha2::Digest;

use crate::apdu::{
    INS_CHANGE_PIN, INS_CONTINUE, INS_GEN_ASYM, INS_GEN_AUTH, INS_GET_DATA, INS_GET_VER,
    INS_PUT_DATA, INS_SELECT, INS_VERIFY,
};
use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::piv::{tdes_cbc_encrypt, DEFAULT_ADMIN_KEY, PIV_AID, PIV_TAG_CHUID};
use crate::tlv::{TlvReader, TlvWriter};
use crate::token::{CardHandle, Token, TokenState};

use p256::elliptic_curve::sec1::ToEncodedPoint;

pub(crate) enum MockSlotKey {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
    Rsa(rsa::RsaPrivateKey),
}

pub(crate) struct MockCard {
    pub algs: Vec<u8>,
    pub guid: Option<[u8; 16]>,
    pub yk_version: Option<[u8; 3]>,
    pub admin_key: [u8; 24],
    pub pin: String,
    pub total_retries: u8,
    pub retries_left: u8,
    pub pin_verified: bool,
    pub admin_verified: bool,
    pub require_pin_for_auth: bool,
    /// Extra top-level tag injected into the SELECT reply.
    pub apt_extra_tag: Option<u8>,
    pub objects: HashMap<u32, Vec<u8>>,
    pub keys: HashMap<u8, MockSlotKey>,
    pub fail_next: Option<pcsc::Error>,
    pub ended: u32,
    pub resets: u32,
    chain: Vec<u8>,
    pending: Vec<u8>,
    admin_challenge: Option<Vec<u8>>,
}

impl MockCard {
    pub fn new() -> Self {
        MockCard {
            algs: vec![0x11, 0x14, 0x07],
            guid: Some([0xA5; 16]),
            yk_version: None,
            admin_key: DEFAULT_ADMIN_KEY,
            pin: "123456".into(),
            total_retries: 3,
            retries_left: 3,
            pin_verified: false,
            admin_verified: true,
            require_pin_for_auth: false,
            apt_extra_tag: None,
            objects: HashMap::new(),
            keys: HashMap::new(),
            fail_next: None,
            ended: 0,
            resets: 0,
            chain: Vec::new(),
            pending: Vec::new(),
            admin_challenge: None,
        }
    }

    pub fn end_transaction(&mut self, reset: bool) {
        self.ended += 1;
        if reset {
            self.resets += 1;
            self.pin_verified = false;
            self.admin_verified = false;
        }
    }

    pub fn transmit(&mut self, cmd: &[u8], recv: &mut [u8]) -> Result<usize> {
        if let Some(e) = self.fail_next.take() {
            return Err(Error::Transport(e));
        }
        assert!(cmd.len() >= 5, "runt APDU");
        let (cla, ins, p1, p2) = (cmd[0], cmd[1], cmd[2], cmd[3]);
        let lc = cmd[4] as usize;
        let data = if cmd.len() > 5 { &cmd[5..5 + lc] } else { &[] };

        if ins == INS_CONTINUE {
            return self.drain(recv);
        }
        if cla & 0x10 != 0 {
            self.chain.extend_from_slice(data);
            return self.sw_only(0x9000, recv);
        }
        let mut full = std::mem::take(&mut self.chain);
        full.extend_from_slice(data);

        match ins {
            INS_SELECT => self.op_select(&full, recv),
            INS_GET_DATA => self.op_get_data(&full, recv),
            INS_PUT_DATA => self.op_put_data(&full, recv),
            INS_GEN_ASYM => self.op_generate(p2, &full, recv),
            INS_GEN_AUTH => self.op_general_auth(p1, p2, &full, recv),
            INS_VERIFY => self.op_verify(&full, recv),
            INS_CHANGE_PIN => self.op_change_pin(&full, recv),
            INS_GET_VER => match self.yk_version {
                Some(v) => self.reply(v.to_vec(), recv),
                None => self.sw_only(0x6D00, recv),
            },
            _ => self.sw_only(0x6D00, recv),
        }
    }

    fn write_out(&self, data: &[u8], sw: u16, recv: &mut [u8]) -> Result<usize> {
        let n = data.len() + 2;
        assert!(recv.len() >= n, "mock reply larger than receive buffer");
        recv[..data.len()].copy_from_slice(data);
        recv[data.len()] = (sw >> 8) as u8;
        recv[data.len() + 1] = sw as u8;
        Ok(n)
    }

    fn sw_only(&self, sw: u16, recv: &mut [u8]) -> Result<usize> {
        self.write_out(&[], sw, recv)
    }

    fn reply(&mut self, data: Vec<u8>, recv: &mut [u8]) -> Result<usize> {
        if data.len() > 256 {
            self.pending = data[256..].to_vec();
            let sw = 0x6100 | self.pending.len().min(255) as u16;
            let head = data[..256].to_vec();
            self.write_out(&head, sw, recv)
        } else {
            self.pending.clear();
            self.write_out(&data, 0x9000, recv)
        }
    }

    fn drain(&mut self, recv: &mut [u8]) -> Result<usize> {
        let n = self.pending.len().min(256);
        let chunk: Vec<u8> = self.pending.drain(..n).collect();
        let sw = if self.pending.is_empty() {
            0x9000
        } else {
            0x6100 | self.pending.len().min(255) as u16
        };
        self.write_out(&chunk, sw, recv)
    }

    fn op_select(&mut self, data: &[u8], recv: &mut [u8]) -> Result<usize> {
        if data != &PIV_AID[..] {
            return self.sw_only(0x6A82, recv);
        }
        let mut w = TlvWriter::new();
        w.push(0x61);
        if let Some(tag) = self.apt_extra_tag {
            w.push(tag as u32);
            w.write_byte(0x00);
            w.pop();
        }
        w.push(0x4F);
        w.write(&PIV_AID);
        w.pop();
        w.push(0xAC);
        for &alg in &self.algs {
            w.push(0x80);
            w.write_byte(alg);
            w.pop();
        }
        w.push(0x06);
        w.write_byte(0x00);
        w.pop();
        w.pop();
        w.pop();
        self.reply(w.into_bytes(), recv)
    }

    fn op_get_data(&mut self, data: &[u8], recv: &mut [u8]) -> Result<usize> {
        let mut r = TlvReader::new(data);
        if r.read_tag()? != 0x5C {
            return self.sw_only(0x6A80, recv);
        }
        let tag = r.read_uint()?;

        if tag == PIV_TAG_CHUID {
            let Some(guid) = self.guid else {
                return self.sw_only(0x6A82, recv);
            };
            let mut w = TlvWriter::new();
            w.push(0x53);
            w.push(0x30);
            w.write(&[0xD4; 25]);
            w.pop();
            w.push(0x34);
            w.write(&guid);
            w.pop();
            w.push(0x35);
            w.write(b"20300101");
            w.pop();
            w.pop();
            return self.reply(w.into_bytes(), recv);
        }

        match self.objects.get(&tag) {
            Some(v) => {
                let mut w = TlvWriter::new();
                w.push_with_cap(0x53, v.len() + 8);
                w.write(v);
                w.pop();
                let out = w.into_bytes();
                self.reply(out, recv)
            }
            None => self.sw_only(0x6A82, recv),
        }
    }

    fn op_put_data(&mut self, data: &[u8], recv: &mut [u8]) -> Result<usize> {
        if !self.admin_verified {
            return self.sw_only(0x6982, recv);
        }
        let mut r = TlvReader::new(data);
        if r.read_tag()? != 0x5C {
            return self.sw_only(0x6A80, recv);
        }
        let tag = r.read_uint()?;
        r.end()?;
        if r.read_tag()? != 0x53 {
            return self.sw_only(0x6A80, recv);
        }
        let value = r.read_remaining().to_vec();
        self.objects.insert(tag, value);
        self.sw_only(0x9000, recv)
    }

    fn op_generate(&mut self, slot: u8, data: &[u8], recv: &mut [u8]) -> Result<usize> {
        let mut r = TlvReader::new(data);
        if r.read_tag()? != 0xAC || r.read_tag()? != 0x80 {
            return self.sw_only(0x6A80, recv);
        }
        let alg = r.read_uint()? as u8;

        let mut w = TlvWriter::new();
        w.push_with_cap(0x7F49, 300);
        match alg {
            0x11 => {
                let sk = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
                let point = sk.verifying_key().to_encoded_point(false);
                w.push(0x86);
                w.write(point.as_bytes());
                w.pop();
                self.keys.insert(slot, MockSlotKey::P256(sk));
            }
            0x14 => {
                let sk = p384::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
                let point = sk.verifying_key().to_encoded_point(false);
                w.push(0x86);
                w.write(point.as_bytes());
                w.pop();
                self.keys.insert(slot, MockSlotKey::P384(sk));
            }
            0x06 | 0x07 => {
                let bits = if alg == 0x06 { 1024 } else { 2048 };
                let sk = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
                    .expect("RSA key generation");
                w.push_with_cap(0x81, bits / 8);
                w.write(&sk.n().to_bytes_be());
                w.pop();
                w.push(0x82);
                w.write(&sk.e().to_bytes_be());
                w.pop();
                self.keys.insert(slot, MockSlotKey::Rsa(sk));
            }
            _ => return self.sw_only(0x6A80, recv),
        }
        w.pop();
        self.reply(w.into_bytes(), recv)
    }

    fn op_general_auth(&mut self, p1: u8, p2: u8, data: &[u8], recv: &mut [u8]) -> Result<usize> {
        let mut want_witness = false;
        let mut response: Option<Vec<u8>> = None;
        let mut challenge: Option<Vec<u8>> = None;
        let mut exp: Option<Vec<u8>> = None;

        let mut r = TlvReader::new(data);
        if r.read_tag()? != 0x7C {
            return self.sw_only(0x6A80, recv);
        }
        while !r.at_end() {
            match r.read_tag()? {
                0x80 => {
                    if r.rem() == 0 {
                        want_witness = true;
                        r.end()?;
                    } else {
                        r.skip();
                    }
                }
                0x81 => {
                    challenge = Some(r.read_remaining().to_vec());
                    r.end()?;
                }
                0x82 => {
                    if r.rem() > 0 {
                        response = Some(r.read_remaining().to_vec());
                    }
                    r.end()?;
                }
                0x85 => {
                    exp = Some(r.read_remaining().to_vec());
                    r.end()?;
                }
                _ => r.skip(),
            }
        }

        // management key slot: 3DES challenge/response
        if p2 == 0x9B {
            if p1 != 0x03 {
                return self.sw_only(0x6B00, recv);
            }
            if let Some(resp) = response {
                let Some(chal) = self.admin_challenge.take() else {
                    return self.sw_only(0x6A80, recv);
                };
                let expect = tdes_cbc_encrypt(&self.admin_key, &chal)?;
                return if resp == *expect {
                    self.admin_verified = true;
                    self.sw_only(0x9000, recv)
                } else {
                    self.sw_only(0x6A80, recv)
                };
            }
            if want_witness {
                let mut chal = vec![0u8; 8];
                rand::rngs::OsRng.fill_bytes(&mut chal);
                self.admin_challenge = Some(chal.clone());
                let mut w = TlvWriter::new();
                w.push(0x7C);
                w.push(0x80);
                w.write(&chal);
                w.pop();
                w.pop();
                return self.reply(w.into_bytes(), recv);
            }
            return self.sw_only(0x6A80, recv);
        }

        // asymmetric slots: sign or key agreement
        if self.require_pin_for_auth && !self.pin_verified {
            return self.sw_only(0x6982, recv);
        }
        let Some(key) = self.keys.get(&p2) else {
            return self.sw_only(0x6B00, recv);
        };

        if let Some(point) = exp {
            let shared = match key {
                MockSlotKey::P256(sk) => {
                    let peer = p256::PublicKey::from_sec1_bytes(&point)
                        .map_err(|_| Error::Invalid("mock: bad peer point".into()))?;
                    p256::ecdh::diffie_hellman(sk.as_nonzero_scalar(), peer.as_affine())
                        .raw_secret_bytes()
                        .to_vec()
                }
                MockSlotKey::P384(sk) => {
                    let peer = p384::PublicKey::from_sec1_bytes(&point)
                        .map_err(|_| Error::Invalid("mock: bad peer point".into()))?;
                    p384::ecdh::diffie_hellman(sk.as_nonzero_scalar(), peer.as_affine())
                        .raw_secret_bytes()
                        .to_vec()
                }
                MockSlotKey::Rsa(_) => return self.sw_only(0x6A80, recv),
            };
            let mut w = TlvWriter::new();
            w.push(0x7C);
            w.push(0x82);
            w.write(&shared);
            w.pop();
            w.pop();
            return self.reply(w.into_bytes(), recv);
        }

        let Some(input) = challenge else {
            return self.sw_only(0x6A80, recv);
        };
        let sig = match (key, p1) {
            (MockSlotKey::P256(sk), 0x11) => {
                let sig: p256::ecdsa::Signature =
                    sk.sign_prehash(&input).expect("mock prehash signing");
                sig.to_der().as_bytes().to_vec()
            }
            (MockSlotKey::P256(sk), 0xF0) => {
                let digest = sha1::Sha1::digest(&input);
                let sig: p256::ecdsa::Signature =
                    sk.sign_prehash(&digest).expect("mock prehash signing");
                sig.to_der().as_bytes().to_vec()
            }
            (MockSlotKey::P256(sk), 0xF2) => {
                let sig: p256::ecdsa::Signature = sk.sign(&input);
                sig.to_der().as_bytes().to_vec()
            }
            (MockSlotKey::P384(sk), 0x14) => {
                let sig: p384::ecdsa::Signature =
                    sk.sign_prehash(&input).expect("mock prehash signing");
                sig.to_der().as_bytes().to_vec()
            }
            (MockSlotKey::Rsa(sk), 0x06 | 0x07) => {
                let m = BigUint::from_bytes_be(&input);
                if m >= *sk.n() {
                    return self.sw_only(0x6A80, recv);
                }
                let s = m.modpow(sk.d(), sk.n());
                let mut out = s.to_bytes_be();
                let k = sk.size();
                let mut padded = vec![0u8; k - out.len()];
                padded.append(&mut out);
                padded
            }
            _ => return self.sw_only(0x6A80, recv),
        };
        let mut w = TlvWriter::new();
        w.push_with_cap(0x7C, sig.len() + 8);
        w.push_with_cap(0x82, sig.len());
        w.write(&sig);
        w.pop();
        w.pop();
        self.reply(w.into_bytes(), recv)
    }

    fn pin_matches(&self, padded: &[u8]) -> bool {
        let end = padded
            .iter()
            .position(|&c| c == 0xFF)
            .unwrap_or(padded.len());
        &padded[..end] == self.pin.as_bytes()
    }

    fn op_verify(&mut self, data: &[u8], recv: &mut [u8]) -> Result<usize> {
        if data.is_empty() {
            return self.sw_only(0x63C0 | self.retries_left as u16, recv);
        }
        if data.len() != 8 {
            return self.sw_only(0x6A80, recv);
        }
        if self.pin_matches(data) {
            self.pin_verified = true;
            self.retries_left = self.total_retries;
            self.sw_only(0x9000, recv)
        } else {
            self.retries_left = self.retries_left.saturating_sub(1);
            self.sw_only(0x63C0 | self.retries_left as u16, recv)
        }
    }

    fn op_change_pin(&mut self, data: &[u8], recv: &mut [u8]) -> Result<usize> {
        if data.len() != 16 {
            return self.sw_only(0x6A80, recv);
        }
        if self.pin_matches(&data[..8]) {
            let new = &data[8..];
            let end = new.iter().position(|&c| c == 0xFF).unwrap_or(new.len());
            self.pin = String::from_utf8(new[..end].to_vec()).expect("mock: non-UTF-8 PIN");
            self.retries_left = self.total_retries;
            self.sw_only(0x9000, recv)
        } else {
            self.retries_left = self.retries_left.saturating_sub(1);
            self.sw_only(0x63C0 | self.retries_left as u16, recv)
        }
    }
}

/// Wrap a mock card in a Token so the normal transaction API drives it.
pub(crate) fn mock_token(card: MockCard) -> Token {
    Token {
        card: CardHandle::Mock(card),
        state: TokenState::new("mock reader".into(), None),
    }
}

/// Generate a key on the mock card and install a matching certificate
/// so the slot record can be cached and used for signing or ECDH.
pub(crate) fn provision_slot(
    token: &mut Token,
    slot: crate::piv::SlotId,
    alg: crate::piv::Algorithm,
) -> PublicKey {
    let mut txn = token.begin().unwrap();
    txn.select().unwrap();
    let key = txn.generate(slot, alg).unwrap();
    let signer = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
    let der = make_test_cert(&signer, "provisioned slot", &key);
    txn.write_cert(slot, &der, 0).unwrap();
    txn.read_cert(slot).unwrap();
    txn.end();
    key
}

// ---------------------------------------------------------------------
// Minimal DER builder: enough X.509 to exercise certificate parsing
// without carrying binary fixtures. Signatures are real ECDSA-P256 over
// the TBS bytes.

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
    out.extend_from_slice(content);
    out
}

fn der_cat(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in parts {
        out.extend_from_slice(p);
    }
    out
}

fn der_seq(parts: &[&[u8]]) -> Vec<u8> {
    der(0x30, &der_cat(parts))
}

fn der_uint(bytes: &[u8]) -> Vec<u8> {
    let mut i = 0;
    while i + 1 < bytes.len() && bytes[i] == 0 {
        i += 1;
    }
    let body = &bytes[i..];
    if body.first().map_or(false, |b| b & 0x80 != 0) {
        let mut v = vec![0u8];
        v.extend_from_slice(body);
        der(0x02, &v)
    } else {
        der(0x02, body)
    }
}

fn der_bitstring(content: &[u8]) -> Vec<u8> {
    let mut v = vec![0u8];
    v.extend_from_slice(content);
    der(0x03, &v)
}

const OID_ECDSA_SHA256: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02];
const OID_EC_PUBKEY: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01];
const OID_PRIME256V1: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];
const OID_SECP384R1: &[u8] = &[0x2B, 0x81, 0x04, 0x00, 0x22];
const OID_RSA_ENCRYPTION: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01];
const OID_CN: &[u8] = &[0x55, 0x04, 0x03];

fn der_name(cn: &str) -> Vec<u8> {
    let atv = der_seq(&[&der(0x06, OID_CN), &der(0x0C, cn.as_bytes())]);
    der_seq(&[&der(0x31, &atv)])
}

fn der_spki(key: &PublicKey) -> Vec<u8> {
    match key {
        PublicKey::P256(k) => der_seq(&[
            &der_seq(&[&der(0x06, OID_EC_PUBKEY), &der(0x06, OID_PRIME256V1)]),
            &der_bitstring(k.to_encoded_point(false).as_bytes()),
        ]),
        PublicKey::P384(k) => der_seq(&[
            &der_seq(&[&der(0x06, OID_EC_PUBKEY), &der(0x06, OID_SECP384R1)]),
            &der_bitstring(k.to_encoded_point(false).as_bytes()),
        ]),
        PublicKey::Rsa(k) => {
            let rsa_key = der_seq(&[
                &der_uint(&k.n().to_bytes_be()),
                &der_uint(&k.e().to_bytes_be()),
            ]);
            der_seq(&[
                &der_seq(&[&der(0x06, OID_RSA_ENCRYPTION), &der(0x05, &[])]),
                &der_bitstring(&rsa_key),
            ])
        }
    }
}

/// Build a parseable self-contained X.509 v1 certificate carrying
/// `key` as its subject public key.
pub(crate) fn make_test_cert(
    signer: &p256::ecdsa::SigningKey,
    cn: &str,
    key: &PublicKey,
) -> Vec<u8> {
    let sig_alg = der_seq(&[&der(0x06, OID_ECDSA_SHA256)]);
    let name = der_name(cn);
    let validity = der_seq(&[
        &der(0x17, b"250101000000Z"),
        &der(0x17, b"400101000000Z"),
    ]);
    let tbs = der_seq(&[
        &der_uint(&[0x01]),
        &sig_alg,
        &name,
        &validity,
        &name,
        &der_spki(key),
    ]);
    let sig: p256::ecdsa::Signature = signer.sign(&tbs);
    der_seq(&[&tbs, &sig_alg, &der_bitstring(sig.to_der().as_bytes())])
}
