//! ECDH sealed-box envelope
//!
//! A sealed box encrypts a plaintext to a card-held EC public key: a
//! fresh ephemeral key performs ECDH against the recipient key, the
//! shared X coordinate runs through a named KDF digest, and the
//! resulting key drives a named AEAD cipher. The envelope records the
//! target card GUID and slot so the right card can be found again, and
//! both keys as SSH wire blobs.
//!
//! With the default `chacha20-poly1305` cipher the plaintext is
//! recovered exactly. Block ciphers (`aes256-gcm`) pad the plaintext to
//! a block boundary with the byte sequence `01 02 03 ..`; the padding
//! is not self-describing and unsealing returns it, so callers must
//! know the true length out-of-band.

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::keys::{PrivateKey, PublicKey};
use crate::piv::SlotId;
use crate::token::{Token, Transaction};
use crate::wire::{WireReader, WireWriter};

pub const SEALED_BOX_VERSION: u8 = 1;
pub const DEFAULT_CIPHER: &str = "chacha20-poly1305";
pub const DEFAULT_KDF: &str = "sha512";

/// Slot byte stored when a box is not bound to a card.
const SLOT_UNBOUND: u8 = 0xFF;

struct CipherInfo {
    name: &'static str,
    key_len: usize,
    iv_len: usize,
    block_len: usize,
    auth_len: usize,
}

const CIPHERS: &[CipherInfo] = &[
    CipherInfo {
        name: "chacha20-poly1305",
        key_len: 32,
        iv_len: 12,
        block_len: 1,
        auth_len: 16,
    },
    CipherInfo {
        name: "aes256-gcm",
        key_len: 32,
        iv_len: 12,
        block_len: 16,
        auth_len: 16,
    },
];

fn cipher_by_name(name: &str) -> Result<&'static CipherInfo> {
    CIPHERS
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| Error::Unsupported(format!("cipher {}", name)))
}

fn kdf_len(name: &str) -> Result<usize> {
    match name {
        "sha256" => Ok(32),
        "sha384" => Ok(48),
        "sha512" => Ok(64),
        other => Err(Error::Unsupported(format!("KDF {}", other))),
    }
}

fn kdf_digest(name: &str, secret: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(match name {
        "sha256" => Sha256::digest(secret).to_vec(),
        "sha384" => Sha384::digest(secret).to_vec(),
        "sha512" => Sha512::digest(secret).to_vec(),
        _ => unreachable!("KDF name was validated"),
    })
}

fn aead_seal(name: &str, key: &[u8], iv: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
    let nonce = GenericArray::from_slice(iv);
    let out = match name {
        "chacha20-poly1305" => chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| Error::Invalid("bad cipher key length".into()))?
            .encrypt(nonce, plain),
        "aes256-gcm" => aes_gcm::Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::Invalid("bad cipher key length".into()))?
            .encrypt(nonce, plain),
        _ => unreachable!("cipher name was validated"),
    };
    out.map_err(|_| Error::Invalid("encryption failed".into()))
}

fn aead_open(name: &str, key: &[u8], iv: &[u8], enc: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let nonce = GenericArray::from_slice(iv);
    let out = match name {
        "chacha20-poly1305" => chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| Error::Invalid("bad cipher key length".into()))?
            .decrypt(nonce, enc),
        "aes256-gcm" => aes_gcm::Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::Invalid("bad cipher key length".into()))?
            .decrypt(nonce, enc),
        _ => unreachable!("cipher name was validated"),
    };
    out.map(Zeroizing::new).map_err(|_| Error::BadMessage)
}

fn ephemeral_ecdh(recipient: &PublicKey) -> Result<(PublicKey, Zeroizing<Vec<u8>>)> {
    match recipient {
        PublicKey::P256(pk) => {
            let eph = p256::ecdh::EphemeralSecret::random(&mut OsRng);
            let shared = eph.diffie_hellman(pk);
            Ok((
                PublicKey::P256(eph.public_key()),
                Zeroizing::new(shared.raw_secret_bytes().to_vec()),
            ))
        }
        PublicKey::P384(pk) => {
            let eph = p384::ecdh::EphemeralSecret::random(&mut OsRng);
            let shared = eph.diffie_hellman(pk);
            Ok((
                PublicKey::P384(eph.public_key()),
                Zeroizing::new(shared.raw_secret_bytes().to_vec()),
            ))
        }
        PublicKey::Rsa(_) => Err(Error::Unsupported(
            "sealing requires an EC recipient key".into(),
        )),
    }
}

/// A sealed envelope, either freshly produced or parsed from its wire
/// form. Unsealing leaves the plaintext inside the box until
/// `take_plaintext` moves it out; the buffer is wiped when the box is
/// dropped.
pub struct SealedBox {
    version: u8,
    guid: [u8; 16],
    slot: u8,
    ephem_pub: PublicKey,
    recipient: PublicKey,
    cipher: String,
    kdf: String,
    iv: Vec<u8>,
    enc: Vec<u8>,
    plain: Option<Zeroizing<Vec<u8>>>,
}

impl SealedBox {
    /// Seal `plain` to an EC public key with the default cipher and KDF.
    pub fn seal(recipient: &PublicKey, plain: &[u8]) -> Result<SealedBox> {
        SealedBox::seal_with(recipient, plain, DEFAULT_CIPHER, DEFAULT_KDF)
    }

    /// Seal with explicit cipher and KDF names.
    pub fn seal_with(
        recipient: &PublicKey,
        plain: &[u8],
        cipher: &str,
        kdf: &str,
    ) -> Result<SealedBox> {
        let ci = cipher_by_name(cipher)?;
        let dglen = kdf_len(kdf)?;
        if dglen < ci.key_len {
            return Err(Error::Invalid(format!(
                "KDF {} yields fewer bytes than cipher {} needs",
                kdf, cipher
            )));
        }
        if plain.is_empty() {
            return Err(Error::Invalid("refusing to seal an empty plaintext".into()));
        }

        let (ephem_pub, secret) = ephemeral_ecdh(recipient)?;
        let digest = kdf_digest(kdf, &secret);
        let key = &digest[..ci.key_len];

        let mut iv = vec![0u8; ci.iv_len];
        OsRng.fill_bytes(&mut iv);

        let mut padded = Zeroizing::new(plain.to_vec());
        let mut j = 0u8;
        while padded.len() % ci.block_len != 0 {
            j = j.wrapping_add(1);
            padded.push(j);
        }

        let enc = aead_seal(cipher, key, &iv, &padded)?;
        Ok(SealedBox {
            version: SEALED_BOX_VERSION,
            guid: [0; 16],
            slot: SLOT_UNBOUND,
            ephem_pub,
            recipient: recipient.clone(),
            cipher: cipher.to_string(),
            kdf: kdf.to_string(),
            iv,
            enc,
            plain: None,
        })
    }

    /// Seal to a token slot, binding the envelope to that card's GUID.
    pub fn seal_for(token: &Token, slot: &crate::token::Slot, plain: &[u8]) -> Result<SealedBox> {
        let mut sealed = SealedBox::seal(slot.public_key(), plain)?;
        sealed.guid = *token.guid();
        sealed.slot = slot.id() as u8;
        Ok(sealed)
    }

    fn open_with_secret(&mut self, secret: &[u8]) -> Result<()> {
        let ci = cipher_by_name(&self.cipher)?;
        let dglen = kdf_len(&self.kdf)?;
        if dglen < ci.key_len {
            return Err(Error::Invalid(format!(
                "KDF {} yields fewer bytes than cipher {} needs",
                self.kdf, self.cipher
            )));
        }
        if self.iv.len() != ci.iv_len {
            return Err(Error::Invalid(format!(
                "IV is {} bytes, cipher {} wants {}",
                self.iv.len(),
                self.cipher,
                ci.iv_len
            )));
        }
        if self.enc.len() < ci.block_len + ci.auth_len {
            return Err(Error::Invalid(
                "ciphertext shorter than one block and the auth tag".into(),
            ));
        }

        let digest = kdf_digest(&self.kdf, secret);
        let key = &digest[..ci.key_len];
        let plain = aead_open(&self.cipher, key, &self.iv, &self.enc)?;
        self.plain = Some(plain);
        Ok(())
    }

    /// Unseal using the card: the slot's private key reproduces the
    /// shared secret through on-card ECDH.
    pub fn unseal(&mut self, txn: &mut Transaction<'_>, slot: SlotId) -> Result<()> {
        let secret = txn.ecdh(slot, &self.ephem_pub).map_err(|e| {
            log::debug!("card ECDH for box slot {:02X} failed: {}", self.slot, e);
            e
        })?;
        self.open_with_secret(&secret)
    }

    /// Unseal with the recipient private key, no card involved.
    pub fn unseal_offline(&mut self, key: &PrivateKey) -> Result<()> {
        let secret = key.diffie_hellman(&self.ephem_pub)?;
        self.open_with_secret(&secret)
    }

    /// Move the recovered plaintext out of the box.
    pub fn take_plaintext(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        self.plain
            .take()
            .ok_or_else(|| Error::Invalid("box holds no plaintext".into()))
    }

    pub fn plaintext(&self) -> Option<&[u8]> {
        self.plain.as_deref().map(|v| v.as_slice())
    }

    pub fn guid(&self) -> &[u8; 16] {
        &self.guid
    }

    pub fn is_bound(&self) -> bool {
        self.slot != SLOT_UNBOUND && self.slot != 0
    }

    pub fn slot_byte(&self) -> u8 {
        self.slot
    }

    /// The slot to unseal against; unbound boxes default to key
    /// management.
    pub fn slot_id(&self) -> Result<SlotId> {
        match self.slot {
            0x00 | SLOT_UNBOUND => Ok(SlotId::KeyManagement),
            v => SlotId::from_u8(v)
                .ok_or_else(|| Error::Invalid(format!("box names unknown slot {:02X}", v))),
        }
    }

    pub fn cipher(&self) -> &str {
        &self.cipher
    }

    pub fn kdf(&self) -> &str {
        &self.kdf
    }

    pub fn ephemeral_public_key(&self) -> &PublicKey {
        &self.ephem_pub
    }

    pub fn recipient_public_key(&self) -> &PublicKey {
        &self.recipient
    }

    /// Find the token (and slot) able to unseal this box.
    ///
    /// The card GUID is tried first; failing that, every token's
    /// nominated slot is checked for the recipient public key, reading
    /// certificates on demand under a fresh transaction.
    pub fn find_token<'a>(&self, tokens: &'a mut [Token]) -> Result<(&'a mut Token, SlotId)> {
        let slot_id = self.slot_id()?;

        if let Some(i) = tokens.iter().position(|t| t.state.guid == self.guid) {
            {
                let token = &mut tokens[i];
                if token.state.slot(slot_id).is_none() {
                    let mut txn = token.begin()?;
                    txn.read_cert(slot_id)?;
                    txn.end();
                }
                let slot = token
                    .state
                    .slot(slot_id)
                    .ok_or(Error::NotFound("slot certificate not on card"))?;
                if slot.pubkey != self.recipient {
                    return Err(Error::NotFound(
                        "matching card no longer holds the box key",
                    ));
                }
            }
            return Ok((&mut tokens[i], slot_id));
        }

        let mut found = None;
        for (i, token) in tokens.iter_mut().enumerate() {
            if token.state.slot(slot_id).is_none() {
                let mut txn = match token.begin() {
                    Ok(txn) => txn,
                    Err(_) => continue,
                };
                if txn.read_cert(slot_id).is_err() {
                    continue;
                }
                txn.end();
            }
            if let Some(slot) = token.state.slot(slot_id) {
                if slot.pubkey == self.recipient {
                    found = Some(i);
                    break;
                }
            }
        }
        match found {
            Some(i) => Ok((&mut tokens[i], slot_id)),
            None => Err(Error::NotFound("no token holds the box's recipient key")),
        }
    }

    /// Serialize to the envelope wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(self.version);
        w.put_bytes(&self.guid);
        w.put_u8(self.slot);
        w.put_bytes(&self.ephem_pub.to_ssh_wire());
        w.put_bytes(&self.recipient.to_ssh_wire());
        w.put_str(&self.cipher);
        w.put_str(&self.kdf);
        w.put_bytes(&self.iv);
        w.put_bytes(&self.enc);
        w.into_bytes()
    }

    /// Parse the envelope wire form.
    pub fn from_bytes(input: &[u8]) -> Result<SealedBox> {
        let mut r = WireReader::new(input);
        let version = r.get_u8()?;
        if version != SEALED_BOX_VERSION {
            return Err(Error::Unsupported(format!("sealed box version {}", version)));
        }
        let guid_raw = r.get_bytes()?;
        let guid: [u8; 16] = guid_raw
            .try_into()
            .map_err(|_| Error::Invalid(format!("box GUID is {} bytes", guid_raw.len())))?;
        let slot = r.get_u8()?;
        let ephem_pub = PublicKey::from_ssh_wire(r.get_bytes()?)?;
        let recipient = PublicKey::from_ssh_wire(r.get_bytes()?)?;
        let cipher = r.get_str()?;
        let kdf = r.get_str()?;
        let iv = r.get_bytes()?.to_vec();
        let enc = r.get_bytes()?.to_vec();
        Ok(SealedBox {
            version,
            guid,
            slot,
            ephem_pub,
            recipient,
            cipher,
            kdf,
            iv,
            enc,
            plain: None,
        })
    }
}
