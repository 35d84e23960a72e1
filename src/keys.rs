//! Public and private key wrappers
//!
//! Slot public keys come out of X.509 certificates or GENERATE
//! ASYMMETRIC replies; the sealed-box envelope carries them as SSH wire
//! blobs. Offline unsealing needs the matching EC private key.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use x509_cert::der::{Decode, Encode};
use x509_cert::Certificate;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::piv::Algorithm;
use crate::wire::{WireReader, WireWriter};

/// A key held by a card slot or addressed by a sealed box.
#[derive(Clone, Debug, PartialEq)]
pub enum PublicKey {
    Rsa(RsaPublicKey),
    P256(p256::PublicKey),
    P384(p384::PublicKey),
}

impl PublicKey {
    /// The PIV algorithm identifier matching this key's type and size.
    pub fn algorithm(&self) -> Result<Algorithm> {
        match self {
            PublicKey::Rsa(k) => match k.size() {
                128 => Ok(Algorithm::Rsa1024),
                256 => Ok(Algorithm::Rsa2048),
                n => Err(Error::Unsupported(format!("{}-bit RSA key", n * 8))),
            },
            PublicKey::P256(_) => Ok(Algorithm::EccP256),
            PublicKey::P384(_) => Ok(Algorithm::EccP384),
        }
    }

    pub fn ssh_type_name(&self) -> &'static str {
        match self {
            PublicKey::Rsa(_) => "ssh-rsa",
            PublicKey::P256(_) => "ecdsa-sha2-nistp256",
            PublicKey::P384(_) => "ecdsa-sha2-nistp384",
        }
    }

    /// SEC1 uncompressed point, for keys living on a curve.
    pub(crate) fn ec_point(&self) -> Result<Vec<u8>> {
        match self {
            PublicKey::P256(k) => Ok(k.to_encoded_point(false).as_bytes().to_vec()),
            PublicKey::P384(k) => Ok(k.to_encoded_point(false).as_bytes().to_vec()),
            PublicKey::Rsa(_) => Err(Error::Unsupported(
                "RSA keys cannot be used for ECDH".into(),
            )),
        }
    }

    pub(crate) fn from_ec_point(point: &[u8]) -> Result<PublicKey> {
        match point.len() {
            65 => p256::PublicKey::from_sec1_bytes(point)
                .map(PublicKey::P256)
                .map_err(|_| Error::Invalid("bad P-256 point".into())),
            97 => p384::PublicKey::from_sec1_bytes(point)
                .map(PublicKey::P384)
                .map_err(|_| Error::Invalid("bad P-384 point".into())),
            n => Err(Error::Unsupported(format!(
                "unrecognized EC point length {}",
                n
            ))),
        }
    }

    /// Encode as an SSH wire key blob.
    pub fn to_ssh_wire(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_str(self.ssh_type_name());
        match self {
            PublicKey::Rsa(k) => {
                w.put_mpint(&k.e().to_bytes_be());
                w.put_mpint(&k.n().to_bytes_be());
            }
            PublicKey::P256(k) => {
                w.put_str("nistp256");
                w.put_bytes(k.to_encoded_point(false).as_bytes());
            }
            PublicKey::P384(k) => {
                w.put_str("nistp384");
                w.put_bytes(k.to_encoded_point(false).as_bytes());
            }
        }
        w.into_bytes()
    }

    /// Decode an SSH wire key blob.
    pub fn from_ssh_wire(blob: &[u8]) -> Result<PublicKey> {
        let mut r = WireReader::new(blob);
        let ktype = r.get_str()?;
        match ktype.as_str() {
            "ssh-rsa" => {
                let e = BigUint::from_bytes_be(r.get_mpint()?);
                let n = BigUint::from_bytes_be(r.get_mpint()?);
                RsaPublicKey::new(n, e)
                    .map(PublicKey::Rsa)
                    .map_err(|e| Error::Invalid(format!("bad RSA key blob: {}", e)))
            }
            "ecdsa-sha2-nistp256" | "ecdsa-sha2-nistp384" => {
                let curve = r.get_str()?;
                let point = r.get_bytes()?;
                let key = PublicKey::from_ec_point(point)?;
                if key.ssh_type_name() != ktype || !ktype.ends_with(curve.as_str()) {
                    return Err(Error::Invalid(format!(
                        "key blob curve {} does not match type {}",
                        curve, ktype
                    )));
                }
                Ok(key)
            }
            other => Err(Error::Unsupported(format!("SSH key type {}", other))),
        }
    }
}

/// Parse a certificate and pull out its subject DN and public key.
pub(crate) fn from_cert(der: &[u8]) -> Result<(PublicKey, String)> {
    let cert = Certificate::from_der(der)
        .map_err(|e| Error::Invalid(format!("bad certificate DER: {}", e)))?;
    let subject = cert.tbs_certificate.subject.to_string();
    let spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::Invalid(format!("bad subject public key: {}", e)))?;

    let key = if let Ok(k) = p256::PublicKey::from_public_key_der(&spki) {
        PublicKey::P256(k)
    } else if let Ok(k) = p384::PublicKey::from_public_key_der(&spki) {
        PublicKey::P384(k)
    } else if let Ok(k) = RsaPublicKey::from_public_key_der(&spki) {
        PublicKey::Rsa(k)
    } else {
        return Err(Error::Unsupported(
            "certificate key is neither RSA nor a NIST curve".into(),
        ));
    };
    Ok((key, subject))
}

/// An EC private key for unsealing boxes without the card.
#[derive(Clone)]
pub enum PrivateKey {
    P256(p256::SecretKey),
    P384(p384::SecretKey),
}

impl PrivateKey {
    pub fn public_key(&self) -> PublicKey {
        match self {
            PrivateKey::P256(k) => PublicKey::P256(k.public_key()),
            PrivateKey::P384(k) => PublicKey::P384(k.public_key()),
        }
    }

    /// Raw X coordinate of the ECDH shared point with `peer`.
    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> Result<Zeroizing<Vec<u8>>> {
        match (self, peer) {
            (PrivateKey::P256(sk), PublicKey::P256(pk)) => Ok(Zeroizing::new(
                p256::ecdh::diffie_hellman(sk.to_nonzero_scalar(), pk.as_affine())
                    .raw_secret_bytes()
                    .to_vec(),
            )),
            (PrivateKey::P384(sk), PublicKey::P384(pk)) => Ok(Zeroizing::new(
                p384::ecdh::diffie_hellman(sk.to_nonzero_scalar(), pk.as_affine())
                    .raw_secret_bytes()
                    .to_vec(),
            )),
            _ => Err(Error::Invalid(
                "private key curve does not match the ephemeral key".into(),
            )),
        }
    }
}

impl From<p256::SecretKey> for PrivateKey {
    fn from(k: p256::SecretKey) -> Self {
        PrivateKey::P256(k)
    }
}

impl From<p384::SecretKey> for PrivateKey {
    fn from(k: p384::SecretKey) -> Self {
        PrivateKey::P384(k)
    }
}
