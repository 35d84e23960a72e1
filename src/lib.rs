//! PIV smart card client with an ECDH sealed-box envelope
//!
//! This crate drives PIV applets (NIST SP 800-73) over PC/SC: it
//! enumerates tokens, reads and writes slot certificates, generates
//! keys, signs, performs on-card ECDH, and verifies or changes the PIN.
//! On top of the card primitives, [`SealedBox`] implements a portable
//! envelope that encrypts a plaintext to a card-held EC public key so
//! that only the holder of that card (or of the raw private key) can
//! recover it.
//!
//! ```no_run
//! use pivbox::{enumerate, SealedBox, SlotId};
//!
//! # fn main() -> pivbox::Result<()> {
//! let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
//! let mut tokens = enumerate(&ctx)?;
//! let token = &mut tokens[0];
//!
//! let mut txn = token.begin()?;
//! txn.read_cert(SlotId::KeyManagement)?;
//! txn.end();
//!
//! let slot = token.slot(SlotId::KeyManagement).unwrap();
//! let sealed = SealedBox::seal_for(token, slot, b"the plaintext")?;
//! let wire = sealed.to_bytes();
//!
//! // later, possibly on another machine holding the same card:
//! let mut parsed = SealedBox::from_bytes(&wire)?;
//! let (token, slot_id) = parsed.find_token(&mut tokens)?;
//! let mut txn = token.begin()?;
//! parsed.unseal(&mut txn, slot_id)?;
//! txn.end();
//! let plaintext = parsed.take_plaintext()?;
//! # Ok(())
//! # }
//! ```
//!
//! Card operations are synchronous and single-threaded per token;
//! callers serialize access themselves. Buffers that held PINs, keys,
//! shared secrets or plaintext are zeroed on release.

mod apdu;
pub mod error;
pub mod keys;
pub mod piv;
pub mod sealbox;
#[cfg(test)]
mod testutil;
mod tlv;
pub mod token;
mod transport;
mod wire;

pub use error::{Error, Result};
pub use keys::{PrivateKey, PublicKey};
pub use piv::{Algorithm, HashAlgo, SlotId, DEFAULT_ADMIN_KEY, PIV_AID};
pub use sealbox::{SealedBox, DEFAULT_CIPHER, DEFAULT_KDF};
pub use token::{enumerate, Slot, Token, Transaction};
