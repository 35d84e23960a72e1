//! Token enumeration and the per-token object model
//!
//! A `Token` is one PIV card visible through one reader. Card-visible
//! work happens inside a `Transaction`, which holds exclusive access to
//! the reader and releases it on drop, resetting the card if an
//! operation changed its authentication state.

use pcsc::{Disposition, Protocols, ShareMode};
use x509_cert::der::Decode;
use x509_cert::Certificate;

use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::piv::{Algorithm, SlotId};

/// Card-declared algorithm identifiers kept per token.
const MAX_CARD_ALGS: usize = 32;

pub(crate) enum CardHandle {
    Pcsc(pcsc::Card),
    #[cfg(test)]
    Mock(crate::testutil::MockCard),
}

/// Everything known about a token apart from its card handle.
pub(crate) struct TokenState {
    pub reader: String,
    pub protocol: Option<pcsc::Protocol>,
    pub guid: [u8; 16],
    pub nochuid: bool,
    pub ykpiv: bool,
    pub ykver: [u8; 3],
    pub algs: Vec<u8>,
    pub slots: Vec<Slot>,
}

impl TokenState {
    pub(crate) fn new(reader: String, protocol: Option<pcsc::Protocol>) -> Self {
        TokenState {
            reader,
            protocol,
            guid: [0; 16],
            nochuid: false,
            ykpiv: false,
            ykver: [0; 3],
            algs: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    /// Record a card-declared algorithm, up to the bounded capacity.
    pub fn push_alg(&mut self, alg: u8) {
        if self.algs.len() < MAX_CARD_ALGS {
            self.algs.push(alg);
        } else {
            log::warn!(
                "{}: ignoring algorithm {:#04x} beyond the first {}",
                self.reader,
                alg,
                MAX_CARD_ALGS
            );
        }
    }
}

/// One key slot on a token, populated by `Transaction::read_cert`.
pub struct Slot {
    pub(crate) id: SlotId,
    pub(crate) alg: Algorithm,
    pub(crate) cert_der: Vec<u8>,
    pub(crate) subject: String,
    pub(crate) pubkey: PublicKey,
}

impl Slot {
    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn algorithm(&self) -> Algorithm {
        self.alg
    }

    /// Subject DN of the slot certificate.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.pubkey
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Re-parse the stored certificate.
    pub fn certificate(&self) -> Result<Certificate> {
        Certificate::from_der(&self.cert_der)
            .map_err(|e| Error::Invalid(format!("bad certificate DER: {}", e)))
    }
}

/// One PIV card visible through one reader.
pub struct Token {
    pub(crate) card: CardHandle,
    pub(crate) state: TokenState,
}

impl Token {
    /// Reader name this token was found behind.
    pub fn reader(&self) -> &str {
        &self.state.reader
    }

    /// Negotiated transport protocol, when the reader reported one.
    pub fn protocol(&self) -> Option<pcsc::Protocol> {
        self.state.protocol
    }

    /// 16-byte card GUID from the CHUID file; all zero when the card
    /// has no CHUID (see `has_chuid`).
    pub fn guid(&self) -> &[u8; 16] {
        &self.state.guid
    }

    pub fn guid_hex(&self) -> String {
        hex::encode(self.state.guid)
    }

    pub fn has_chuid(&self) -> bool {
        !self.state.nochuid
    }

    pub fn is_yubikey(&self) -> bool {
        self.state.ykpiv
    }

    /// YubiKey applet version, meaningful only when `is_yubikey`.
    pub fn yubikey_version(&self) -> (u8, u8, u8) {
        (self.state.ykver[0], self.state.ykver[1], self.state.ykver[2])
    }

    /// Raw algorithm identifiers the card declared in its property template.
    pub fn algorithms(&self) -> &[u8] {
        &self.state.algs
    }

    pub fn slots(&self) -> &[Slot] {
        &self.state.slots
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.state.slot(id)
    }

    /// Begin an exclusive transaction on this token's card.
    ///
    /// All PIV operations live on the returned guard. Dropping it ends
    /// the transaction, resetting the card if any operation touched
    /// authentication state. A second transaction cannot begin until
    /// the first guard is gone.
    pub fn begin(&mut self) -> Result<Transaction<'_>> {
        let Token { card, state } = self;
        let link = match card {
            CardHandle::Pcsc(card) => TxnLink::Pcsc(Some(card.transaction().map_err(|e| {
                log::error!("SCardBeginTransaction failed on {}: {}", state.reader, e);
                e
            })?)),
            #[cfg(test)]
            CardHandle::Mock(card) => TxnLink::Mock(card),
        };
        Ok(Transaction {
            link,
            state,
            reset: false,
        })
    }
}

pub(crate) enum TxnLink<'t> {
    Pcsc(Option<pcsc::Transaction<'t>>),
    #[cfg(test)]
    Mock(&'t mut crate::testutil::MockCard),
}

/// Exclusive reader transaction on one token.
pub struct Transaction<'t> {
    pub(crate) link: TxnLink<'t>,
    pub(crate) state: &'t mut TokenState,
    pub(crate) reset: bool,
}

impl Transaction<'_> {
    /// End the transaction now instead of at scope exit.
    pub fn end(self) {}
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let disposition = if self.reset {
            Disposition::ResetCard
        } else {
            Disposition::LeaveCard
        };
        match &mut self.link {
            TxnLink::Pcsc(txn) => {
                if let Some(txn) = txn.take() {
                    if let Err((_, e)) = txn.end(disposition) {
                        log::warn!(
                            "SCardEndTransaction failed on {}: {}",
                            self.state.reader,
                            e
                        );
                    }
                }
            }
            #[cfg(test)]
            TxnLink::Mock(card) => card.end_transaction(self.reset),
        }
    }
}

/// Probe one connected card: select the PIV applet, read the CHUID and
/// try the YubiKey version command. A missing CHUID is tolerated.
pub(crate) fn probe_token(token: &mut Token) -> Result<()> {
    let mut txn = token.begin()?;
    txn.select()?;
    match txn.read_chuid() {
        Ok(()) => {}
        Err(Error::NotFound(_)) => txn.state.nochuid = true,
        Err(e) => return Err(e),
    }
    txn.probe_yk_version()?;
    txn.end();
    Ok(())
}

/// Enumerate PIV tokens on every reader visible through `ctx`.
///
/// Readers without a card, without the PIV applet, or that fail the
/// probe are skipped (and their card reset); they never abort the scan.
pub fn enumerate(ctx: &pcsc::Context) -> Result<Vec<Token>> {
    let readers = ctx.list_readers_owned().map_err(|e| {
        log::error!("failed to list readers: {}", e);
        e
    })?;

    let mut tokens = Vec::new();
    for reader in readers {
        let name = reader.to_string_lossy().into_owned();
        let card = match ctx.connect(&reader, ShareMode::Shared, Protocols::ANY) {
            Ok(card) => card,
            Err(e) => {
                log::debug!("could not connect to {}: {}", name, e);
                continue;
            }
        };
        let protocol = card.status2_owned().ok().and_then(|s| s.protocol2());

        let mut token = Token {
            card: CardHandle::Pcsc(card),
            state: TokenState::new(name, protocol),
        };
        match probe_token(&mut token) {
            Ok(()) => {
                log::info!(
                    "found PIV token on {} (guid {})",
                    token.reader(),
                    token.guid_hex()
                );
                tokens.push(token);
            }
            Err(e) => {
                log::debug!("skipping {}: {}", token.reader(), e);
                if let CardHandle::Pcsc(card) = token.card {
                    if let Err((_, e)) = card.disconnect(Disposition::ResetCard) {
                        log::debug!("disconnect failed: {}", e);
                    }
                }
            }
        }
    }

    log::debug!("enumeration found {} PIV tokens", tokens.len());
    Ok(tokens)
}
