//! APDU transmission and command/response chaining

use crate::apdu::{
    Apdu, CLA_CHAIN, CLA_ISO, INS_CONTINUE, MAX_APDU_REPLY, SHORT_APDU_REPLY,
    SW_BYTES_REMAINING_00, SW_NO_ERROR, SW_WARNING_00, SW_WARNING_NO_CHANGE_00,
};
use crate::error::{Error, Result};
use crate::token::{Transaction, TxnLink};

impl Transaction<'_> {
    /// Transmit one APDU and capture the reply segment and status word.
    pub(crate) fn transceive(&mut self, apdu: &mut Apdu) -> Result<()> {
        apdu.ensure_reply(SHORT_APDU_REPLY);
        let cmd = apdu.encode();
        log::trace!("{}: sending APDU {}", self.state.reader, hex::encode(&*cmd));

        let off = apdu.reply_off;
        let n = match &mut self.link {
            TxnLink::Pcsc(txn) => {
                let txn = txn.as_ref().expect("transaction already ended");
                txn.transmit(&cmd, &mut apdu.reply[off..])
                    .map_err(|e| {
                        log::debug!("SCardTransmit failed on {}: {}", self.state.reader, e);
                        e
                    })?
                    .len()
            }
            #[cfg(test)]
            TxnLink::Mock(card) => card.transmit(&cmd, &mut apdu.reply[off..])?,
        };

        if n < 2 {
            return Err(Error::Invalid(
                "APDU reply shorter than a status word".into(),
            ));
        }
        log::trace!(
            "{}: received APDU {}",
            self.state.reader,
            hex::encode(&apdu.reply[off..off + n])
        );
        apdu.reply_len = n - 2;
        apdu.sw = (apdu.reply[off + n - 2] as u16) << 8 | apdu.reply[off + n - 1] as u16;
        Ok(())
    }

    /// Transmit a logical command of any length.
    ///
    /// Payloads over 255 bytes go out as a chain of slices with the
    /// CLA chain bit set on all but the last; replies signalled with
    /// `61xx` are pulled in with GET RESPONSE and reassembled into one
    /// `(reply_off, reply_len)` span. Only the terminal status word is
    /// surfaced.
    pub(crate) fn transceive_chain(&mut self, apdu: &mut Apdu) -> Result<()> {
        apdu.ensure_reply(MAX_APDU_REPLY);

        let total = apdu.data_len();
        let mut sent = 0;
        loop {
            let rem = total - sent;
            let take = rem.min(0xFF);
            if rem > 0xFF {
                apdu.cls |= CLA_CHAIN;
            } else {
                apdu.cls &= !CLA_CHAIN;
            }
            apdu.cmd_off = sent;
            apdu.cmd_len = take;
            self.transceive(apdu)?;

            match apdu.sw & 0xFF00 {
                SW_NO_ERROR | SW_BYTES_REMAINING_00 | SW_WARNING_NO_CHANGE_00 | SW_WARNING_00 => {
                    sent += take;
                    if sent >= total {
                        break;
                    }
                }
                // any other status ends the chain; the caller sees the SW
                _ => return Ok(()),
            }
        }

        let start = apdu.reply_off;
        while apdu.sw_hi() == 0x61 {
            apdu.cls = CLA_ISO;
            apdu.ins = INS_CONTINUE;
            apdu.p1 = 0;
            apdu.p2 = 0;
            apdu.clear_data();
            apdu.reply_off += apdu.reply_len;
            if apdu.reply_off + SHORT_APDU_REPLY > apdu.reply.len() {
                return Err(Error::Invalid(format!(
                    "chained reply exceeds {} bytes",
                    apdu.reply.len()
                )));
            }
            self.transceive(apdu)?;
        }
        apdu.reply_len += apdu.reply_off - start;
        apdu.reply_off = start;
        Ok(())
    }
}
