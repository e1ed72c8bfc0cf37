// LNP/BP Core Library implementing LNPBP specifications & standards
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use bitcoin::psbt::raw::ProprietaryKey;
use bitcoin::psbt::PartiallySignedTransaction as Psbt;
use bitcoin::{OutPoint, Script, Transaction, TxOut, Txid};
use secp256k1::PublicKey;

use super::bolt::ScriptGenerators;

pub const PSBT_LNP_PROPRIETARY_PREFIX: &[u8] = b"LNP";
pub const PSBT_OUT_LNP_CHANNEL_FUNDING: u8 = 0x01;

#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum Error {
    /// no funding output found in the funding transaction. The funding output
    /// must be marked with proprietary key having "LNP" prefix and 0x01
    /// subtype.
    NoFundingOutput,

    /// funding transaction does not contain output #{0} specified as a
    /// funding outpoint
    WrongOutput(u16),

    /// funding output does not pay to the 2-of-2 multisig of the channel
    /// funding keys
    ScriptMismatch,
}

/// Information about channel funding
#[derive(Getters, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct Funding {
    /// PSBT containing full information about the funding of the channel in a
    /// structured way.
    ///
    /// Channel is always funded with a single funding output, that is why we
    /// need a single PSBT.
    psbt: Psbt,

    // Cached information extracted from PSBT, which is the master data source
    #[getter(as_copy)]
    txid: Txid,

    #[getter(as_copy)]
    output: u16,

    #[getter(as_copy)]
    amount: u64,
}

impl Funding {
    #[inline]
    pub fn with(psbt: Psbt) -> Result<Funding, Error> {
        psbt.extract_channel_funding()
    }

    /// Funding for a transaction known only by its outpoint and the funded
    /// amount, for instance when the channel was funded by the remote peer.
    pub fn with_outpoint(outpoint: OutPoint, amount: u64) -> Funding {
        let psbt = Psbt::from_unsigned_tx(Transaction {
            version: 2,
            lock_time: bitcoin::PackedLockTime(0),
            input: vec![],
            output: vec![],
        })
        .expect("dumb manual PSBT creation");
        Funding {
            psbt,
            txid: outpoint.txid,
            output: outpoint.vout as u16,
            amount,
        }
    }

    #[inline]
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.output as u32)
    }

    /// Checks that the funding output pays to the 2-of-2 multisig P2WSH
    /// constructed from the channel funding keys.
    pub fn check_script(
        &self,
        local_funding_key: PublicKey,
        remote_funding_key: PublicKey,
    ) -> Result<(), Error> {
        let expected = TxOut::ln_funding(
            self.amount,
            local_funding_key,
            remote_funding_key,
        );
        match self.psbt.unsigned_tx.output.get(self.output as usize) {
            // Outpoint-only funding carries no transaction to check against
            None if self.psbt.unsigned_tx.output.is_empty() => Ok(()),
            None => Err(Error::WrongOutput(self.output)),
            Some(txout) if *txout == expected => Ok(()),
            Some(_) => Err(Error::ScriptMismatch),
        }
    }

    /// Funding output script pubkey, if the funding transaction is known
    pub fn script_pubkey(&self) -> Option<&Script> {
        self.psbt
            .unsigned_tx
            .output
            .get(self.output as usize)
            .map(|txout| &txout.script_pubkey)
    }
}

fn lnp_out_channel_funding_key() -> ProprietaryKey {
    ProprietaryKey {
        prefix: PSBT_LNP_PROPRIETARY_PREFIX.to_vec(),
        subtype: PSBT_OUT_LNP_CHANNEL_FUNDING,
        key: vec![],
    }
}

pub trait PsbtLnpFunding {
    fn channel_funding_output(&self) -> Option<usize>;
    fn set_channel_funding_output(&mut self, vout: u16) -> Result<(), Error>;
    fn channel_funding_outpoint(&self) -> Result<OutPoint, Error>;
    fn extract_channel_funding(self) -> Result<Funding, Error>;
}

/// Txid of the final funding transaction: script signatures of non-segwit
/// inputs change the txid, so the finalized PSBT is used when available.
fn funding_txid(psbt: &Psbt) -> Txid {
    psbt.clone().extract_tx().txid()
}

impl PsbtLnpFunding for Psbt {
    fn channel_funding_output(&self) -> Option<usize> {
        let funding_key = lnp_out_channel_funding_key();
        self.outputs
            .iter()
            .enumerate()
            .find(|(_, output)| output.proprietary.get(&funding_key).is_some())
            .map(|(index, _)| index)
    }

    fn set_channel_funding_output(&mut self, vout: u16) -> Result<(), Error> {
        self.outputs
            .get_mut(vout as usize)
            .map(|out| {
                out.proprietary
                    .insert(lnp_out_channel_funding_key(), vec![]);
            })
            .ok_or(Error::WrongOutput(vout))
    }

    fn channel_funding_outpoint(&self) -> Result<OutPoint, Error> {
        let vout = self
            .channel_funding_output()
            .ok_or(Error::NoFundingOutput)?;
        Ok(OutPoint::new(funding_txid(self), vout as u32))
    }

    fn extract_channel_funding(self) -> Result<Funding, Error> {
        let vout = self
            .channel_funding_output()
            .ok_or(Error::NoFundingOutput)?;
        let amount = self
            .unsigned_tx
            .output
            .get(vout)
            .ok_or(Error::WrongOutput(vout as u16))?
            .value;
        let txid = funding_txid(&self);
        Ok(Funding {
            psbt: self,
            txid,
            output: vout as u16,
            amount,
        })
    }
}
