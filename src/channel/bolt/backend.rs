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

//! Interface to the blockchain, used for watching the funding output and
//! publishing transactions.

use bitcoin::{Block, BlockHash, OutPoint, Transaction, Txid};

/// Errors reported by a chain backend
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum BackendError {
    /// chain backend is not reachable: {0}
    Connection(String),

    /// block {0} is not known to the chain backend
    UnknownBlock(BlockHash),

    /// transaction {txid} was rejected: {reason}
    Rejected { txid: Txid, reason: String },
}

/// Blockchain access required by the channel
pub trait ChainBackend {
    fn get_block(&self, hash: &BlockHash) -> Result<Block, BackendError>;

    /// Subscribes to a notification when `outpoint` gets spent, scanning
    /// from `height_hint`
    fn notify_spend(
        &self,
        outpoint: OutPoint,
        height_hint: u32,
    ) -> Result<(), BackendError>;

    fn broadcast_tx(&self, tx: &Transaction) -> Result<(), BackendError>;
}

/// Chain events the channel reacts to
#[derive(Clone, PartialEq, Eq, Debug, Display)]
pub enum ChainEvent {
    /// Transaction spending the funding output got confirmed
    #[display("commitment_confirmed({txid})")]
    CommitmentConfirmed { txid: Txid, tx: Transaction },
}
