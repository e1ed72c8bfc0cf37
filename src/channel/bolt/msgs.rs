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

//! Channel update messages exchanged with the remote peer. Wire encoding is
//! left to the transport; the messages carry only the data the state
//! machine needs.

use bitcoin::hashes::sha256;
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

use super::htlc::HashPreimage;

#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[display("update_add_htlc({htlc_id}, {amount_msat}, {payment_hash}, ...)")]
pub struct UpdateAddHtlc {
    /// HTLC id, increasing by one for each HTLC offered by the sender
    pub htlc_id: u64,

    pub amount_msat: u64,

    pub payment_hash: sha256::Hash,

    pub cltv_expiry: u32,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[display("update_fulfill_htlc({htlc_id}, ...)")]
pub struct UpdateFulfillHtlc {
    pub htlc_id: u64,

    pub payment_preimage: HashPreimage,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[display("update_fail_htlc({htlc_id}, ...)")]
pub struct UpdateFailHtlc {
    pub htlc_id: u64,

    /// Opaque failure reason, passed back along the route
    pub reason: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[display("commitment_signed({height}, {signature}, ...)")]
pub struct CommitmentSigned {
    /// Height of the signed commitment in the receiver's chain
    pub height: u64,

    /// Signature for the funding input of the receiver's commitment
    pub signature: Signature,

    /// Signatures for the second-level transactions of the receiver, in the
    /// order of HTLC outputs of its commitment transaction
    pub htlc_signatures: Vec<Signature>,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[display("revoke_and_ack({height}, {next_per_commitment_point}, ...)")]
pub struct RevokeAndAck {
    /// Height of the revoked commitment
    pub height: u64,

    /// Secret of the revoked commitment
    pub per_commitment_secret: [u8; 32],

    /// Point for the commitment following the one which just became current
    pub next_per_commitment_point: PublicKey,
}
