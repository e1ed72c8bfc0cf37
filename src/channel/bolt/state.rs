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

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use amplify::ToYamlString;
use bitcoin::hashes::sha256;
use bitcoin::Script;
use secp256k1::PublicKey;

use super::commitment::Commitment;
use super::derivation::commit_point_from_secret;
use super::htlc::{HashPreimage, UpdateLog, UpdateType};
use super::keyset::{ChannelConfig, ChannelType};
use super::shachain::{ShaChainError, ShaChainProducer, ShaChainStore};
use crate::chain::ChainParams;
use crate::channel::Funding;

/// The way the channel is being closed
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub enum CloseType {
    /// Mutually negotiated closing transaction
    #[display("cooperative")]
    Cooperative,

    /// One of the commitment transactions got onto the chain
    #[display("force")]
    ForceClose,

    /// Revoked remote commitment got onto the chain and is being punished
    #[display("breach")]
    BreachRemedy,
}

/// Lifecycle stage of the channel
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub enum Lifecycle {
    /// Funding transaction is not yet locked; only the initial commitments
    /// exist
    #[display("OPENING")]
    Opening,

    /// Channel operates normally
    #[display("ACTIVE")]
    Active,

    /// Channel is being closed
    #[display("CLOSING-{0}")]
    Closing(CloseType),

    /// Funding output spend is final
    #[display("CLOSED")]
    Closed,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::Opening
    }
}

impl Lifecycle {
    #[inline]
    pub fn is_active(self) -> bool {
        self == Lifecycle::Active
    }

    #[inline]
    pub fn is_closing(self) -> bool {
        matches!(self, Lifecycle::Closing(_))
    }
}

/// Durable state of a channel. Everything the channel needs to resume
/// operation, or to act on the chain after a restart, is kept here and
/// passed to the persister before any secret is revealed to the peer.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Display, Serialize, Deserialize),
    serde(crate = "serde_crate"),
    display(ChannelState::to_yaml_string)
)]
pub struct ChannelState {
    /// Chain the channel operates on
    pub chain: ChainParams,

    pub channel_type: ChannelType,

    pub funding: Funding,

    /// Short channel id, assigned once the funding transaction is mined
    pub short_channel_id: Option<u64>,

    /// Whether the local node funded the channel and pays commitment fees
    pub is_initiator: bool,

    /// Current channel lifecycle stage
    pub stage: Lifecycle,

    /// Parameters announced by the local node
    pub local_config: ChannelConfig,

    /// Parameters announced by the remote node
    pub remote_config: ChannelConfig,

    /// Fee rate used by both commitment chains, in satoshis per kiloweight
    pub fee_per_kw: u64,

    /// Commitment number obscuring factor
    pub obfuscator: u64,

    /// Latest unrevoked local commitment; the one the local node can
    /// broadcast
    pub local_commitment: Commitment,

    /// Latest remote commitment the remote node has not revoked yet
    pub remote_commitment: Commitment,

    /// Local commitment received from the remote node which the local node
    /// has not yet acknowledged with a revocation
    pub pending_local_commitment: Option<Commitment>,

    /// Remote commitment signed by the local node, awaiting the remote
    /// revocation of its predecessor
    pub pending_remote_commitment: Option<Commitment>,

    /// Updates proposed by the local node
    pub local_update_log: UpdateLog,

    /// Updates proposed by the remote node
    pub remote_update_log: UpdateLog,

    /// Source of the local per-commitment secrets
    pub local_shachain: ShaChainProducer,

    /// Per-commitment secrets revealed by the remote node
    pub remote_shachain: ShaChainStore,

    /// Per-commitment point of the next remote commitment to sign. Known
    /// once the remote node sends `funding_locked` and renewed with each
    /// revocation.
    pub remote_next_commit_point: Option<PublicKey>,

    /// Script receiving funds swept by the local node
    pub sweep_script: Script,
}

#[cfg(feature = "serde")]
impl ToYamlString for ChannelState {}

impl ChannelState {
    /// Local commitment the next received signature must be for: pending one
    /// if there is any, otherwise the current
    #[inline]
    pub fn local_tip(&self) -> &Commitment {
        self.pending_local_commitment
            .as_ref()
            .unwrap_or(&self.local_commitment)
    }

    #[inline]
    pub fn remote_tip(&self) -> &Commitment {
        self.pending_remote_commitment
            .as_ref()
            .unwrap_or(&self.remote_commitment)
    }

    /// Local balance according to the current local commitment
    #[inline]
    pub fn local_balance_msat(&self) -> u64 {
        self.local_commitment.local_balance_msat
    }

    /// Remote balance according to the current local commitment
    #[inline]
    pub fn remote_balance_msat(&self) -> u64 {
        self.local_commitment.remote_balance_msat
    }

    #[inline]
    pub fn capacity_sat(&self) -> u64 {
        self.funding.amount()
    }

    /// Per-commitment point of the local commitment at `height`
    pub fn local_commit_point(
        &self,
        height: u64,
    ) -> Result<PublicKey, ShaChainError> {
        let secret = self.local_shachain.at_height(height)?;
        Ok(commit_point_from_secret(&secret).expect("negligible probability"))
    }

    /// Preimages of the incoming HTLCs settled by the local node
    pub fn known_preimages(&self) -> BTreeMap<sha256::Hash, HashPreimage> {
        self.local_update_log
            .iter()
            .filter(|entry| entry.entry_type == UpdateType::Settle)
            .filter_map(|entry| entry.preimage)
            .map(|preimage| (preimage.payment_hash(), preimage))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lifecycle_display() {
        assert_eq!(Lifecycle::default(), Lifecycle::Opening);
        assert_eq!(Lifecycle::Active.to_string(), "ACTIVE");
        assert_eq!(
            Lifecycle::Closing(CloseType::BreachRemedy).to_string(),
            "CLOSING-breach"
        );
        assert!(Lifecycle::Closing(CloseType::Cooperative).is_closing());
        assert!(!Lifecycle::Closed.is_active());
    }
}
