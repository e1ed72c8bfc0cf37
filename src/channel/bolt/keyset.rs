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

use std::convert::TryFrom;

use amplify::DumbDefault;
#[cfg(feature = "serde")]
use amplify::ToYamlString;
use secp256k1::PublicKey;

use super::derivation::{
    derive_revocation_pubkey, single_tweak, tweak_pubkey,
    tweak_pubkey_with_tweak,
};
use super::scripts::{pubkey_from_slice, ScriptError};

/// Channel type, defining how the `to_remote` key is derived
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Default
)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub enum ChannelType {
    /// Single-funder channel with the `to_remote` key tweaked by the
    /// per-commitment point
    #[display("single-funder")]
    SingleFunder,

    /// Single-funder channel paying `to_remote` directly to the remote
    /// payment basepoint (`option_static_remotekey`)
    #[display("single-funder-tweakless")]
    #[default]
    SingleFunderTweakless,
}

impl ChannelType {
    #[inline]
    pub fn is_tweakless(self) -> bool {
        self == ChannelType::SingleFunderTweakless
    }
}

/// Parameters of one side of the channel, fixed at channel opening.
///
/// Constraints contained in the config bind the *owner* of the config: the
/// HTLCs the owner offers are checked against them.
#[derive(Getters, Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Display, Serialize, Deserialize),
    serde(crate = "serde_crate"),
    display(ChannelConfig::to_yaml_string)
)]
pub struct ChannelConfig {
    /// Outputs below this amount (in satoshis) are not included into
    /// commitment transactions of the config owner
    #[getter(as_copy)]
    pub dust_limit: u64,

    /// Maximum value of outstanding HTLCs, in millisatoshis
    #[getter(as_copy)]
    pub max_pending_amount: u64,

    /// Maximum number of outstanding HTLCs
    #[getter(as_copy)]
    pub max_accepted_htlcs: u16,

    /// Number of blocks the owner waits before spending `to_local` and
    /// second-level HTLC outputs of its own commitment transactions
    #[getter(as_copy)]
    pub csv_delay: u16,

    /// Minimum balance, in satoshis, the owner must keep in the channel
    #[getter(as_copy)]
    pub chan_reserve: u64,

    /// Smallest HTLC value, in millisatoshis, the owner may offer
    #[getter(as_copy)]
    pub min_htlc: u64,

    /// Public key used in the funding outpoint multisig
    #[getter(as_copy)]
    pub multisig_key: PublicKey,

    /// Base point for deriving keys used for penalty spending paths
    #[getter(as_copy)]
    pub revocation_basepoint: PublicKey,

    /// Base point for deriving keys in `to_remote`
    #[getter(as_copy)]
    pub payment_basepoint: PublicKey,

    /// Base point for deriving keys in `to_local` time-locked spending paths
    #[getter(as_copy)]
    pub delay_basepoint: PublicKey,

    /// Base point for deriving HTLC-related keys
    #[getter(as_copy)]
    pub htlc_basepoint: PublicKey,
}

#[cfg(feature = "serde")]
impl ToYamlString for ChannelConfig {}

impl DumbDefault for ChannelConfig {
    fn dumb_default() -> Self {
        ChannelConfig {
            dust_limit: crate::chain::default_dust_limit(),
            max_pending_amount: 0,
            max_accepted_htlcs: 483,
            csv_delay: 144,
            chan_reserve: 0,
            min_htlc: 1,
            multisig_key: dumb_pubkey!(),
            revocation_basepoint: dumb_pubkey!(),
            payment_basepoint: dumb_pubkey!(),
            delay_basepoint: dumb_pubkey!(),
            htlc_basepoint: dumb_pubkey!(),
        }
    }
}

/// Keys for a single commitment transaction, derived from the basepoints of
/// both channel configs and the per-commitment point.
///
/// HTLC keys are always named from the local node point of view, while the
/// delay, no-delay and revocation keys depend on which node owns the
/// commitment.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct CommitmentKeyRing {
    pub commit_point: PublicKey,

    /// Tweak for the local payment basepoint; `None` for tweakless channels
    pub local_commit_key_tweak: Option<[u8; 32]>,

    /// Tweak for the local node HTLC basepoint
    pub local_htlc_key_tweak: [u8; 32],

    pub local_htlc_key: PublicKey,

    pub remote_htlc_key: PublicKey,

    /// Key in the `to_local` delayed branch
    pub delay_key: PublicKey,

    /// Key the `to_remote` output pays to
    pub no_delay_key: PublicKey,

    /// Key in the revocation branches of the owner's outputs
    pub revocation_key: PublicKey,
}

impl CommitmentKeyRing {
    /// Derives key ring for the commitment transaction of the local node
    /// (`is_our_commit`) or of the remote node.
    pub fn derive(
        commit_point: PublicKey,
        is_our_commit: bool,
        channel_type: ChannelType,
        local_cfg: &ChannelConfig,
        remote_cfg: &ChannelConfig,
    ) -> CommitmentKeyRing {
        let local_htlc_key_tweak =
            single_tweak(&commit_point, &local_cfg.htlc_basepoint);
        let local_htlc_key = tweak_pubkey_with_tweak(
            &local_cfg.htlc_basepoint,
            &local_htlc_key_tweak,
        );
        let remote_htlc_key =
            tweak_pubkey(&remote_cfg.htlc_basepoint, &commit_point);

        let (delay_cfg, revocation_cfg, no_delay_cfg) = if is_our_commit {
            (local_cfg, remote_cfg, remote_cfg)
        } else {
            (remote_cfg, local_cfg, local_cfg)
        };
        let delay_key = tweak_pubkey(&delay_cfg.delay_basepoint, &commit_point);
        let revocation_key = derive_revocation_pubkey(
            &revocation_cfg.revocation_basepoint,
            &commit_point,
        );

        let no_delay_base = no_delay_cfg.payment_basepoint;
        let (no_delay_key, local_commit_key_tweak) = if channel_type
            .is_tweakless()
        {
            (no_delay_base, None)
        } else {
            (
                tweak_pubkey(&no_delay_base, &commit_point),
                Some(single_tweak(&commit_point, &local_cfg.payment_basepoint)),
            )
        };

        CommitmentKeyRing {
            commit_point,
            local_commit_key_tweak,
            local_htlc_key_tweak,
            local_htlc_key,
            remote_htlc_key,
            delay_key,
            no_delay_key,
            revocation_key,
        }
    }
}

/// Key ring in the raw form it arrives from external sources (for instance a
/// watchtower, a remote signer or a database record). Converting it into
/// [`CommitmentKeyRing`] is the point where malformed keys get rejected
/// with [`ScriptError::InvalidKeyEncoding`].
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct SerializedKeyRing {
    pub commit_point: Vec<u8>,
    pub local_commit_key_tweak: Option<[u8; 32]>,
    pub local_htlc_key_tweak: [u8; 32],
    pub local_htlc_key: Vec<u8>,
    pub remote_htlc_key: Vec<u8>,
    pub delay_key: Vec<u8>,
    pub no_delay_key: Vec<u8>,
    pub revocation_key: Vec<u8>,
}

impl From<&CommitmentKeyRing> for SerializedKeyRing {
    fn from(ring: &CommitmentKeyRing) -> Self {
        SerializedKeyRing {
            commit_point: ring.commit_point.serialize().to_vec(),
            local_commit_key_tweak: ring.local_commit_key_tweak,
            local_htlc_key_tweak: ring.local_htlc_key_tweak,
            local_htlc_key: ring.local_htlc_key.serialize().to_vec(),
            remote_htlc_key: ring.remote_htlc_key.serialize().to_vec(),
            delay_key: ring.delay_key.serialize().to_vec(),
            no_delay_key: ring.no_delay_key.serialize().to_vec(),
            revocation_key: ring.revocation_key.serialize().to_vec(),
        }
    }
}

impl TryFrom<&SerializedKeyRing> for CommitmentKeyRing {
    type Error = ScriptError;

    fn try_from(raw: &SerializedKeyRing) -> Result<Self, Self::Error> {
        Ok(CommitmentKeyRing {
            commit_point: pubkey_from_slice(&raw.commit_point, "commit_point")?,
            local_commit_key_tweak: raw.local_commit_key_tweak,
            local_htlc_key_tweak: raw.local_htlc_key_tweak,
            local_htlc_key: pubkey_from_slice(
                &raw.local_htlc_key,
                "local_htlc_key",
            )?,
            remote_htlc_key: pubkey_from_slice(
                &raw.remote_htlc_key,
                "remote_htlc_key",
            )?,
            delay_key: pubkey_from_slice(&raw.delay_key, "delay_key")?,
            no_delay_key: pubkey_from_slice(&raw.no_delay_key, "no_delay_key")?,
            revocation_key: pubkey_from_slice(
                &raw.revocation_key,
                "revocation_key",
            )?,
        })
    }
}
