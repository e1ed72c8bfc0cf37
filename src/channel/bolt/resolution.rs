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

//! Resolution of HTLC outputs of a commitment transaction which got onto the
//! chain: second-level transactions for the local commitment and direct
//! spends for the remote one.

use std::collections::BTreeMap;

use amplify::Wrapper;
use bitcoin::hashes::sha256;
use bitcoin::{OutPoint, Script, Transaction, Txid};
use secp256k1::ecdsa::Signature;

use super::commitment::{
    htlc_success_fee, htlc_timeout_fee, htlc_witness_script, CommittedHtlc,
    TxGenerators,
};
use super::derivation::single_tweak;
use super::htlc::HashPreimage;
use super::keyset::{ChannelConfig, CommitmentKeyRing};
use super::scripts::ScriptGenerators;
use super::sign::{
    create_sign_descriptor, htlc_success_witness, htlc_timeout_witness,
    SignDescriptor, Signer, SignerError,
};
use crate::chain::ChainParams;

/// Source of known payment preimages
pub trait PreimageCache {
    fn lookup_preimage(&self, payment_hash: &sha256::Hash)
        -> Option<HashPreimage>;
}

impl PreimageCache for BTreeMap<sha256::Hash, HashPreimage> {
    #[inline]
    fn lookup_preimage(
        &self,
        payment_hash: &sha256::Hash,
    ) -> Option<HashPreimage> {
        self.get(payment_hash).copied()
    }
}

/// Errors extracting HTLC resolutions
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error, From
)]
#[display(doc_comments)]
pub enum ResolutionError {
    /// remote node signature for the second-level transaction of HTLC
    /// #{0} was never received
    MissingRemoteSignature(u64),

    /// preimage does not match payment hash of HTLC #{0}
    PreimageMismatch(u64),

    /// HTLC #{htlc_index} can't pay the second-level transaction fee of
    /// {fee_sat} sat
    FeeExceedsHtlc { htlc_index: u64, fee_sat: u64 },

    #[from]
    #[display(inner)]
    Signer(SignerError),
}

/// The way an HTLC output of a confirmed commitment gets spent
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub enum HtlcSpend {
    /// Fully signed second-level transaction ready for broadcast
    Signed(Transaction),

    /// Second-level HTLC-success transaction waiting for the payment
    /// preimage
    Pending(Transaction),

    /// HTLC output of the remote commitment is swept directly using the
    /// sweep sign descriptor
    Direct,
}

impl HtlcSpend {
    /// Second-level transaction, if any, signed or not
    pub fn tx(&self) -> Option<&Transaction> {
        match self {
            HtlcSpend::Signed(tx) | HtlcSpend::Pending(tx) => Some(tx),
            HtlcSpend::Direct => None,
        }
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, HtlcSpend::Pending(_))
    }
}

/// Resolution of an HTLC offered by the local node
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct OutgoingHtlcResolution {
    pub htlc_index: u64,

    /// Absolute height after which the HTLC may be reclaimed
    pub expiry: u32,

    /// HTLC-timeout transaction for the local commitment
    pub spend: HtlcSpend,

    /// Relative delay of `claim_outpoint`
    pub csv_delay: u16,

    /// Output to sweep once the resolution gets confirmed
    pub claim_outpoint: OutPoint,

    pub sweep_sign_desc: SignDescriptor,
}

/// Resolution of an HTLC offered by the remote node
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct IncomingHtlcResolution {
    pub htlc_index: u64,

    pub payment_hash: sha256::Hash,

    /// Absolute height after which the remote node may reclaim the HTLC
    pub expiry: u32,

    pub preimage: Option<HashPreimage>,

    /// HTLC-success transaction for the local commitment
    pub spend: HtlcSpend,

    /// Descriptor for signing the HTLC-success transaction input
    pub success_sign_desc: Option<SignDescriptor>,

    pub remote_sig: Option<Signature>,

    pub csv_delay: u16,

    pub claim_outpoint: OutPoint,

    pub sweep_sign_desc: SignDescriptor,
}

impl IncomingHtlcResolution {
    /// Signs pending HTLC-success transaction once the preimage became
    /// known. Does nothing for already signed or direct spends except
    /// remembering the preimage.
    pub fn complete_with_preimage(
        &mut self,
        preimage: HashPreimage,
        signer: &impl Signer,
    ) -> Result<(), ResolutionError> {
        if preimage.payment_hash() != self.payment_hash {
            return Err(ResolutionError::PreimageMismatch(self.htlc_index));
        }
        self.preimage = Some(preimage);
        let mut tx = match &self.spend {
            HtlcSpend::Pending(tx) => tx.clone(),
            _ => return Ok(()),
        };
        let (desc, remote_sig) = match (&self.success_sign_desc, self.remote_sig)
        {
            (Some(desc), Some(sig)) => (desc, sig),
            _ => {
                return Err(ResolutionError::MissingRemoteSignature(
                    self.htlc_index,
                ))
            }
        };
        let local_sig = signer.sign_output_raw(&tx, desc)?;
        tx.input[0].witness = htlc_success_witness(
            &remote_sig,
            &local_sig,
            preimage.as_inner(),
            &desc.witness_script,
            desc.sighash,
        );
        debug!(
            "Completed HTLC-success transaction {} for HTLC #{}",
            tx.txid(),
            self.htlc_index
        );
        self.spend = HtlcSpend::Signed(tx);
        Ok(())
    }
}

/// Resolutions of all non-dust HTLCs of a commitment
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct HtlcResolutions {
    pub outgoing: Vec<OutgoingHtlcResolution>,
    pub incoming: Vec<IncomingHtlcResolution>,
}

impl HtlcResolutions {
    #[inline]
    pub fn len(&self) -> usize {
        self.outgoing.len() + self.incoming.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.incoming.is_empty()
    }

    /// Second-level transactions which can be broadcast right away
    pub fn signed_txs(&self) -> impl Iterator<Item = &Transaction> {
        self.outgoing
            .iter()
            .map(|res| &res.spend)
            .chain(self.incoming.iter().map(|res| &res.spend))
            .filter_map(|spend| match spend {
                HtlcSpend::Signed(tx) => Some(tx),
                _ => None,
            })
    }
}

/// Sign descriptor for the delayed output of a second-level transaction of
/// the local commitment
fn second_level_sweep_desc(
    tx: &Transaction,
    keyring: &CommitmentKeyRing,
    local_cfg: &ChannelConfig,
    chain: &ChainParams,
) -> SignDescriptor {
    let script = Script::ln_htlc_output(
        0,
        keyring.revocation_key,
        keyring.delay_key,
        local_cfg.csv_delay,
    );
    create_sign_descriptor(
        local_cfg.delay_basepoint,
        Some(single_tweak(&keyring.commit_point, &local_cfg.delay_basepoint)),
        None,
        script,
        tx.output[0].value,
        0,
        chain.sighash,
    )
}

/// Descriptor for the local node spending an HTLC output of the commitment
fn htlc_sign_desc(
    htlc: &CommittedHtlc,
    is_our_commit: bool,
    keyring: &CommitmentKeyRing,
    local_cfg: &ChannelConfig,
    chain: &ChainParams,
) -> SignDescriptor {
    let script = htlc_witness_script(
        htlc.incoming,
        is_our_commit,
        keyring,
        htlc.payment_hash,
        htlc.cltv_expiry,
    );
    create_sign_descriptor(
        local_cfg.htlc_basepoint,
        Some(keyring.local_htlc_key_tweak),
        None,
        script,
        htlc.amount_sat(),
        0,
        chain.sighash,
    )
}

#[allow(clippy::too_many_arguments)]
fn outgoing_resolution(
    fee_per_kw: u64,
    is_our_commit: bool,
    signer: &impl Signer,
    htlc: &CommittedHtlc,
    output_index: u32,
    keyring: &CommitmentKeyRing,
    local_cfg: &ChannelConfig,
    commit_txid: Txid,
    chain: &ChainParams,
) -> Result<OutgoingHtlcResolution, ResolutionError> {
    let commit_outpoint = OutPoint::new(commit_txid, output_index);
    let htlc_desc =
        htlc_sign_desc(htlc, is_our_commit, keyring, local_cfg, chain);

    if !is_our_commit {
        return Ok(OutgoingHtlcResolution {
            htlc_index: htlc.htlc_index,
            expiry: htlc.cltv_expiry,
            spend: HtlcSpend::Direct,
            csv_delay: 0,
            claim_outpoint: commit_outpoint,
            sweep_sign_desc: htlc_desc,
        });
    }

    let remote_sig = htlc
        .remote_sig
        .ok_or(ResolutionError::MissingRemoteSignature(htlc.htlc_index))?;
    let mut tx = Transaction::ln_htlc(
        second_level_value(htlc, htlc_timeout_fee(fee_per_kw))?,
        commit_outpoint,
        htlc.cltv_expiry,
        keyring.revocation_key,
        keyring.delay_key,
        local_cfg.csv_delay,
    );
    let local_sig = signer.sign_output_raw(&tx, &htlc_desc)?;
    tx.input[0].witness = htlc_timeout_witness(
        &remote_sig,
        &local_sig,
        &htlc_desc.witness_script,
        htlc_desc.sighash,
    );
    let sweep_sign_desc =
        second_level_sweep_desc(&tx, keyring, local_cfg, chain);
    let claim_outpoint = OutPoint::new(tx.txid(), 0);
    trace!(
        "Signed HTLC-timeout transaction {} for HTLC #{}",
        claim_outpoint.txid,
        htlc.htlc_index
    );

    Ok(OutgoingHtlcResolution {
        htlc_index: htlc.htlc_index,
        expiry: htlc.cltv_expiry,
        spend: HtlcSpend::Signed(tx),
        csv_delay: local_cfg.csv_delay,
        claim_outpoint,
        sweep_sign_desc,
    })
}

fn second_level_value(
    htlc: &CommittedHtlc,
    fee_sat: u64,
) -> Result<u64, ResolutionError> {
    htlc.amount_sat()
        .checked_sub(fee_sat)
        .ok_or(ResolutionError::FeeExceedsHtlc {
            htlc_index: htlc.htlc_index,
            fee_sat,
        })
}

#[allow(clippy::too_many_arguments)]
fn incoming_resolution(
    fee_per_kw: u64,
    is_our_commit: bool,
    signer: &impl Signer,
    htlc: &CommittedHtlc,
    output_index: u32,
    keyring: &CommitmentKeyRing,
    local_cfg: &ChannelConfig,
    commit_txid: Txid,
    preimages: &impl PreimageCache,
    chain: &ChainParams,
) -> Result<IncomingHtlcResolution, ResolutionError> {
    let commit_outpoint = OutPoint::new(commit_txid, output_index);
    let htlc_desc =
        htlc_sign_desc(htlc, is_our_commit, keyring, local_cfg, chain);
    let preimage = preimages.lookup_preimage(&htlc.payment_hash);

    if !is_our_commit {
        return Ok(IncomingHtlcResolution {
            htlc_index: htlc.htlc_index,
            payment_hash: htlc.payment_hash,
            expiry: htlc.cltv_expiry,
            preimage,
            spend: HtlcSpend::Direct,
            success_sign_desc: None,
            remote_sig: None,
            csv_delay: 0,
            claim_outpoint: commit_outpoint,
            sweep_sign_desc: htlc_desc,
        });
    }

    let remote_sig = htlc
        .remote_sig
        .ok_or(ResolutionError::MissingRemoteSignature(htlc.htlc_index))?;
    let tx = Transaction::ln_htlc(
        second_level_value(htlc, htlc_success_fee(fee_per_kw))?,
        commit_outpoint,
        0,
        keyring.revocation_key,
        keyring.delay_key,
        local_cfg.csv_delay,
    );
    let sweep_sign_desc =
        second_level_sweep_desc(&tx, keyring, local_cfg, chain);
    let mut resolution = IncomingHtlcResolution {
        htlc_index: htlc.htlc_index,
        payment_hash: htlc.payment_hash,
        expiry: htlc.cltv_expiry,
        preimage: None,
        claim_outpoint: OutPoint::new(tx.txid(), 0),
        spend: HtlcSpend::Pending(tx),
        success_sign_desc: Some(htlc_desc),
        remote_sig: Some(remote_sig),
        csv_delay: local_cfg.csv_delay,
        sweep_sign_desc,
    };
    match preimage {
        Some(preimage) => {
            resolution.complete_with_preimage(preimage, signer)?
        }
        None => trace!(
            "Preimage for HTLC #{} is not known yet, HTLC-success transaction \
             is pending",
            htlc.htlc_index
        ),
    }
    Ok(resolution)
}

/// Builds resolutions for every non-dust HTLC of a commitment transaction
/// with `commit_txid`.
///
/// For the local commitment (`is_our_commit`) each HTLC output is spent by a
/// second-level transaction signed by both parties; for the remote one the
/// local node spends the outputs directly.
#[allow(clippy::too_many_arguments)]
pub fn extract_htlc_resolutions(
    fee_per_kw: u64,
    is_our_commit: bool,
    signer: &impl Signer,
    htlcs: &[CommittedHtlc],
    keyring: &CommitmentKeyRing,
    local_cfg: &ChannelConfig,
    remote_cfg: &ChannelConfig,
    commit_txid: Txid,
    preimages: &impl PreimageCache,
    chain: &ChainParams,
) -> Result<HtlcResolutions, ResolutionError> {
    let owner_cfg = if is_our_commit { local_cfg } else { remote_cfg };
    let mut resolutions = HtlcResolutions::default();

    for htlc in htlcs {
        let output_index = match htlc.output_index {
            Some(index) => index,
            None => {
                trace!(
                    "HTLC #{} is trimmed on commitment {} with dust limit {}",
                    htlc.htlc_index,
                    commit_txid,
                    owner_cfg.dust_limit
                );
                continue;
            }
        };
        if htlc.incoming {
            resolutions.incoming.push(incoming_resolution(
                fee_per_kw,
                is_our_commit,
                signer,
                htlc,
                output_index,
                keyring,
                local_cfg,
                commit_txid,
                preimages,
                chain,
            )?);
        } else {
            resolutions.outgoing.push(outgoing_resolution(
                fee_per_kw,
                is_our_commit,
                signer,
                htlc,
                output_index,
                keyring,
                local_cfg,
                commit_txid,
                chain,
            )?);
        }
    }

    debug!(
        "Extracted {} outgoing and {} incoming HTLC resolutions for {} \
         commitment {}",
        resolutions.outgoing.len(),
        resolutions.incoming.len(),
        if is_our_commit { "local" } else { "remote" },
        commit_txid
    );
    Ok(resolutions)
}
