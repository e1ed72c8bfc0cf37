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

//! Commitment transaction construction (BOLT-3 "commitment transaction
//! construction" and "fee calculation").

use bitcoin::hashes::sha256;
use bitcoin::{
    OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Txid,
};
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

use super::htlc::{HtlcView, PaymentDescriptor};
use super::keyset::CommitmentKeyRing;
use super::scripts::ScriptGenerators;
use super::state_hint::{set_state_hint, StateHintError};

/// Weight of a commitment transaction without HTLC outputs
pub const COMMITMENT_WEIGHT: u64 = 724;

/// Weight added to a commitment transaction by each HTLC output
pub const HTLC_OUTPUT_WEIGHT: u64 = 172;

/// Weight of an HTLC-timeout transaction
pub const HTLC_TIMEOUT_WEIGHT: u64 = 663;

/// Weight of an HTLC-success transaction
pub const HTLC_SUCCESS_WEIGHT: u64 = 703;

/// Fee, in satoshis, for a transaction of `weight` under `fee_per_kw`
/// satoshis per 1000 weight units
#[inline]
pub fn fee_for_weight(fee_per_kw: u64, weight: u64) -> u64 {
    fee_per_kw * weight / 1000
}

#[inline]
pub fn htlc_timeout_fee(fee_per_kw: u64) -> u64 {
    fee_for_weight(fee_per_kw, HTLC_TIMEOUT_WEIGHT)
}

#[inline]
pub fn htlc_success_fee(fee_per_kw: u64) -> u64 {
    fee_for_weight(fee_per_kw, HTLC_SUCCESS_WEIGHT)
}

/// Whether an HTLC is trimmed from a commitment transaction.
///
/// `incoming` is from the local node point of view; `is_our_commit` tells
/// whether the commitment belongs to the local node. The HTLC is dust if its
/// value does not cover the dust limit plus the fee of the second-level
/// transaction the commitment owner would need to claim it.
pub fn is_htlc_dust(
    incoming: bool,
    is_our_commit: bool,
    fee_per_kw: u64,
    amount_sat: u64,
    dust_limit: u64,
) -> bool {
    let htlc_fee = if incoming == is_our_commit {
        htlc_success_fee(fee_per_kw)
    } else {
        htlc_timeout_fee(fee_per_kw)
    };
    amount_sat < dust_limit + htlc_fee
}

/// Witness script of an HTLC output for the commitment of the local node
/// (`is_our_commit`) or of the remote node
pub fn htlc_witness_script(
    incoming: bool,
    is_our_commit: bool,
    keyring: &CommitmentKeyRing,
    payment_hash: sha256::Hash,
    cltv_expiry: u32,
) -> Script {
    let (owner_key, counterparty_key) = if is_our_commit {
        (keyring.local_htlc_key, keyring.remote_htlc_key)
    } else {
        (keyring.remote_htlc_key, keyring.local_htlc_key)
    };
    // HTLC received by the commitment owner
    if incoming == is_our_commit {
        Script::ln_received_htlc(
            0,
            keyring.revocation_key,
            owner_key,
            counterparty_key,
            cltv_expiry,
            payment_hash,
        )
    } else {
        Script::ln_offered_htlc(
            0,
            keyring.revocation_key,
            owner_key,
            counterparty_key,
            payment_hash,
        )
    }
}

/// Unsigned second-level transaction spending the output of `htlc` on the
/// commitment with `commit_txid`: HTLC-timeout for HTLCs offered by the
/// commitment owner and HTLC-success for the ones it received.
///
/// Returns `None` for HTLCs trimmed from the commitment and for HTLCs
/// whose amount doesn't cover the second-level fee at `fee_per_kw`.
pub fn second_level_tx(
    htlc: &CommittedHtlc,
    is_our_commit: bool,
    commit_txid: Txid,
    fee_per_kw: u64,
    keyring: &CommitmentKeyRing,
    csv_delay: u16,
) -> Option<Transaction> {
    let output_index = htlc.output_index?;
    let (fee, cltv_expiry) = if htlc.incoming == is_our_commit {
        (htlc_success_fee(fee_per_kw), 0)
    } else {
        (htlc_timeout_fee(fee_per_kw), htlc.cltv_expiry)
    };
    Some(Transaction::ln_htlc(
        htlc.amount_sat().checked_sub(fee)?,
        OutPoint::new(commit_txid, output_index),
        cltv_expiry,
        keyring.revocation_key,
        keyring.delay_key,
        csv_delay,
    ))
}

pub trait TxGenerators {
    /// Commitment transaction without HTLC outputs, ordering and state
    /// hint. Outputs below `dust_limit` are omitted; when present
    /// `to_local` goes first.
    #[allow(clippy::too_many_arguments)]
    fn ln_cmt_base(
        local_amount: u64,
        remote_amount: u64,
        funding_outpoint: OutPoint,
        remote_pubkey: PublicKey,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
        dust_limit: u64,
    ) -> Self;

    /// NB: For HTLC Success transaction always set `cltv_expiry` parameter
    ///     to zero!
    fn ln_htlc(
        amount: u64,
        outpoint: OutPoint,
        cltv_expiry: u32,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self;
}

impl TxGenerators for Transaction {
    fn ln_cmt_base(
        local_amount: u64,
        remote_amount: u64,
        funding_outpoint: OutPoint,
        remote_pubkey: PublicKey,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
        dust_limit: u64,
    ) -> Self {
        let mut output = Vec::with_capacity(2);
        if local_amount >= dust_limit {
            output.push(TxOut::ln_to_local(
                local_amount,
                revocationpubkey,
                local_delayedpubkey,
                to_self_delay,
            ));
        }
        if remote_amount >= dust_limit {
            output.push(TxOut::ln_to_remote(remote_amount, remote_pubkey));
        }
        Transaction {
            version: 2,
            lock_time: PackedLockTime::ZERO,
            input: vec![TxIn {
                previous_output: funding_outpoint,
                script_sig: none!(),
                sequence: Sequence::ZERO,
                witness: empty!(),
            }],
            output,
        }
    }

    fn ln_htlc(
        amount: u64,
        outpoint: OutPoint,
        cltv_expiry: u32,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        let txout = TxOut::ln_htlc_output(
            amount,
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        );
        Transaction {
            version: 2,
            lock_time: PackedLockTime(cltv_expiry),
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: none!(),
                sequence: Sequence::ZERO,
                witness: empty!(),
            }],
            output: vec![txout],
        }
    }
}

/// Errors constructing commitment transactions
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error, From
)]
#[display(doc_comments)]
pub enum CommitmentError {
    /// commitment fee of {fee_msat} msat exceeds the total of both channel
    /// balances, {available_msat} msat
    InsufficientBalance { fee_msat: u64, available_msat: u64 },

    #[from]
    #[display(inner)]
    StateHint(StateHintError),
}

/// HTLC committed to by a commitment transaction
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct CommittedHtlc {
    /// Whether the HTLC was offered by the remote node
    pub incoming: bool,

    pub htlc_index: u64,

    pub payment_hash: sha256::Hash,

    pub amount_msat: u64,

    pub cltv_expiry: u32,

    /// Output of the commitment transaction; `None` for trimmed HTLCs
    pub output_index: Option<u32>,

    /// Remote node signature for the second-level transaction spending the
    /// HTLC output of the local commitment
    pub remote_sig: Option<Signature>,
}

impl CommittedHtlc {
    pub fn with(incoming: bool, htlc: &PaymentDescriptor) -> CommittedHtlc {
        CommittedHtlc {
            incoming,
            htlc_index: htlc.htlc_index,
            payment_hash: htlc.payment_hash,
            amount_msat: htlc.amount_msat,
            cltv_expiry: htlc.cltv_expiry,
            output_index: None,
            remote_sig: None,
        }
    }

    #[inline]
    pub fn amount_sat(&self) -> u64 {
        self.amount_msat / 1000
    }

    #[inline]
    pub fn is_dust(&self) -> bool {
        self.output_index.is_none()
    }
}

/// Parameters of a single commitment transaction
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct CommitmentParams {
    pub height: u64,

    /// Whether the commitment belongs to the local node
    pub is_ours: bool,

    /// Local node balance before the commitment fee, HTLCs excluded
    pub local_balance_msat: u64,

    /// Remote node balance before the commitment fee, HTLCs excluded
    pub remote_balance_msat: u64,

    pub fee_per_kw: u64,

    /// Dust limit of the commitment owner
    pub dust_limit: u64,

    /// CSV delay of the commitment owner outputs
    pub csv_delay: u16,

    /// Whether the local node funded the channel and pays the fees
    pub local_is_initiator: bool,

    pub funding_outpoint: OutPoint,

    pub obfuscator: u64,
}

/// A version of the channel state from the point of view of one of the
/// parties
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct Commitment {
    pub height: u64,

    pub is_ours: bool,

    /// Length of the local update log covered by the commitment
    pub our_message_index: u64,

    /// Length of the remote update log covered by the commitment
    pub their_message_index: u64,

    /// Local node HTLC counter at the commitment
    pub our_htlc_index: u64,

    /// Remote node HTLC counter at the commitment
    pub their_htlc_index: u64,

    /// Local node balance after the commitment fee
    pub local_balance_msat: u64,

    /// Remote node balance after the commitment fee
    pub remote_balance_msat: u64,

    pub fee_per_kw: u64,

    pub dust_limit: u64,

    pub fee_sat: u64,

    /// Part of the fee the initiator balance was not able to cover
    pub fee_shortfall_msat: u64,

    pub tx: Transaction,

    pub htlcs: Vec<CommittedHtlc>,

    pub commit_point: PublicKey,

    /// Signature of the counterparty over the commitment transaction
    pub commit_sig: Option<Signature>,
}

impl Commitment {
    /// Builds unsigned commitment transaction for a set of HTLCs
    pub fn build(
        params: CommitmentParams,
        keyring: &CommitmentKeyRing,
        view: &HtlcView,
    ) -> Result<Commitment, CommitmentError> {
        let CommitmentParams {
            height,
            is_ours,
            mut local_balance_msat,
            mut remote_balance_msat,
            fee_per_kw,
            dust_limit,
            csv_delay,
            local_is_initiator,
            funding_outpoint,
            obfuscator,
        } = params;

        let mut htlcs = view
            .our_updates
            .iter()
            .map(|htlc| CommittedHtlc::with(false, htlc))
            .chain(
                view.their_updates
                    .iter()
                    .map(|htlc| CommittedHtlc::with(true, htlc)),
            )
            .collect::<Vec<_>>();

        let non_dust = htlcs
            .iter()
            .filter(|htlc| {
                !is_htlc_dust(
                    htlc.incoming,
                    is_ours,
                    fee_per_kw,
                    htlc.amount_sat(),
                    dust_limit,
                )
            })
            .count() as u64;
        let weight = COMMITMENT_WEIGHT + HTLC_OUTPUT_WEIGHT * non_dust;
        let fee_sat = fee_for_weight(fee_per_kw, weight);
        let fee_msat = fee_sat * 1000;

        let available_msat = local_balance_msat + remote_balance_msat;
        if fee_msat > available_msat {
            return Err(CommitmentError::InsufficientBalance {
                fee_msat,
                available_msat,
            });
        }

        let initiator_balance = if local_is_initiator {
            &mut local_balance_msat
        } else {
            &mut remote_balance_msat
        };
        let mut fee_shortfall_msat = 0;
        if *initiator_balance / 1000 < fee_sat {
            fee_shortfall_msat = fee_msat - *initiator_balance;
            warn!(
                "Commitment fee of {} sat exceeds channel initiator balance, \
                 {} msat are not covered",
                fee_sat, fee_shortfall_msat
            );
            *initiator_balance = 0;
        } else {
            *initiator_balance -= fee_msat;
        }

        let (owner_balance, other_balance) = if is_ours {
            (local_balance_msat, remote_balance_msat)
        } else {
            (remote_balance_msat, local_balance_msat)
        };
        let mut tx = Transaction::ln_cmt_base(
            owner_balance / 1000,
            other_balance / 1000,
            funding_outpoint,
            keyring.no_delay_key,
            keyring.revocation_key,
            keyring.delay_key,
            csv_delay,
            dust_limit,
        );

        // Outputs with the CLTV used to break ties and the HTLC they belong to
        let mut outputs = tx
            .output
            .drain(..)
            .map(|txout| (txout, 0u32, None))
            .collect::<Vec<_>>();
        for (no, htlc) in htlcs.iter().enumerate() {
            if is_htlc_dust(
                htlc.incoming,
                is_ours,
                fee_per_kw,
                htlc.amount_sat(),
                dust_limit,
            ) {
                continue;
            }
            let script = htlc_witness_script(
                htlc.incoming,
                is_ours,
                keyring,
                htlc.payment_hash,
                htlc.cltv_expiry,
            );
            let txout = TxOut {
                value: htlc.amount_sat(),
                script_pubkey: script.to_v0_p2wsh(),
            };
            outputs.push((txout, htlc.cltv_expiry, Some(no)));
        }

        outputs.sort_by(|(txout1, cltv1, _), (txout2, cltv2, _)| {
            txout1
                .value
                .cmp(&txout2.value)
                .then_with(|| {
                    txout1.script_pubkey[..].cmp(&txout2.script_pubkey[..])
                })
                .then_with(|| cltv1.cmp(cltv2))
        });

        for (index, (txout, _, htlc_no)) in outputs.into_iter().enumerate() {
            if let Some(no) = htlc_no {
                htlcs[no].output_index = Some(index as u32);
            }
            tx.output.push(txout);
        }

        set_state_hint(&mut tx, height, obfuscator)?;

        trace!(
            "Constructed {} commitment #{} with {} outputs and {} sat fee",
            if is_ours { "local" } else { "remote" },
            height,
            tx.output.len(),
            fee_sat
        );

        Ok(Commitment {
            height,
            is_ours,
            our_message_index: 0,
            their_message_index: 0,
            our_htlc_index: 0,
            their_htlc_index: 0,
            local_balance_msat,
            remote_balance_msat,
            fee_per_kw,
            dust_limit,
            fee_sat,
            fee_shortfall_msat,
            tx,
            htlcs,
            commit_point: keyring.commit_point,
            commit_sig: None,
        })
    }

    #[inline]
    pub fn txid(&self) -> Txid {
        self.tx.txid()
    }

    /// Balance of the commitment owner
    #[inline]
    pub fn owner_balance_msat(&self) -> u64 {
        if self.is_ours {
            self.local_balance_msat
        } else {
            self.remote_balance_msat
        }
    }

    /// Sum of balances, HTLCs and the fee actually paid; never exceeds the
    /// channel capacity
    pub fn total_msat(&self) -> u64 {
        self.local_balance_msat
            + self.remote_balance_msat
            + self.htlcs.iter().map(|htlc| htlc.amount_msat).sum::<u64>()
            + self.fee_sat * 1000
            - self.fee_shortfall_msat
    }

    /// Balances with the paid fee returned to the initiator; base for the
    /// next commitment
    pub fn pre_fee_balances(&self, local_is_initiator: bool) -> (u64, u64) {
        let paid = self.fee_sat * 1000 - self.fee_shortfall_msat;
        if local_is_initiator {
            (self.local_balance_msat + paid, self.remote_balance_msat)
        } else {
            (self.local_balance_msat, self.remote_balance_msat + paid)
        }
    }

    /// Index of the output paying to the commitment owner with delay
    pub fn to_local_output(
        &self,
        keyring: &CommitmentKeyRing,
        csv_delay: u16,
    ) -> Option<u32> {
        let script_pubkey = Script::ln_to_local(
            0,
            keyring.revocation_key,
            keyring.delay_key,
            csv_delay,
        )
        .to_v0_p2wsh();
        self.tx
            .output
            .iter()
            .position(|txout| txout.script_pubkey == script_pubkey)
            .map(|index| index as u32)
    }

    /// Index of the output paying to the counterparty of the commitment owner
    pub fn to_remote_output(&self, keyring: &CommitmentKeyRing) -> Option<u32> {
        let script_pubkey =
            TxOut::ln_to_remote(0, keyring.no_delay_key).script_pubkey;
        self.tx
            .output
            .iter()
            .position(|txout| txout.script_pubkey == script_pubkey)
            .map(|index| index as u32)
    }

    /// Committed HTLCs which have an output in the transaction
    #[inline]
    pub fn non_dust_htlcs(&self) -> impl Iterator<Item = &CommittedHtlc> {
        self.htlcs.iter().filter(|htlc| !htlc.is_dust())
    }
}
