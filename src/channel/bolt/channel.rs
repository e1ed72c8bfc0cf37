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

use bitcoin::hashes::sha256;
use bitcoin::{
    OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Txid,
};
use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, SecretKey, SECP256K1};

use super::backend::{BackendError, ChainBackend, ChainEvent};
use super::commitment::{
    fee_for_weight, htlc_witness_script, is_htlc_dust, second_level_tx,
    Commitment, CommitmentError, CommitmentParams, CommittedHtlc,
    COMMITMENT_WEIGHT, HTLC_OUTPUT_WEIGHT,
};
use super::derivation::{commit_point_from_secret, single_tweak};
use super::htlc::{
    compact_logs, evaluate_htlc_view, HashPreimage, HtlcError, HtlcView,
    PaymentDescriptor, UpdateType,
};
use super::keyset::{ChannelConfig, ChannelType, CommitmentKeyRing};
use super::msgs::{
    CommitmentSigned, RevokeAndAck, UpdateAddHtlc, UpdateFailHtlc,
    UpdateFulfillHtlc,
};
use super::persist::{ChannelPersister, PersistError};
use super::policy::{Policy, PolicyError};
use super::resolution::{
    extract_htlc_resolutions, HtlcResolutions, ResolutionError,
};
use super::scripts::ScriptGenerators;
use super::shachain::{
    ShaChainError, ShaChainProducer, ShaChainStore, START_INDEX,
};
use super::sign::{
    create_sign_descriptor, funding_witness, to_local_revoke_witness,
    verify_signature, SignDescriptor, Signer, SignerError,
};
use super::state::{ChannelState, CloseType, Lifecycle};
use super::state_hint::{get_state_hint, obfuscator, StateHintError};
use crate::chain::ChainParams;
use crate::channel::funding::{self, Funding};

/// Weight of the witness spending `to_local` output through the revocation
/// branch
const TO_LOCAL_PENALTY_WITNESS_WEIGHT: u64 = 157;

/// Stages at which the channel exchanges commitment updates
const OPERATIONAL: &[Lifecycle] =
    &[Lifecycle::Active, Lifecycle::Closing(CloseType::Cooperative)];

/// Channel limits an update would break
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum ConstraintViolation {
    /// HTLC amount of {amount_msat} msat is below the minimum of
    /// {minimum_msat} msat accepted by the counterparty
    HtlcBelowMinimum { amount_msat: u64, minimum_msat: u64 },

    /// commitment would carry {count} HTLCs offered by one party, while the
    /// counterparty accepts at most {limit}
    TooManyHtlcs { count: usize, limit: u16 },

    /// {amount_msat} msat offered in HTLCs exceed the in-flight limit of
    /// {limit_msat} msat
    MaxPendingAmountExceeded { amount_msat: u64, limit_msat: u64 },

    /// offering party balance of {balance_msat} msat would fall below the
    /// channel reserve of {reserve_sat} sat
    BelowReserve { balance_msat: u64, reserve_sat: u64 },

    /// channel initiator balance of {balance_msat} msat can't pay the
    /// commitment fee of {fee_sat} sat
    FeeNotAffordable { balance_msat: u64, fee_sat: u64 },

    /// balance is insufficient for the HTLC added with update #{0}
    InsufficientBalance(u64),
}

/// Channel state machine errors
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// channel is in a state {current} incompatible with the requested
    /// operation
    LifecycleMismatch {
        current: Lifecycle,
        required: &'static [Lifecycle],
    },

    /// Error in channel funding: {0}
    #[from]
    Funding(funding::Error),

    /// Policy errors happening during channel negotiation
    #[from]
    #[display(inner)]
    Policy(PolicyError),

    /// initial balance of {balance_msat} msat exceeds channel capacity of
    /// {capacity_msat} msat
    BalanceExceedsCapacity { balance_msat: u64, capacity_msat: u64 },

    /// update violates channel constraints: {0}
    #[from]
    ChannelConstraintViolation(ConstraintViolation),

    #[from]
    #[display(inner)]
    Commitment(CommitmentError),

    #[from]
    #[display(inner)]
    Htlc(HtlcError),

    #[from]
    #[display(inner)]
    StateHint(StateHintError),

    /// per-commitment secret error: {0}
    #[from]
    ShaChain(ShaChainError),

    /// signer failure: {0}
    #[from]
    Signer(SignerError),

    #[from]
    #[display(inner)]
    Resolution(ResolutionError),

    /// channel state was not persisted: {0}
    #[from]
    Persistence(PersistError),

    #[from]
    #[display(inner)]
    Backend(BackendError),

    /// remote node has not revoked its previous commitment yet; no new
    /// commitment can be signed
    RevocationWindowExhausted,

    /// per-commitment point for the next remote commitment is not known
    NoRemoteCommitPoint,

    /// received commitment must be revoked before accepting the next one
    UnrevokedCommitment,

    /// there is no received commitment to revoke the previous one for
    NothingToRevoke,

    /// local commitment transaction has no remote signature
    UnsignedCommitment,

    /// received commitment for height {received} while height {expected}
    /// was expected
    OutOfOrderCommitment { expected: u64, received: u64 },

    /// remote signature for the commitment transaction is invalid
    InvalidCommitSig,

    /// remote signature for the second-level transaction of HTLC #{0} is
    /// invalid
    InvalidHtlcSig(u64),

    /// received {received} HTLC signatures while the commitment has
    /// {expected} HTLC outputs
    HtlcSignatureCount { expected: usize, received: usize },

    /// revocation secret does not match the revoked remote commitment
    InvalidRevocation,

    /// remote node offered HTLC with id {received} while id {expected} was
    /// expected
    UnexpectedHtlcIndex { expected: u64, received: u64 },

    /// HTLC #{0} is not known
    UnknownHtlc(u64),

    /// HTLC #{0} is already being removed
    HtlcAlreadyRemoved(u64),

    /// HTLC #{0} is not yet committed by both parties
    HtlcNotLockedIn(u64),

    /// provided preimage does not match payment hash of HTLC #{0}
    InvalidPreimage(u64),

    /// remote node settled HTLC #{0} with a wrong preimage
    InvalidSettlePreimage(u64),

    /// transaction {0} spending the funding output is not a known commitment
    UnknownCommitment(Txid),
}

impl Error {
    /// Protocol violations by the remote node after which the channel can
    /// only be force-closed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::OutOfOrderCommitment { .. }
                | Error::InvalidCommitSig
                | Error::InvalidHtlcSig(_)
                | Error::HtlcSignatureCount { .. }
                | Error::InvalidRevocation
                | Error::UnexpectedHtlcIndex { .. }
                | Error::InvalidSettlePreimage(_)
        )
    }

    /// Failures which may succeed if retried; channel state is left intact
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Signer(err) => err.is_transient(),
            Error::Persistence(_) | Error::Backend(_) => true,
            _ => false,
        }
    }
}

/// Parameters of a newly funded channel
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ChannelSetup {
    pub chain: ChainParams,

    pub channel_type: ChannelType,

    pub funding: Funding,

    /// Whether the local node funded the channel
    pub is_initiator: bool,

    pub local_config: ChannelConfig,

    pub remote_config: ChannelConfig,

    /// Initial local balance; the rest of the capacity belongs to the remote
    /// node
    pub local_balance_msat: u64,

    pub fee_per_kw: u64,

    /// Seed of the local per-commitment secrets
    pub shachain_seed: [u8; 32],

    /// Per-commitment point of the first remote commitment
    pub remote_first_point: PublicKey,

    /// Script receiving funds swept by the local node
    pub sweep_script: Script,

    /// Policy the remote config is checked against
    pub policy: Policy,
}

/// Output of a broadcasted commitment which the local node can sweep
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SweepableOutput {
    pub outpoint: OutPoint,

    /// Relative timelock, in blocks, before the output can be spent
    pub csv_delay: u16,

    pub sign_desc: SignDescriptor,
}

/// Everything needed to unilaterally close the channel with the local
/// commitment
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ForceCloseSummary {
    /// Fully signed local commitment transaction
    pub close_tx: Transaction,

    /// Delayed output paying to the local node
    pub to_local: Option<SweepableOutput>,

    pub htlc_resolutions: HtlcResolutions,
}

/// Outputs claimable by the local node after the remote node broadcasted its
/// current commitment
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RemoteCloseSummary {
    pub commit_txid: Txid,

    pub to_remote: Option<SweepableOutput>,

    pub htlc_resolutions: HtlcResolutions,
}

/// Punishment for a revoked remote commitment
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BreachRemedy {
    pub commit_txid: Txid,

    /// Height of the revoked commitment which got onto the chain
    pub revoked_height: u64,

    /// Signed transaction sweeping the remote `to_local` output with the
    /// revocation key. Absent if the output was trimmed or can't pay for
    /// its own sweep.
    pub justice_tx: Option<Transaction>,
}

/// Reaction of the channel to a chain event
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ChainAction {
    LocalForceClose(ForceCloseSummary),
    RemoteForceClose(RemoteCloseSummary),
    Breach(BreachRemedy),
    CooperativeClose(Txid),
}

impl ChainAction {
    /// Signed transactions which can be broadcasted right away
    pub fn broadcastable(&self) -> Vec<&Transaction> {
        match self {
            ChainAction::LocalForceClose(summary) => {
                summary.htlc_resolutions.signed_txs().collect()
            }
            ChainAction::Breach(remedy) => {
                remedy.justice_tx.iter().collect()
            }
            ChainAction::RemoteForceClose(_)
            | ChainAction::CooperativeClose(_) => vec![],
        }
    }
}

/// Bidirectional payment channel operated by the local node.
///
/// The channel owns its durable [`ChannelState`] and advances it in
/// response to local commands and messages from the remote node. Each
/// operation either applies completely or leaves the state untouched.
#[derive(Debug)]
pub struct LightningChannel<S, P>
where
    S: Signer,
    P: ChannelPersister,
{
    state: ChannelState,
    signer: S,
    persister: P,
}

impl<S, P> LightningChannel<S, P>
where
    S: Signer,
    P: ChannelPersister,
{
    /// Creates a channel with both initial commitments, checking the remote
    /// config against the policy.
    pub fn new(
        setup: ChannelSetup,
        signer: S,
        persister: P,
    ) -> Result<Self, Error> {
        let ChannelSetup {
            chain,
            channel_type,
            funding,
            is_initiator,
            local_config,
            remote_config,
            local_balance_msat,
            fee_per_kw,
            shachain_seed,
            remote_first_point,
            sweep_script,
            policy,
        } = setup;

        let capacity_msat = funding.amount() * 1000;
        if local_balance_msat > capacity_msat {
            return Err(Error::BalanceExceedsCapacity {
                balance_msat: local_balance_msat,
                capacity_msat,
            });
        }
        if is_initiator {
            policy.confirm_outbound(&local_config, &remote_config)?;
        } else {
            policy.validate_inbound(
                &remote_config,
                funding.amount(),
                fee_per_kw,
            )?;
        }
        funding.check_script(
            local_config.multisig_key,
            remote_config.multisig_key,
        )?;

        let obfuscator = if is_initiator {
            obfuscator(
                local_config.payment_basepoint,
                remote_config.payment_basepoint,
            )
        } else {
            obfuscator(
                remote_config.payment_basepoint,
                local_config.payment_basepoint,
            )
        };
        let local_shachain = ShaChainProducer::with(shachain_seed);
        let local_point = commit_point_from_secret(&local_shachain.at_height(0)?)
            .expect("negligible probability");

        let initial = |is_ours: bool, commit_point: PublicKey| {
            let keyring = CommitmentKeyRing::derive(
                commit_point,
                is_ours,
                channel_type,
                &local_config,
                &remote_config,
            );
            let owner = if is_ours { &local_config } else { &remote_config };
            let params = CommitmentParams {
                height: 0,
                is_ours,
                local_balance_msat,
                remote_balance_msat: capacity_msat - local_balance_msat,
                fee_per_kw,
                dust_limit: owner.dust_limit,
                csv_delay: owner.csv_delay,
                local_is_initiator: is_initiator,
                funding_outpoint: funding.outpoint(),
                obfuscator,
            };
            Commitment::build(params, &keyring, &HtlcView::default())
        };
        let local_commitment = initial(true, local_point)?;
        let remote_commitment = initial(false, remote_first_point)?;

        let state = ChannelState {
            chain,
            channel_type,
            funding,
            short_channel_id: None,
            is_initiator,
            stage: Lifecycle::Opening,
            local_config,
            remote_config,
            fee_per_kw,
            obfuscator,
            local_commitment,
            remote_commitment,
            pending_local_commitment: None,
            pending_remote_commitment: None,
            local_update_log: empty!(),
            remote_update_log: empty!(),
            local_shachain,
            remote_shachain: ShaChainStore::new(),
            remote_next_commit_point: None,
            sweep_script,
        };
        persister.persist(&state)?;
        debug!(
            "Created {} channel with funding {} and {} msat local balance",
            state.channel_type,
            state.funding.outpoint(),
            local_balance_msat
        );

        Ok(LightningChannel {
            state,
            signer,
            persister,
        })
    }

    /// Resumes operation of a channel from its persisted state
    #[inline]
    pub fn restore(state: ChannelState, signer: S, persister: P) -> Self {
        LightningChannel {
            state,
            signer,
            persister,
        }
    }

    #[inline]
    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    #[inline]
    pub fn stage(&self) -> Lifecycle {
        self.state.stage
    }

    #[inline]
    pub fn signer(&self) -> &S {
        &self.signer
    }

    #[inline]
    pub fn local_balance_msat(&self) -> u64 {
        self.state.local_balance_msat()
    }

    #[inline]
    pub fn remote_balance_msat(&self) -> u64 {
        self.state.remote_balance_msat()
    }

    /// Per-commitment point the remote node needs to sign the next local
    /// commitment; sent with `funding_locked`
    pub fn next_local_commit_point(&self) -> Result<PublicKey, Error> {
        Ok(self
            .state
            .local_commit_point(self.state.local_tip().height + 1)?)
    }

    fn require_stage(
        &self,
        required: &'static [Lifecycle],
    ) -> Result<(), Error> {
        if required.contains(&self.state.stage) {
            Ok(())
        } else {
            Err(Error::LifecycleMismatch {
                current: self.state.stage,
                required,
            })
        }
    }

    /// Persists the channel at the new stage; the in-memory state changes
    /// only once the storage accepted it
    fn move_to(&mut self, stage: Lifecycle) -> Result<(), Error> {
        let mut next = self.state.clone();
        next.stage = stage;
        self.persister.persist(&next)?;
        self.state = next;
        Ok(())
    }

    /// Moves channel to force-close on protocol violations by the remote
    /// node
    fn guard<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &result {
            let stage = self.state.stage;
            if err.is_fatal() && OPERATIONAL.contains(&stage) {
                error!("Failing the channel in {} stage: {}", stage, err);
                self.state.stage = Lifecycle::Closing(CloseType::ForceClose);
                if let Err(err) = self.persister.persist(&self.state) {
                    warn!("Unable to persist failed channel state: {}", err);
                }
            }
        }
        result
    }

    /// Signs the initial commitment of the remote node
    pub fn sign_initial_commitment(&self) -> Result<Signature, Error> {
        self.require_stage(&[Lifecycle::Opening])?;
        let desc = self.state.funding_desc(self.state.local_config.multisig_key);
        Ok(self
            .signer
            .sign_output_raw(&self.state.remote_commitment.tx, &desc)?)
    }

    /// Checks remote signature for the initial local commitment
    pub fn verify_initial_commitment(
        &mut self,
        signature: Signature,
    ) -> Result<(), Error> {
        self.require_stage(&[Lifecycle::Opening])?;
        let remote_key = self.state.remote_config.multisig_key;
        let desc = self.state.funding_desc(remote_key);
        if !verify_signature(
            &self.state.local_commitment.tx,
            &desc,
            &signature,
            &remote_key,
        )? {
            return Err(Error::InvalidCommitSig);
        }
        let mut next = self.state.clone();
        next.local_commitment.commit_sig = Some(signature);
        self.persister.persist(&next)?;
        self.state = next;
        Ok(())
    }

    /// Activates the channel once the funding transaction is locked by both
    /// parties
    pub fn mark_funding_locked(
        &mut self,
        short_channel_id: u64,
        remote_next_point: PublicKey,
    ) -> Result<(), Error> {
        self.require_stage(&[Lifecycle::Opening])?;
        if self.state.local_commitment.commit_sig.is_none() {
            return Err(Error::UnsignedCommitment);
        }
        let mut next = self.state.clone();
        next.short_channel_id = Some(short_channel_id);
        next.remote_next_commit_point = Some(remote_next_point);
        next.stage = Lifecycle::Active;
        self.persister.persist(&next)?;
        self.state = next;
        info!("Channel {} is active", self.state.funding.outpoint());
        Ok(())
    }

    /// Offers new HTLC to the remote node
    pub fn add_htlc(
        &mut self,
        payment_hash: sha256::Hash,
        amount_msat: u64,
        cltv_expiry: u32,
    ) -> Result<UpdateAddHtlc, Error> {
        self.require_stage(&[Lifecycle::Active])?;
        let mut next = self.state.clone();
        let htlc_id = next.local_update_log.append_htlc(
            PaymentDescriptor::with_add(payment_hash, amount_msat, cltv_expiry),
        );
        next.validate_htlc_add(false, amount_msat)?;
        self.state = next;
        debug!("Offering HTLC #{} of {} msat", htlc_id, amount_msat);
        Ok(UpdateAddHtlc {
            htlc_id,
            amount_msat,
            payment_hash,
            cltv_expiry,
        })
    }

    /// Accepts HTLC offered by the remote node, returning its id
    pub fn receive_htlc(&mut self, msg: &UpdateAddHtlc) -> Result<u64, Error> {
        let result = self.receive_htlc_inner(msg);
        self.guard(result)
    }

    fn receive_htlc_inner(&mut self, msg: &UpdateAddHtlc) -> Result<u64, Error> {
        self.require_stage(&[Lifecycle::Active])?;
        let expected = self.state.remote_update_log.htlc_counter();
        if msg.htlc_id != expected {
            return Err(Error::UnexpectedHtlcIndex {
                expected,
                received: msg.htlc_id,
            });
        }
        let mut next = self.state.clone();
        let htlc_id =
            next.remote_update_log
                .append_htlc(PaymentDescriptor::with_add(
                    msg.payment_hash,
                    msg.amount_msat,
                    msg.cltv_expiry,
                ));
        next.validate_htlc_add(true, msg.amount_msat)?;
        self.state = next;
        debug!("Received HTLC #{} of {} msat", htlc_id, msg.amount_msat);
        Ok(htlc_id)
    }

    /// Settles HTLC offered by the remote node
    pub fn settle_htlc(
        &mut self,
        preimage: HashPreimage,
        htlc_index: u64,
    ) -> Result<UpdateFulfillHtlc, Error> {
        self.require_stage(OPERATIONAL)?;
        self.state.append_removal(true, htlc_index, Some(preimage))?;
        debug!("Settling HTLC #{}", htlc_index);
        Ok(UpdateFulfillHtlc {
            htlc_id: htlc_index,
            payment_preimage: preimage,
        })
    }

    /// Processes settlement of HTLC offered by the local node
    pub fn receive_htlc_settle(
        &mut self,
        msg: &UpdateFulfillHtlc,
    ) -> Result<(), Error> {
        let result = self.require_stage(OPERATIONAL).and_then(|_| {
            self.state.append_removal(
                false,
                msg.htlc_id,
                Some(msg.payment_preimage),
            )
        });
        self.guard(result)
    }

    /// Fails HTLC offered by the remote node
    pub fn fail_htlc(
        &mut self,
        htlc_index: u64,
        reason: Vec<u8>,
    ) -> Result<UpdateFailHtlc, Error> {
        self.require_stage(OPERATIONAL)?;
        self.state.append_removal(true, htlc_index, None)?;
        debug!("Failing HTLC #{}", htlc_index);
        Ok(UpdateFailHtlc {
            htlc_id: htlc_index,
            reason,
        })
    }

    /// Processes failure of HTLC offered by the local node
    pub fn receive_fail_htlc(
        &mut self,
        msg: &UpdateFailHtlc,
    ) -> Result<(), Error> {
        let result = self
            .require_stage(OPERATIONAL)
            .and_then(|_| self.state.append_removal(false, msg.htlc_id, None));
        self.guard(result)
    }

    /// Signs new remote commitment including all local updates and the
    /// remote updates acknowledged by the local node
    pub fn sign_next_commitment(&mut self) -> Result<CommitmentSigned, Error> {
        self.require_stage(OPERATIONAL)?;
        if self.state.pending_remote_commitment.is_some() {
            return Err(Error::RevocationWindowExhausted);
        }
        let commit_point = self
            .state
            .remote_next_commit_point
            .ok_or(Error::NoRemoteCommitPoint)?;
        let our_log_index = self.state.local_update_log.log_index();
        let their_log_index = self.state.local_commitment.their_message_index;

        let mut next = self.state.clone();
        let commitment = next.next_commitment(
            true,
            our_log_index,
            their_log_index,
            commit_point,
        )?;
        let keyring = next.keyring(commit_point, false);

        let funding_desc = next.funding_desc(next.local_config.multisig_key);
        let signature = self.signer.sign_output_raw(&commitment.tx, &funding_desc)?;

        let txid = commitment.txid();
        let mut htlc_signatures = vec![];
        for htlc in commitment.htlcs_by_output() {
            let tx = match second_level_tx(
                htlc,
                false,
                txid,
                commitment.fee_per_kw,
                &keyring,
                next.remote_config.csv_delay,
            ) {
                Some(tx) => tx,
                None => continue,
            };
            let desc = next.htlc_desc(
                htlc,
                false,
                &keyring,
                next.local_config.htlc_basepoint,
                Some(keyring.local_htlc_key_tweak),
            );
            htlc_signatures.push(self.signer.sign_output_raw(&tx, &desc)?);
        }

        let height = commitment.height;
        next.record_output_indexes(&commitment);
        next.pending_remote_commitment = Some(commitment);
        self.persister.persist(&next)?;
        self.state = next;
        debug!(
            "Signed remote commitment #{} with {} HTLC signatures",
            height,
            htlc_signatures.len()
        );

        Ok(CommitmentSigned {
            height,
            signature,
            htlc_signatures,
        })
    }

    /// Verifies and stores new local commitment signed by the remote node
    pub fn receive_new_commitment(
        &mut self,
        msg: &CommitmentSigned,
    ) -> Result<(), Error> {
        let result = self.receive_new_commitment_inner(msg);
        self.guard(result)
    }

    fn receive_new_commitment_inner(
        &mut self,
        msg: &CommitmentSigned,
    ) -> Result<(), Error> {
        self.require_stage(OPERATIONAL)?;
        if self.state.pending_local_commitment.is_some() {
            return Err(Error::UnrevokedCommitment);
        }
        let expected = self.state.local_commitment.height + 1;
        if msg.height != expected {
            return Err(Error::OutOfOrderCommitment {
                expected,
                received: msg.height,
            });
        }
        let commit_point = self.state.local_commit_point(msg.height)?;
        let our_log_index = self.state.remote_commitment.our_message_index;
        let their_log_index = self.state.remote_update_log.log_index();

        let mut next = self.state.clone();
        let mut commitment = next.next_commitment(
            false,
            our_log_index,
            their_log_index,
            commit_point,
        )?;

        let remote_key = next.remote_config.multisig_key;
        let funding_desc = next.funding_desc(remote_key);
        if !verify_signature(
            &commitment.tx,
            &funding_desc,
            &msg.signature,
            &remote_key,
        )? {
            return Err(Error::InvalidCommitSig);
        }

        let keyring = next.keyring(commit_point, true);
        let txid = commitment.txid();
        let order = commitment
            .htlcs_by_output()
            .map(|htlc| (htlc.incoming, htlc.htlc_index))
            .collect::<Vec<_>>();
        if order.len() != msg.htlc_signatures.len() {
            return Err(Error::HtlcSignatureCount {
                expected: order.len(),
                received: msg.htlc_signatures.len(),
            });
        }
        for ((incoming, htlc_index), signature) in
            order.into_iter().zip(&msg.htlc_signatures)
        {
            let htlc = commitment
                .htlcs
                .iter_mut()
                .find(|htlc| {
                    htlc.incoming == incoming && htlc.htlc_index == htlc_index
                })
                .ok_or(Error::UnknownHtlc(htlc_index))?;
            if let Some(tx) = second_level_tx(
                htlc,
                true,
                txid,
                next.fee_per_kw,
                &keyring,
                next.local_config.csv_delay,
            ) {
                let desc = next.htlc_desc(
                    htlc,
                    true,
                    &keyring,
                    keyring.remote_htlc_key,
                    None,
                );
                if !verify_signature(
                    &tx,
                    &desc,
                    signature,
                    &keyring.remote_htlc_key,
                )? {
                    return Err(Error::InvalidHtlcSig(htlc_index));
                }
                htlc.remote_sig = Some(*signature);
            }
        }

        commitment.commit_sig = Some(msg.signature);
        next.record_output_indexes(&commitment);
        next.pending_local_commitment = Some(commitment);
        self.state = next;
        debug!("Accepted local commitment #{}", msg.height);
        Ok(())
    }

    /// Revokes the current local commitment in favour of the received one.
    ///
    /// The new state is persisted before the per-commitment secret leaves
    /// the channel; if persistence fails nothing is revealed.
    pub fn revoke_current_commitment(&mut self) -> Result<RevokeAndAck, Error> {
        self.require_stage(OPERATIONAL)?;
        let mut next = self.state.clone();
        let pending = next
            .pending_local_commitment
            .take()
            .ok_or(Error::NothingToRevoke)?;
        let height = next.local_commitment.height;
        let per_commitment_secret = next.local_shachain.at_height(height)?;
        let next_per_commitment_point =
            next.local_commit_point(pending.height + 1)?;

        next.local_commitment = pending;
        let (local_tail, remote_tail) =
            (next.local_commitment.height, next.remote_commitment.height);
        compact_logs(
            &mut next.local_update_log,
            &mut next.remote_update_log,
            local_tail,
            remote_tail,
        );

        self.persister.persist(&next)?;
        self.state = next;
        debug!("Revoked local commitment #{}", height);
        Ok(RevokeAndAck {
            height,
            per_commitment_secret,
            next_per_commitment_point,
        })
    }

    /// Processes revocation of the previous remote commitment
    pub fn receive_revocation(&mut self, msg: &RevokeAndAck) -> Result<(), Error> {
        let result = self.receive_revocation_inner(msg);
        self.guard(result)
    }

    fn receive_revocation_inner(
        &mut self,
        msg: &RevokeAndAck,
    ) -> Result<(), Error> {
        self.require_stage(OPERATIONAL)?;
        let mut next = self.state.clone();
        let pending = next
            .pending_remote_commitment
            .take()
            .ok_or(Error::InvalidRevocation)?;
        let revoked = &next.remote_commitment;
        if msg.height != revoked.height {
            return Err(Error::InvalidRevocation);
        }
        let point = commit_point_from_secret(&msg.per_commitment_secret)
            .map_err(|_| Error::InvalidRevocation)?;
        if point != revoked.commit_point {
            return Err(Error::InvalidRevocation);
        }
        // The revealed point must reproduce the revocation key of the
        // revoked `to_local` output
        let keyring = next.keyring(point, false);
        let has_to_local = revoked.owner_balance_msat() / 1000
            >= next.remote_config.dust_limit;
        if has_to_local
            && revoked
                .to_local_output(&keyring, next.remote_config.csv_delay)
                .is_none()
        {
            return Err(Error::InvalidRevocation);
        }

        next.remote_shachain
            .add_entry(START_INDEX - msg.height, msg.per_commitment_secret)
            .map_err(|err| {
                warn!("Remote per-commitment secret rejected: {}", err);
                Error::InvalidRevocation
            })?;
        next.remote_commitment = pending;
        next.remote_next_commit_point = Some(msg.next_per_commitment_point);
        let (local_tail, remote_tail) =
            (next.local_commitment.height, next.remote_commitment.height);
        compact_logs(
            &mut next.local_update_log,
            &mut next.remote_update_log,
            local_tail,
            remote_tail,
        );

        self.persister.persist(&next)?;
        self.state = next;
        debug!("Remote commitment #{} is revoked", msg.height);
        Ok(())
    }

    /// Drops updates which are not yet covered by any signed commitment,
    /// for instance after reconnection
    pub fn revert_uncommitted_updates(&mut self) {
        let state = &mut self.state;
        let (our_log_index, our_htlc_index) = {
            let tip = state.remote_tip();
            (tip.our_message_index, tip.our_htlc_index)
        };
        let (their_log_index, their_htlc_index) = {
            let tip = state.local_tip();
            (tip.their_message_index, tip.their_htlc_index)
        };

        let dropped_local = state
            .local_update_log
            .iter()
            .filter(|entry| entry.log_index >= our_log_index)
            .filter(|entry| entry.entry_type != UpdateType::Add)
            .map(|entry| entry.parent_index)
            .collect::<Vec<_>>();
        let dropped_remote = state
            .remote_update_log
            .iter()
            .filter(|entry| entry.log_index >= their_log_index)
            .filter(|entry| entry.entry_type != UpdateType::Add)
            .map(|entry| entry.parent_index)
            .collect::<Vec<_>>();
        for htlc_index in dropped_local {
            state.remote_update_log.unmark_modified(htlc_index);
        }
        for htlc_index in dropped_remote {
            state.local_update_log.unmark_modified(htlc_index);
        }

        let dropped = state.local_update_log.log_index() - our_log_index
            + state.remote_update_log.log_index()
            - their_log_index;
        state.local_update_log.truncate(our_log_index, our_htlc_index);
        state
            .remote_update_log
            .truncate(their_log_index, their_htlc_index);
        debug!("Reverted {} uncommitted updates", dropped);
    }

    /// Signs the current local commitment and prepares resolutions of all
    /// its outputs. The channel moves to the force-close stage.
    pub fn force_close(&mut self) -> Result<ForceCloseSummary, Error> {
        if self.state.stage == Lifecycle::Closed {
            return Err(Error::LifecycleMismatch {
                current: self.state.stage,
                required: &[
                    Lifecycle::Opening,
                    Lifecycle::Active,
                    Lifecycle::Closing(CloseType::Cooperative),
                    Lifecycle::Closing(CloseType::ForceClose),
                ],
            });
        }
        let summary = self.local_close_summary()?;
        self.move_to(Lifecycle::Closing(CloseType::ForceClose))?;
        warn!(
            "Force-closing channel {} with commitment {}",
            self.state.funding.outpoint(),
            summary.close_tx.txid()
        );
        Ok(summary)
    }

    /// Force-closes the channel and publishes the commitment transaction
    pub fn force_close_and_broadcast(
        &mut self,
        backend: &impl ChainBackend,
    ) -> Result<ForceCloseSummary, Error> {
        let summary = self.force_close()?;
        backend.broadcast_tx(&summary.close_tx)?;
        Ok(summary)
    }

    /// Subscribes for the spending of the funding output
    pub fn watch_funding(
        &self,
        backend: &impl ChainBackend,
        height_hint: u32,
    ) -> Result<(), Error> {
        backend.notify_spend(self.state.funding.outpoint(), height_hint)?;
        Ok(())
    }

    pub fn mark_cooperative_close(&mut self) -> Result<(), Error> {
        self.require_stage(&[Lifecycle::Active])?;
        self.move_to(Lifecycle::Closing(CloseType::Cooperative))
    }

    pub fn mark_closed(&mut self) -> Result<(), Error> {
        self.require_stage(&[
            Lifecycle::Closing(CloseType::Cooperative),
            Lifecycle::Closing(CloseType::ForceClose),
            Lifecycle::Closing(CloseType::BreachRemedy),
        ])?;
        self.move_to(Lifecycle::Closed)?;
        info!("Channel {} is closed", self.state.funding.outpoint());
        Ok(())
    }

    /// Reacts to a transaction spending the funding output
    pub fn handle_chain_event(
        &mut self,
        event: ChainEvent,
    ) -> Result<ChainAction, Error> {
        let ChainEvent::CommitmentConfirmed { txid, tx } = event;
        let action = self.commitment_confirmed(txid, &tx)?;
        let stage = match action {
            ChainAction::LocalForceClose(_)
            | ChainAction::RemoteForceClose(_) => {
                Lifecycle::Closing(CloseType::ForceClose)
            }
            ChainAction::Breach(_) => {
                Lifecycle::Closing(CloseType::BreachRemedy)
            }
            ChainAction::CooperativeClose(_) => Lifecycle::Closed,
        };
        self.move_to(stage)?;
        Ok(action)
    }

    fn commitment_confirmed(
        &self,
        txid: Txid,
        tx: &Transaction,
    ) -> Result<ChainAction, Error> {
        let state = &self.state;
        if txid == state.local_commitment.txid() {
            info!("Local commitment {} got onto the chain", txid);
            return Ok(ChainAction::LocalForceClose(
                self.local_close_summary()?,
            ));
        }
        let remote = [
            Some(&state.remote_commitment),
            state.pending_remote_commitment.as_ref(),
        ]
        .into_iter()
        .flatten()
        .find(|commitment| commitment.txid() == txid);
        if let Some(commitment) = remote {
            info!("Remote commitment {} got onto the chain", txid);
            return Ok(ChainAction::RemoteForceClose(
                self.remote_close_summary(commitment)?,
            ));
        }
        if state.stage == Lifecycle::Closing(CloseType::Cooperative) {
            info!("Cooperative close transaction {} is mined", txid);
            return Ok(ChainAction::CooperativeClose(txid));
        }

        let height = get_state_hint(tx, state.obfuscator)?;
        if height >= state.remote_commitment.height {
            return Err(Error::UnknownCommitment(txid));
        }
        warn!(
            "Revoked remote commitment #{} got onto the chain in {}",
            height, txid
        );
        Ok(ChainAction::Breach(self.breach_remedy(height, txid, tx)?))
    }

    fn local_close_summary(&self) -> Result<ForceCloseSummary, Error> {
        let state = &self.state;
        let commitment = &state.local_commitment;
        let remote_sig =
            commitment.commit_sig.ok_or(Error::UnsignedCommitment)?;
        let local_key = state.local_config.multisig_key;
        let funding_desc = state.funding_desc(local_key);
        let local_sig =
            self.signer.sign_output_raw(&commitment.tx, &funding_desc)?;
        let mut close_tx = commitment.tx.clone();
        close_tx.input[0].witness = funding_witness(
            local_key,
            &local_sig,
            state.remote_config.multisig_key,
            &remote_sig,
            &funding_desc.witness_script,
            state.chain.sighash,
        );
        let txid = close_tx.txid();

        let keyring = state.keyring(commitment.commit_point, true);
        let csv_delay = state.local_config.csv_delay;
        let to_local = commitment
            .to_local_output(&keyring, csv_delay)
            .map(|vout| SweepableOutput {
                outpoint: OutPoint::new(txid, vout),
                csv_delay,
                sign_desc: create_sign_descriptor(
                    state.local_config.delay_basepoint,
                    Some(single_tweak(
                        &commitment.commit_point,
                        &state.local_config.delay_basepoint,
                    )),
                    None,
                    Script::ln_to_local(
                        0,
                        keyring.revocation_key,
                        keyring.delay_key,
                        csv_delay,
                    ),
                    close_tx.output[vout as usize].value,
                    0,
                    state.chain.sighash,
                ),
            });

        let htlc_resolutions = extract_htlc_resolutions(
            commitment.fee_per_kw,
            true,
            &self.signer,
            &commitment.htlcs,
            &keyring,
            &state.local_config,
            &state.remote_config,
            txid,
            &state.known_preimages(),
            &state.chain,
        )?;

        Ok(ForceCloseSummary {
            close_tx,
            to_local,
            htlc_resolutions,
        })
    }

    fn remote_close_summary(
        &self,
        commitment: &Commitment,
    ) -> Result<RemoteCloseSummary, Error> {
        let state = &self.state;
        let commit_txid = commitment.txid();
        let keyring = state.keyring(commitment.commit_point, false);
        let to_remote =
            commitment
                .to_remote_output(&keyring)
                .map(|vout| SweepableOutput {
                    outpoint: OutPoint::new(commit_txid, vout),
                    csv_delay: 0,
                    sign_desc: create_sign_descriptor(
                        state.local_config.payment_basepoint,
                        keyring.local_commit_key_tweak,
                        None,
                        Script::ln_to_remote(0, keyring.no_delay_key),
                        commitment.tx.output[vout as usize].value,
                        0,
                        state.chain.sighash,
                    ),
                });
        let htlc_resolutions = extract_htlc_resolutions(
            commitment.fee_per_kw,
            false,
            &self.signer,
            &commitment.htlcs,
            &keyring,
            &state.local_config,
            &state.remote_config,
            commit_txid,
            &state.known_preimages(),
            &state.chain,
        )?;
        Ok(RemoteCloseSummary {
            commit_txid,
            to_remote,
            htlc_resolutions,
        })
    }

    fn breach_remedy(
        &self,
        height: u64,
        commit_txid: Txid,
        tx: &Transaction,
    ) -> Result<BreachRemedy, Error> {
        let state = &self.state;
        let secret = state.remote_shachain.lookup_height(height)?;
        let commit_secret = SecretKey::from_slice(&secret)
            .map_err(|_| Error::InvalidRevocation)?;
        let point = PublicKey::from_secret_key(SECP256K1, &commit_secret);
        let keyring = state.keyring(point, false);
        let script = Script::ln_to_local(
            0,
            keyring.revocation_key,
            keyring.delay_key,
            state.remote_config.csv_delay,
        );
        let script_pubkey = script.to_v0_p2wsh();

        let vout = match tx
            .output
            .iter()
            .position(|txout| txout.script_pubkey == script_pubkey)
        {
            Some(vout) => vout,
            None => {
                warn!("Revoked commitment {} has no to_local output", commit_txid);
                return Ok(BreachRemedy {
                    commit_txid,
                    revoked_height: height,
                    justice_tx: None,
                });
            }
        };
        let value = tx.output[vout].value;
        let fee = fee_for_weight(
            state.fee_per_kw,
            justice_tx_weight(&state.sweep_script),
        );
        if value <= fee + state.local_config.dust_limit {
            warn!(
                "Revoked to_local output of {} sat can't pay for its sweep",
                value
            );
            return Ok(BreachRemedy {
                commit_txid,
                revoked_height: height,
                justice_tx: None,
            });
        }

        let mut justice_tx = Transaction {
            version: 2,
            lock_time: PackedLockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(commit_txid, vout as u32),
                script_sig: none!(),
                sequence: Sequence::ZERO,
                witness: empty!(),
            }],
            output: vec![TxOut {
                value: value - fee,
                script_pubkey: state.sweep_script.clone(),
            }],
        };
        let desc = create_sign_descriptor(
            state.local_config.revocation_basepoint,
            None,
            Some(commit_secret),
            script,
            value,
            0,
            state.chain.sighash,
        );
        let signature = self.signer.sign_output_raw(&justice_tx, &desc)?;
        justice_tx.input[0].witness = to_local_revoke_witness(
            &signature,
            &desc.witness_script,
            desc.sighash,
        );
        info!(
            "Constructed justice transaction {} sweeping {} sat",
            justice_tx.txid(),
            value - fee
        );

        Ok(BreachRemedy {
            commit_txid,
            revoked_height: height,
            justice_tx: Some(justice_tx),
        })
    }
}

/// Weight of the justice transaction with a single input and an output
/// paying to `sweep_script`
fn justice_tx_weight(sweep_script: &Script) -> u64 {
    // version, input count, input, output count, amount, script length,
    // script and locktime
    let base = 4 + 1 + 41 + 1 + 8 + 1 + sweep_script.len() as u64 + 4;
    // segwit marker and flag
    base * 4 + 2 + TO_LOCAL_PENALTY_WITNESS_WEIGHT
}

impl Commitment {
    /// Non-dust HTLCs in the order of their outputs
    fn htlcs_by_output(&self) -> impl Iterator<Item = &CommittedHtlc> {
        let mut htlcs = self.non_dust_htlcs().collect::<Vec<_>>();
        htlcs.sort_by_key(|htlc| htlc.output_index);
        htlcs.into_iter()
    }
}

impl ChannelState {
    fn tip(&self, remote_chain: bool) -> &Commitment {
        if remote_chain {
            self.remote_tip()
        } else {
            self.local_tip()
        }
    }

    /// Config of the owner of the commitments in the chain
    fn owner_config(&self, remote_chain: bool) -> &ChannelConfig {
        if remote_chain {
            &self.remote_config
        } else {
            &self.local_config
        }
    }

    fn keyring(
        &self,
        commit_point: PublicKey,
        is_our_commit: bool,
    ) -> CommitmentKeyRing {
        CommitmentKeyRing::derive(
            commit_point,
            is_our_commit,
            self.channel_type,
            &self.local_config,
            &self.remote_config,
        )
    }

    /// Descriptor for the funding input of a commitment transaction signed
    /// with `key`
    fn funding_desc(&self, key: PublicKey) -> SignDescriptor {
        let script = Script::ln_funding(
            0,
            self.local_config.multisig_key,
            self.remote_config.multisig_key,
        );
        create_sign_descriptor(
            key,
            None,
            None,
            script,
            self.funding.amount(),
            0,
            self.chain.sighash,
        )
    }

    /// Descriptor for the input of a second-level transaction spending
    /// `htlc`
    fn htlc_desc(
        &self,
        htlc: &CommittedHtlc,
        is_our_commit: bool,
        keyring: &CommitmentKeyRing,
        key: PublicKey,
        single_tweak: Option<[u8; 32]>,
    ) -> SignDescriptor {
        let script = htlc_witness_script(
            htlc.incoming,
            is_our_commit,
            keyring,
            htlc.payment_hash,
            htlc.cltv_expiry,
        );
        create_sign_descriptor(
            key,
            single_tweak,
            None,
            script,
            htlc.amount_sat(),
            0,
            self.chain.sighash,
        )
    }

    /// Builds the next commitment of the chain with updates up to the given
    /// log indexes and marks newly included updates with its height
    fn next_commitment(
        &mut self,
        remote_chain: bool,
        our_log_index: u64,
        their_log_index: u64,
        commit_point: PublicKey,
    ) -> Result<Commitment, Error> {
        let (height, (mut our_balance, mut their_balance)) = {
            let tip = self.tip(remote_chain);
            (tip.height + 1, tip.pre_fee_balances(self.is_initiator))
        };
        let view = evaluate_htlc_view(
            &mut self.local_update_log,
            &mut self.remote_update_log,
            our_log_index,
            their_log_index,
            &mut our_balance,
            &mut their_balance,
            height,
            remote_chain,
            true,
        )?;

        let keyring = self.keyring(commit_point, !remote_chain);
        let owner = self.owner_config(remote_chain);
        let params = CommitmentParams {
            height,
            is_ours: !remote_chain,
            local_balance_msat: our_balance,
            remote_balance_msat: their_balance,
            fee_per_kw: self.fee_per_kw,
            dust_limit: owner.dust_limit,
            csv_delay: owner.csv_delay,
            local_is_initiator: self.is_initiator,
            funding_outpoint: self.funding.outpoint(),
            obfuscator: self.obfuscator,
        };
        let mut commitment = Commitment::build(params, &keyring, &view)?;
        commitment.our_message_index = our_log_index;
        commitment.their_message_index = their_log_index;
        commitment.our_htlc_index = self.local_update_log.htlc_counter();
        commitment.their_htlc_index = self.remote_update_log.htlc_counter();
        Ok(commitment)
    }

    /// Stores output indexes of the committed HTLCs in the update logs
    fn record_output_indexes(&mut self, commitment: &Commitment) {
        for htlc in &commitment.htlcs {
            let log = if htlc.incoming {
                &mut self.remote_update_log
            } else {
                &mut self.local_update_log
            };
            if let Some(entry) = log.lookup_htlc_mut(htlc.htlc_index) {
                if commitment.is_ours {
                    entry.local_output_index = htlc.output_index;
                } else {
                    entry.remote_output_index = htlc.output_index;
                }
            }
        }
    }

    /// Checks that the next commitment accepting a new HTLC, already
    /// appended to the log, satisfies the channel constraints
    fn validate_htlc_add(
        &self,
        incoming: bool,
        amount_msat: u64,
    ) -> Result<(), Error> {
        // HTLCs offered by the local node first appear in the remote
        // commitment and vice versa
        let remote_chain = !incoming;
        let (acceptor, offerer) = if incoming {
            (&self.local_config, &self.remote_config)
        } else {
            (&self.remote_config, &self.local_config)
        };
        if amount_msat < acceptor.min_htlc {
            return Err(ConstraintViolation::HtlcBelowMinimum {
                amount_msat,
                minimum_msat: acceptor.min_htlc,
            }
            .into());
        }

        let (our_log_index, their_log_index) = if remote_chain {
            (
                self.local_update_log.log_index(),
                self.local_commitment.their_message_index,
            )
        } else {
            (
                self.remote_commitment.our_message_index,
                self.remote_update_log.log_index(),
            )
        };
        let tip = self.tip(remote_chain);
        let (mut our_balance, mut their_balance) =
            tip.pre_fee_balances(self.is_initiator);
        let view = evaluate_htlc_view(
            &mut self.local_update_log.clone(),
            &mut self.remote_update_log.clone(),
            our_log_index,
            their_log_index,
            &mut our_balance,
            &mut their_balance,
            tip.height + 1,
            remote_chain,
            false,
        )
        .map_err(|err| match err {
            HtlcError::NegativeBalance(log_index) => {
                ConstraintViolation::InsufficientBalance(log_index).into()
            }
            err => Error::from(err),
        })?;

        let offered = if incoming {
            &view.their_updates
        } else {
            &view.our_updates
        };
        if offered.len() > acceptor.max_accepted_htlcs as usize {
            return Err(ConstraintViolation::TooManyHtlcs {
                count: offered.len(),
                limit: acceptor.max_accepted_htlcs,
            }
            .into());
        }
        let in_flight = offered.iter().map(|htlc| htlc.amount_msat).sum::<u64>();
        if in_flight > acceptor.max_pending_amount {
            return Err(ConstraintViolation::MaxPendingAmountExceeded {
                amount_msat: in_flight,
                limit_msat: acceptor.max_pending_amount,
            }
            .into());
        }

        let owner = self.owner_config(remote_chain);
        let non_dust = view
            .our_updates
            .iter()
            .map(|htlc| (false, htlc))
            .chain(view.their_updates.iter().map(|htlc| (true, htlc)))
            .filter(|(incoming, htlc)| {
                !is_htlc_dust(
                    *incoming,
                    !remote_chain,
                    self.fee_per_kw,
                    htlc.amount_msat / 1000,
                    owner.dust_limit,
                )
            })
            .count() as u64;
        let fee_sat = fee_for_weight(
            self.fee_per_kw,
            COMMITMENT_WEIGHT + HTLC_OUTPUT_WEIGHT * non_dust,
        );
        let initiator_balance = if self.is_initiator {
            &mut our_balance
        } else {
            &mut their_balance
        };
        if *initiator_balance < fee_sat * 1000 {
            return Err(ConstraintViolation::FeeNotAffordable {
                balance_msat: *initiator_balance,
                fee_sat,
            }
            .into());
        }
        *initiator_balance -= fee_sat * 1000;
        let initiator_balance = *initiator_balance;

        // The offerer pays the HTLC and the initiator pays for its output;
        // neither may end up below its own reserve
        let offerer_balance = if incoming { their_balance } else { our_balance };
        let initiator = if self.is_initiator {
            &self.local_config
        } else {
            &self.remote_config
        };
        for (balance_msat, config) in
            [(offerer_balance, offerer), (initiator_balance, initiator)]
        {
            let reserve_sat = config.chan_reserve.max(config.dust_limit);
            if balance_msat < reserve_sat * 1000 {
                return Err(ConstraintViolation::BelowReserve {
                    balance_msat,
                    reserve_sat,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Appends settle (with preimage) or fail entry for an HTLC. With
    /// `local` the local node removes HTLC offered by the remote one.
    fn append_removal(
        &mut self,
        local: bool,
        htlc_index: u64,
        preimage: Option<HashPreimage>,
    ) -> Result<(), Error> {
        let (htlc_log, update_log) = if local {
            (&mut self.remote_update_log, &mut self.local_update_log)
        } else {
            (&mut self.local_update_log, &mut self.remote_update_log)
        };
        let htlc = htlc_log
            .lookup_htlc(htlc_index)
            .ok_or(Error::UnknownHtlc(htlc_index))?;
        if htlc_log.is_modified(htlc_index) {
            return Err(Error::HtlcAlreadyRemoved(htlc_index));
        }
        if !htlc.is_locked_in() {
            return Err(Error::HtlcNotLockedIn(htlc_index));
        }
        if let Some(preimage) = preimage {
            if preimage.payment_hash() != htlc.payment_hash {
                return Err(if local {
                    Error::InvalidPreimage(htlc_index)
                } else {
                    Error::InvalidSettlePreimage(htlc_index)
                });
            }
        }
        let entry = PaymentDescriptor::with_removal(htlc, preimage);
        update_log.append_update(entry);
        htlc_log.mark_modified(htlc_index);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use bitcoin::hashes::Hash;
    use bitcoin::WPubkeyHash;

    use super::*;
    use crate::channel::bolt::interpreter::Interpreter;
    use crate::channel::bolt::keyset::test::{config_with_secrets, TestSecrets};
    use crate::channel::bolt::persist::MemoryPersister;
    use crate::channel::bolt::sign::{to_remote_witness, MemorySigner};

    const CAPACITY: u64 = 1_000_000;
    const FEE_PER_KW: u64 = 253;
    const BOB_BALANCE_MSAT: u64 = 200_000_000;
    const ALICE_SEED: [u8; 32] = [0xAA; 32];
    const BOB_SEED: [u8; 32] = [0xBB; 32];

    /// Memory signer which can be switched off to emulate an unresponsive
    /// device
    #[derive(Clone, Debug)]
    struct TestSigner {
        inner: MemorySigner,
        offline: Arc<AtomicBool>,
    }

    impl Signer for TestSigner {
        fn sign_output_raw(
            &self,
            tx: &Transaction,
            desc: &SignDescriptor,
        ) -> Result<Signature, SignerError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(SignerError::HardwareTimeout(100));
            }
            self.inner.sign_output_raw(tx, desc)
        }
    }

    type Node = LightningChannel<TestSigner, MemoryPersister>;

    struct Peer {
        node: Node,
        persister: MemoryPersister,
        offline: Arc<AtomicBool>,
        secrets: TestSecrets,
    }

    fn commit_point(seed: [u8; 32], height: u64) -> PublicKey {
        let secret = ShaChainProducer::with(seed).at_height(height).unwrap();
        commit_point_from_secret(&secret).unwrap()
    }

    fn funding() -> Funding {
        Funding::with_outpoint(
            OutPoint::new(Txid::hash(b"funding transaction"), 0),
            CAPACITY,
        )
    }

    fn peer(
        is_initiator: bool,
        local: (ChannelConfig, TestSecrets),
        remote: &ChannelConfig,
    ) -> Peer {
        let (local_config, secrets) = local;
        let (seed, remote_seed, local_balance_msat) = if is_initiator {
            (ALICE_SEED, BOB_SEED, CAPACITY * 1000 - BOB_BALANCE_MSAT)
        } else {
            (BOB_SEED, ALICE_SEED, BOB_BALANCE_MSAT)
        };
        let setup = ChannelSetup {
            chain: ChainParams::bitgold_regtest(),
            channel_type: ChannelType::SingleFunder,
            funding: funding(),
            is_initiator,
            local_config,
            remote_config: remote.clone(),
            local_balance_msat,
            fee_per_kw: FEE_PER_KW,
            shachain_seed: seed,
            remote_first_point: commit_point(remote_seed, 0),
            sweep_script: Script::new_v0_p2wpkh(&WPubkeyHash::hash(&seed)),
            policy: Policy::default(),
        };
        let offline = Arc::new(AtomicBool::new(false));
        let signer = TestSigner {
            inner: MemorySigner::with(secrets.all()),
            offline: offline.clone(),
        };
        let persister = MemoryPersister::new();
        let node = LightningChannel::new(setup, signer, persister.clone())
            .unwrap();
        Peer {
            node,
            persister,
            offline,
            secrets,
        }
    }

    /// Alice funds the channel and gives 200 000 sat to Bob
    fn open_channel() -> (Peer, Peer) {
        let alice_config = config_with_secrets(1);
        let bob_config = config_with_secrets(11);
        let mut alice = peer(true, alice_config.clone(), &bob_config.0);
        let mut bob = peer(false, bob_config, &alice_config.0);

        let sig = alice.node.sign_initial_commitment().unwrap();
        bob.node.verify_initial_commitment(sig).unwrap();
        let sig = bob.node.sign_initial_commitment().unwrap();
        alice.node.verify_initial_commitment(sig).unwrap();

        let alice_point = alice.node.next_local_commit_point().unwrap();
        let bob_point = bob.node.next_local_commit_point().unwrap();
        alice.node.mark_funding_locked(42 << 40, bob_point).unwrap();
        bob.node.mark_funding_locked(42 << 40, alice_point).unwrap();
        (alice, bob)
    }

    fn exchange_commitment(sender: &mut Node, receiver: &mut Node) {
        let msg = sender.sign_next_commitment().unwrap();
        receiver.receive_new_commitment(&msg).unwrap();
        let revocation = receiver.revoke_current_commitment().unwrap();
        sender.receive_revocation(&revocation).unwrap();
    }

    fn lock_in(initiator: &mut Node, responder: &mut Node) {
        exchange_commitment(initiator, responder);
        exchange_commitment(responder, initiator);
    }

    fn preimage(no: u8) -> HashPreimage {
        HashPreimage::from([no; 32])
    }

    fn initial_fee_msat() -> u64 {
        fee_for_weight(FEE_PER_KW, COMMITMENT_WEIGHT) * 1000
    }

    #[test]
    fn opening() {
        let (alice, bob) = open_channel();
        assert_eq!(alice.node.stage(), Lifecycle::Active);
        assert_eq!(bob.node.stage(), Lifecycle::Active);
        assert_eq!(
            alice.node.local_balance_msat(),
            CAPACITY * 1000 - BOB_BALANCE_MSAT - initial_fee_msat()
        );
        assert_eq!(bob.node.local_balance_msat(), BOB_BALANCE_MSAT);
        assert_eq!(
            alice.node.state().local_commitment.txid(),
            bob.node.state().remote_commitment.txid()
        );
        assert_eq!(
            alice.node.state().remote_commitment.txid(),
            bob.node.state().local_commitment.txid()
        );
        assert_eq!(
            alice.persister.last_state().unwrap().unwrap(),
            *alice.node.state()
        );
    }

    #[test]
    fn lifecycle_enforced() {
        let alice_config = config_with_secrets(1);
        let bob_config = config_with_secrets(11);
        let mut alice = peer(true, alice_config, &bob_config.0);
        assert_eq!(
            alice.node.add_htlc(preimage(1).payment_hash(), 1_000_000, 500),
            Err(Error::LifecycleMismatch {
                current: Lifecycle::Opening,
                required: &[Lifecycle::Active],
            })
        );
        assert_eq!(
            alice.node.mark_funding_locked(1, commit_point(BOB_SEED, 1)),
            Err(Error::UnsignedCommitment)
        );
    }

    #[test]
    fn htlc_settle() {
        let (mut alice, mut bob) = open_channel();
        let payment_hash = preimage(1).payment_hash();

        let add = alice.node.add_htlc(payment_hash, 50_000_000, 500).unwrap();
        assert_eq!(add.htlc_id, 0);
        assert_eq!(bob.node.receive_htlc(&add).unwrap(), 0);
        lock_in(&mut alice.node, &mut bob.node);

        let htlc = &bob.node.state().local_commitment.htlcs[0];
        assert!(htlc.incoming);
        assert!(htlc.output_index.is_some());
        assert!(htlc.remote_sig.is_some());
        assert_eq!(bob.node.local_balance_msat(), BOB_BALANCE_MSAT);

        assert_eq!(
            bob.node.settle_htlc(preimage(2), 0),
            Err(Error::InvalidPreimage(0))
        );
        let settle = bob.node.settle_htlc(preimage(1), 0).unwrap();
        assert_eq!(
            bob.node.settle_htlc(preimage(1), 0),
            Err(Error::HtlcAlreadyRemoved(0))
        );
        alice.node.receive_htlc_settle(&settle).unwrap();
        lock_in(&mut bob.node, &mut alice.node);

        assert_eq!(bob.node.local_balance_msat(), BOB_BALANCE_MSAT + 50_000_000);
        assert_eq!(
            alice.node.local_balance_msat(),
            CAPACITY * 1000 - BOB_BALANCE_MSAT - 50_000_000 - initial_fee_msat()
        );
        assert_eq!(
            alice.node.remote_balance_msat(),
            bob.node.local_balance_msat()
        );
        for node in [&alice.node, &bob.node] {
            assert!(node.state().local_update_log.is_empty());
            assert!(node.state().remote_update_log.is_empty());
            assert_eq!(node.state().local_commitment.height, 2);
            assert_eq!(node.state().remote_commitment.height, 2);
        }
    }

    #[test]
    fn htlc_fail() {
        let (mut alice, mut bob) = open_channel();
        let add = bob
            .node
            .add_htlc(preimage(3).payment_hash(), 30_000_000, 600)
            .unwrap();
        alice.node.receive_htlc(&add).unwrap();
        lock_in(&mut bob.node, &mut alice.node);
        assert_eq!(
            bob.node.local_balance_msat(),
            BOB_BALANCE_MSAT - 30_000_000
        );

        let fail = alice.node.fail_htlc(0, b"unknown payment".to_vec()).unwrap();
        bob.node.receive_fail_htlc(&fail).unwrap();
        lock_in(&mut alice.node, &mut bob.node);

        assert_eq!(bob.node.local_balance_msat(), BOB_BALANCE_MSAT);
        assert_eq!(alice.node.remote_balance_msat(), BOB_BALANCE_MSAT);
        assert!(bob.node.state().local_update_log.is_empty());
    }

    #[test]
    fn settle_before_lock_in() {
        let (mut alice, mut bob) = open_channel();
        let add = alice
            .node
            .add_htlc(preimage(1).payment_hash(), 5_000_000, 500)
            .unwrap();
        bob.node.receive_htlc(&add).unwrap();
        assert_eq!(
            bob.node.settle_htlc(preimage(1), 0),
            Err(Error::HtlcNotLockedIn(0))
        );
        assert_eq!(bob.node.settle_htlc(preimage(1), 1), Err(Error::UnknownHtlc(1)));
    }

    #[test]
    fn constraint_violations() {
        let (mut alice, mut bob) = open_channel();
        let before = bob.node.state().clone();

        // Bob would go below his reserve of 10 000 sat
        let err = bob
            .node
            .add_htlc(preimage(1).payment_hash(), 195_000_000, 500)
            .unwrap_err();
        assert_eq!(
            err,
            Error::ChannelConstraintViolation(ConstraintViolation::BelowReserve {
                balance_msat: 5_000_000,
                reserve_sat: 10_000
            })
        );
        assert!(!err.is_fatal());
        assert_eq!(*bob.node.state(), before);

        assert_eq!(
            bob.node.add_htlc(preimage(1).payment_hash(), 999, 500),
            Err(Error::ChannelConstraintViolation(
                ConstraintViolation::HtlcBelowMinimum {
                    amount_msat: 999,
                    minimum_msat: 1000
                }
            ))
        );
        assert_eq!(
            bob.node.add_htlc(preimage(1).payment_hash(), 250_000_000, 500),
            Err(Error::ChannelConstraintViolation(
                ConstraintViolation::InsufficientBalance(0)
            ))
        );
        assert_eq!(*bob.node.state(), before);

        // Remote HTLC violating the reserve is rejected as well, without
        // failing the channel
        let add = UpdateAddHtlc {
            htlc_id: 0,
            amount_msat: 195_000_000,
            payment_hash: preimage(1).payment_hash(),
            cltv_expiry: 500,
        };
        let before = alice.node.state().clone();
        assert!(matches!(
            alice.node.receive_htlc(&add),
            Err(Error::ChannelConstraintViolation(
                ConstraintViolation::BelowReserve { .. }
            ))
        ));
        assert_eq!(*alice.node.state(), before);
        assert_eq!(alice.node.stage(), Lifecycle::Active);
    }

    #[test]
    fn initiator_reserve() {
        let (mut alice, mut bob) = open_channel();

        // Leaves Alice 10 020 sat above the fee of a single-HTLC commitment
        let add = alice
            .node
            .add_htlc(preimage(1).payment_hash(), 789_754_000, 500)
            .unwrap();
        bob.node.receive_htlc(&add).unwrap();
        lock_in(&mut alice.node, &mut bob.node);
        assert_eq!(alice.node.local_balance_msat(), 10_020_000);

        // Output of Bob's HTLC raises the fee Alice pays by 44 sat
        let expected = Err(Error::ChannelConstraintViolation(
            ConstraintViolation::BelowReserve {
                balance_msat: 9_976_000,
                reserve_sat: 10_000,
            },
        ));
        let before = bob.node.state().clone();
        assert_eq!(
            bob.node
                .add_htlc(preimage(2).payment_hash(), 5_000_000, 500)
                .map(|_| ()),
            expected
        );
        assert_eq!(*bob.node.state(), before);

        let add = UpdateAddHtlc {
            htlc_id: 0,
            amount_msat: 5_000_000,
            payment_hash: preimage(2).payment_hash(),
            cltv_expiry: 500,
        };
        let before = alice.node.state().clone();
        assert_eq!(alice.node.receive_htlc(&add).map(|_| ()), expected);
        assert_eq!(*alice.node.state(), before);
        assert_eq!(alice.node.stage(), Lifecycle::Active);
    }

    #[test]
    fn too_many_htlcs() {
        let (mut alice, _bob) = open_channel();
        for no in 0..30 {
            alice
                .node
                .add_htlc(preimage(no).payment_hash(), 1_000_000, 500)
                .unwrap();
        }
        assert_eq!(
            alice.node.add_htlc(preimage(30).payment_hash(), 1_000_000, 500),
            Err(Error::ChannelConstraintViolation(
                ConstraintViolation::TooManyHtlcs {
                    count: 31,
                    limit: 30
                }
            ))
        );
    }

    #[test]
    fn unexpected_htlc_index_is_fatal() {
        let (_alice, mut bob) = open_channel();
        let add = UpdateAddHtlc {
            htlc_id: 5,
            amount_msat: 1_000_000,
            payment_hash: preimage(1).payment_hash(),
            cltv_expiry: 500,
        };
        let err = bob.node.receive_htlc(&add).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(bob.node.stage(), Lifecycle::Closing(CloseType::ForceClose));
    }

    #[test]
    fn revocation_window() {
        let (mut alice, mut bob) = open_channel();
        let add = alice
            .node
            .add_htlc(preimage(1).payment_hash(), 5_000_000, 500)
            .unwrap();
        bob.node.receive_htlc(&add).unwrap();
        let msg = alice.node.sign_next_commitment().unwrap();
        assert_eq!(
            alice.node.sign_next_commitment(),
            Err(Error::RevocationWindowExhausted)
        );
        assert_eq!(alice.node.stage(), Lifecycle::Active);

        bob.node.receive_new_commitment(&msg).unwrap();
        assert_eq!(
            bob.node.receive_new_commitment(&msg),
            Err(Error::UnrevokedCommitment)
        );
        let revocation = bob.node.revoke_current_commitment().unwrap();
        assert_eq!(
            bob.node.revoke_current_commitment(),
            Err(Error::NothingToRevoke)
        );
        alice.node.receive_revocation(&revocation).unwrap();
        alice.node.sign_next_commitment().unwrap();
    }

    #[test]
    fn out_of_order_commitment() {
        let (mut alice, mut bob) = open_channel();
        let add = alice
            .node
            .add_htlc(preimage(1).payment_hash(), 5_000_000, 500)
            .unwrap();
        bob.node.receive_htlc(&add).unwrap();
        let mut msg = alice.node.sign_next_commitment().unwrap();
        msg.height += 1;
        let err = bob.node.receive_new_commitment(&msg).unwrap_err();
        assert_eq!(
            err,
            Error::OutOfOrderCommitment {
                expected: 1,
                received: 2
            }
        );
        assert!(err.is_fatal());
        assert_eq!(bob.node.stage(), Lifecycle::Closing(CloseType::ForceClose));
        assert_eq!(
            bob.persister.last_state().unwrap().unwrap().stage,
            Lifecycle::Closing(CloseType::ForceClose)
        );
    }

    #[test]
    fn invalid_signatures() {
        let (mut alice, mut bob) = open_channel();
        let add = alice
            .node
            .add_htlc(preimage(1).payment_hash(), 5_000_000, 500)
            .unwrap();
        bob.node.receive_htlc(&add).unwrap();
        let msg = alice.node.sign_next_commitment().unwrap();
        assert_eq!(msg.htlc_signatures.len(), 1);

        let mut bad_commit = msg.clone();
        bad_commit.signature = msg.htlc_signatures[0];
        let mut node = Node::restore(
            bob.node.state().clone(),
            bob.node.signer().clone(),
            MemoryPersister::new(),
        );
        assert_eq!(
            node.receive_new_commitment(&bad_commit),
            Err(Error::InvalidCommitSig)
        );
        assert_eq!(node.stage(), Lifecycle::Closing(CloseType::ForceClose));

        let mut bad_htlc = msg.clone();
        bad_htlc.htlc_signatures[0] = msg.signature;
        let mut node = Node::restore(
            bob.node.state().clone(),
            bob.node.signer().clone(),
            MemoryPersister::new(),
        );
        assert_eq!(
            node.receive_new_commitment(&bad_htlc),
            Err(Error::InvalidHtlcSig(0))
        );

        let mut missing = msg.clone();
        missing.htlc_signatures.clear();
        assert_eq!(
            bob.node.receive_new_commitment(&missing),
            Err(Error::HtlcSignatureCount {
                expected: 1,
                received: 0
            })
        );
    }

    #[test]
    fn invalid_revocation() {
        let (mut alice, mut bob) = open_channel();
        let add = alice
            .node
            .add_htlc(preimage(1).payment_hash(), 5_000_000, 500)
            .unwrap();
        bob.node.receive_htlc(&add).unwrap();
        let msg = alice.node.sign_next_commitment().unwrap();
        bob.node.receive_new_commitment(&msg).unwrap();
        let mut revocation = bob.node.revoke_current_commitment().unwrap();
        revocation.per_commitment_secret = [7u8; 32];
        let err = alice.node.receive_revocation(&revocation).unwrap_err();
        assert_eq!(err, Error::InvalidRevocation);
        assert!(err.is_fatal());
        assert_eq!(
            alice.node.stage(),
            Lifecycle::Closing(CloseType::ForceClose)
        );
    }

    #[test]
    fn persisted_before_revocation() {
        let (mut alice, mut bob) = open_channel();
        let add = alice
            .node
            .add_htlc(preimage(1).payment_hash(), 5_000_000, 500)
            .unwrap();
        bob.node.receive_htlc(&add).unwrap();
        let msg = alice.node.sign_next_commitment().unwrap();
        bob.node.receive_new_commitment(&msg).unwrap();

        bob.persister.set_failing(true);
        let err = bob.node.revoke_current_commitment().unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert!(err.is_transient());
        assert!(bob.node.state().pending_local_commitment.is_some());
        assert_eq!(bob.node.state().local_commitment.height, 0);

        bob.persister.set_failing(false);
        let revocation = bob.node.revoke_current_commitment().unwrap();
        let persisted = bob.persister.last_state().unwrap().unwrap();
        assert_eq!(persisted.local_commitment.height, 1);
        assert!(persisted.pending_local_commitment.is_none());
        alice.node.receive_revocation(&revocation).unwrap();
    }

    #[test]
    fn close_persisted_before_transition() {
        let (mut alice, mut bob) = open_channel();
        let writes = alice.persister.writes().unwrap();

        alice.persister.set_failing(true);
        let err = alice.node.force_close().unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert!(err.is_transient());
        assert_eq!(alice.node.stage(), Lifecycle::Active);
        assert!(matches!(
            alice.node.mark_cooperative_close(),
            Err(Error::Persistence(_))
        ));
        assert_eq!(alice.node.stage(), Lifecycle::Active);

        let remote_tx = alice.node.state().remote_commitment.tx.clone();
        let event = ChainEvent::CommitmentConfirmed {
            txid: remote_tx.txid(),
            tx: remote_tx,
        };
        assert!(matches!(
            alice.node.handle_chain_event(event.clone()),
            Err(Error::Persistence(_))
        ));
        assert_eq!(alice.node.stage(), Lifecycle::Active);
        assert_eq!(alice.persister.writes().unwrap(), writes);

        alice.persister.set_failing(false);
        alice.node.handle_chain_event(event).unwrap();
        assert_eq!(
            alice.node.stage(),
            Lifecycle::Closing(CloseType::ForceClose)
        );

        bob.node.mark_cooperative_close().unwrap();
        bob.persister.set_failing(true);
        assert!(matches!(
            bob.node.mark_closed(),
            Err(Error::Persistence(_))
        ));
        assert_eq!(
            bob.node.stage(),
            Lifecycle::Closing(CloseType::Cooperative)
        );
        assert_eq!(
            bob.persister.last_state().unwrap().unwrap(),
            *bob.node.state()
        );
    }

    #[test]
    fn signer_timeout() {
        let (mut alice, mut bob) = open_channel();
        let add = alice
            .node
            .add_htlc(preimage(1).payment_hash(), 5_000_000, 500)
            .unwrap();
        bob.node.receive_htlc(&add).unwrap();

        alice.offline.store(true, Ordering::SeqCst);
        let err = alice.node.sign_next_commitment().unwrap_err();
        assert_eq!(err, Error::Signer(SignerError::HardwareTimeout(100)));
        assert!(err.is_transient());
        assert!(!err.is_fatal());
        assert!(alice.node.state().pending_remote_commitment.is_none());
        assert_eq!(
            alice
                .node
                .state()
                .local_update_log
                .lookup_htlc(0)
                .unwrap()
                .add_commit_height_remote,
            0
        );

        alice.offline.store(false, Ordering::SeqCst);
        lock_in(&mut alice.node, &mut bob.node);
    }

    #[test]
    fn revert_updates() {
        let (mut alice, mut bob) = open_channel();
        let add = alice
            .node
            .add_htlc(preimage(1).payment_hash(), 5_000_000, 500)
            .unwrap();
        bob.node.receive_htlc(&add).unwrap();
        lock_in(&mut alice.node, &mut bob.node);

        alice
            .node
            .add_htlc(preimage(2).payment_hash(), 6_000_000, 500)
            .unwrap();
        let settle = bob.node.settle_htlc(preimage(1), 0).unwrap();

        alice.node.revert_uncommitted_updates();
        bob.node.revert_uncommitted_updates();
        assert_eq!(alice.node.state().local_update_log.htlc_counter(), 1);
        assert_eq!(alice.node.state().local_update_log.len(), 1);
        assert_eq!(bob.node.state().local_update_log.len(), 0);
        assert!(!bob.node.state().remote_update_log.is_modified(0));

        // Both updates can be proposed again
        let add = alice
            .node
            .add_htlc(preimage(2).payment_hash(), 6_000_000, 500)
            .unwrap();
        assert_eq!(add.htlc_id, 1);
        assert_eq!(bob.node.settle_htlc(preimage(1), 0).unwrap(), settle);
    }

    #[test]
    fn local_force_close() {
        let (mut alice, mut bob) = open_channel();
        let add = alice
            .node
            .add_htlc(preimage(1).payment_hash(), 50_000_000, 500)
            .unwrap();
        bob.node.receive_htlc(&add).unwrap();
        let add = bob
            .node
            .add_htlc(preimage(2).payment_hash(), 30_000_000, 600)
            .unwrap();
        alice.node.receive_htlc(&add).unwrap();
        lock_in(&mut alice.node, &mut bob.node);
        // Bob's HTLC gets into Bob's commitment as well
        exchange_commitment(&mut alice.node, &mut bob.node);
        // Alice learns the preimage of the incoming HTLC
        alice.node.settle_htlc(preimage(2), 0).unwrap();

        let summary = alice.node.force_close().unwrap();
        assert_eq!(
            alice.node.stage(),
            Lifecycle::Closing(CloseType::ForceClose)
        );
        let chain = ChainParams::bitgold_regtest();
        let funding_output = TxOut::ln_funding(
            CAPACITY,
            alice.node.state().local_config.multisig_key,
            alice.node.state().remote_config.multisig_key,
        );
        let close_tx = &summary.close_tx;
        Interpreter::verify_input(close_tx, 0, &funding_output, chain.sighash)
            .unwrap();
        assert_eq!(close_tx.output.len(), 4);

        let to_local = summary.to_local.as_ref().unwrap();
        assert_eq!(to_local.csv_delay, 144);
        assert_eq!(
            close_tx.output[to_local.outpoint.vout as usize],
            to_local.sign_desc.output
        );

        let resolutions = &summary.htlc_resolutions;
        assert_eq!(resolutions.outgoing.len(), 1);
        assert_eq!(resolutions.incoming.len(), 1);
        assert_eq!(resolutions.incoming[0].preimage, Some(preimage(2)));
        assert_eq!(resolutions.signed_txs().count(), 2);
        for tx in resolutions.signed_txs() {
            let prevout = &close_tx.output[tx.input[0].previous_output.vout as usize];
            Interpreter::verify_input(tx, 0, prevout, chain.sighash).unwrap();
        }

        assert_eq!(
            alice.node.handle_chain_event(ChainEvent::CommitmentConfirmed {
                txid: close_tx.txid(),
                tx: close_tx.clone(),
            }),
            Ok(ChainAction::LocalForceClose(summary.clone()))
        );
        alice.node.mark_closed().unwrap();
        assert!(alice.node.force_close().is_err());
    }

    #[test]
    fn remote_force_close() {
        let (mut alice, mut bob) = open_channel();
        let remote_tx = bob.node.state().remote_commitment.tx.clone();
        let action = bob
            .node
            .handle_chain_event(ChainEvent::CommitmentConfirmed {
                txid: remote_tx.txid(),
                tx: remote_tx.clone(),
            })
            .unwrap();
        let summary = match action {
            ChainAction::RemoteForceClose(summary) => summary,
            other => panic!("unexpected chain action {:?}", other),
        };
        assert_eq!(bob.node.stage(), Lifecycle::Closing(CloseType::ForceClose));
        assert!(summary.htlc_resolutions.is_empty());

        // Bob sweeps his balance from Alice's commitment right away
        let to_remote = summary.to_remote.unwrap();
        assert_eq!(to_remote.sign_desc.output.value, BOB_BALANCE_MSAT / 1000);
        let mut sweep = Transaction {
            version: 2,
            lock_time: PackedLockTime::ZERO,
            input: vec![TxIn {
                previous_output: to_remote.outpoint,
                script_sig: none!(),
                sequence: Sequence::ZERO,
                witness: empty!(),
            }],
            output: vec![TxOut {
                value: to_remote.sign_desc.output.value - 500,
                script_pubkey: bob.node.state().sweep_script.clone(),
            }],
        };
        let desc = &to_remote.sign_desc;
        let sig = bob.node.signer().sign_output_raw(&sweep, desc).unwrap();
        sweep.input[0].witness =
            to_remote_witness(&sig, &desc.signing_pubkey(), desc.sighash);
        Interpreter::verify_input(&sweep, 0, &desc.output, desc.sighash)
            .unwrap();

        // Alice's own state is not affected
        assert_eq!(alice.node.stage(), Lifecycle::Active);
        alice.node.mark_cooperative_close().unwrap();
    }

    #[test]
    fn breach_remedy() {
        let (mut alice, mut bob) = open_channel();
        let revoked_tx = alice.node.state().local_commitment.tx.clone();
        let add = alice
            .node
            .add_htlc(preimage(1).payment_hash(), 50_000_000, 500)
            .unwrap();
        bob.node.receive_htlc(&add).unwrap();
        lock_in(&mut alice.node, &mut bob.node);

        let action = bob
            .node
            .handle_chain_event(ChainEvent::CommitmentConfirmed {
                txid: revoked_tx.txid(),
                tx: revoked_tx.clone(),
            })
            .unwrap();
        assert_eq!(
            bob.node.stage(),
            Lifecycle::Closing(CloseType::BreachRemedy)
        );
        let justice_tx = match &action {
            ChainAction::Breach(remedy) => {
                assert_eq!(remedy.revoked_height, 0);
                remedy.justice_tx.clone().unwrap()
            }
            other => panic!("unexpected chain action {:?}", other),
        };
        assert_eq!(action.broadcastable(), vec![&justice_tx]);

        let prevout =
            &revoked_tx.output[justice_tx.input[0].previous_output.vout as usize];
        let to_local_sat =
            (CAPACITY * 1000 - BOB_BALANCE_MSAT - initial_fee_msat()) / 1000;
        assert_eq!(prevout.value, to_local_sat);
        let fee = fee_for_weight(
            FEE_PER_KW,
            justice_tx_weight(&bob.node.state().sweep_script),
        );
        assert_eq!(justice_tx.output[0].value, to_local_sat - fee);
        Interpreter::verify_input(
            &justice_tx,
            0,
            prevout,
            ChainParams::bitgold_regtest().sighash,
        )
        .unwrap();

        bob.node.mark_closed().unwrap();
        assert_eq!(bob.persister.last_state().unwrap().unwrap().stage, Lifecycle::Closed);
    }

    #[test]
    fn unknown_spend() {
        let (_alice, mut bob) = open_channel();
        // Spends with the state hint of a non-revoked commitment are not
        // breaches
        let mut tx = bob.node.state().local_commitment.tx.clone();
        tx.output.pop();
        let txid = tx.txid();
        let event = ChainEvent::CommitmentConfirmed { txid, tx };
        assert_eq!(
            bob.node.handle_chain_event(event.clone()),
            Err(Error::UnknownCommitment(txid))
        );
        assert_eq!(bob.node.stage(), Lifecycle::Active);

        bob.node.mark_cooperative_close().unwrap();
        assert_eq!(
            bob.node.handle_chain_event(event),
            Ok(ChainAction::CooperativeClose(txid))
        );
        assert_eq!(bob.node.stage(), Lifecycle::Closed);
    }

    #[test]
    #[cfg(feature = "serde")]
    fn state_serde() {
        let (mut alice, mut bob) = open_channel();
        let add = alice
            .node
            .add_htlc(sha256::Hash::hash(&[1u8; 32]), 5_000_000, 500)
            .unwrap();
        bob.node.receive_htlc(&add).unwrap();
        lock_in(&mut alice.node, &mut bob.node);

        let state = bob.node.state();
        let json = serde_json::to_string(state).unwrap();
        let restored: ChannelState = serde_json::from_str(&json).unwrap();
        assert_eq!(&restored, state);
        assert_eq!(bob.persister.last_state().unwrap().as_ref(), Some(state));
        assert!(bob.persister.writes().unwrap() > 4);

        let secrets = &bob.secrets;
        let node = Node::restore(
            restored,
            TestSigner {
                inner: MemorySigner::with(secrets.all()),
                offline: bob.offline.clone(),
            },
            MemoryPersister::new(),
        );
        assert_eq!(node.local_balance_msat(), bob.node.local_balance_msat());
    }
}
