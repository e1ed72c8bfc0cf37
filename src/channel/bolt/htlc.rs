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

//! HTLC update logs and the views of them committed to by each of the
//! commitment chains.

use std::collections::{BTreeMap, BTreeSet};

use bitcoin::hashes::{sha256, Hash};

/// HTLC payment preimage
#[derive(
    Wrapper, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, From
)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct HashPreimage(#[from] [u8; 32]);

impl HashPreimage {
    /// Payment hash the preimage unlocks
    #[inline]
    pub fn payment_hash(&self) -> sha256::Hash {
        sha256::Hash::hash(&self.0)
    }
}

/// Type of the update log entry
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub enum UpdateType {
    #[display("add")]
    Add,

    #[display("settle")]
    Settle,

    #[display("fail")]
    Fail,
}

/// Lifecycle of an HTLC, as seen from its `Add` entry and the entry
/// removing it
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
pub enum HtlcState {
    /// not yet committed to both commitment chains
    #[display("added")]
    Added,

    /// locked in both commitment chains
    #[display("committed")]
    Committed,

    /// settlement is pending on at least one of the commitment chains
    #[display("settled")]
    Settled,

    /// failure is pending on at least one of the commitment chains
    #[display("failed")]
    Failed,

    /// removed from both commitment chains
    #[display("removed")]
    Removed,
}

/// Entry of an update log
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct PaymentDescriptor {
    pub entry_type: UpdateType,

    /// Position of the entry in its update log
    pub log_index: u64,

    /// HTLC id; meaningful for `Add` entries only
    pub htlc_index: u64,

    /// Id of the HTLC a `Settle` or `Fail` entry removes; the HTLC resides in
    /// the log of the counterparty
    pub parent_index: u64,

    pub payment_hash: sha256::Hash,

    /// Amount in millisatoshis
    pub amount_msat: u64,

    /// Absolute block height the HTLC times out at
    pub cltv_expiry: u32,

    /// Preimage settling the HTLC; present in `Settle` entries
    pub preimage: Option<HashPreimage>,

    /// Output index of the HTLC in the local commitment transaction
    pub local_output_index: Option<u32>,

    /// Output index of the HTLC in the remote commitment transaction
    pub remote_output_index: Option<u32>,

    /// Height of the local commitment which first included the entry
    pub add_commit_height_local: u64,

    /// Height of the remote commitment which first included the entry
    pub add_commit_height_remote: u64,

    /// Height of the local commitment which first excluded the HTLC
    pub remove_commit_height_local: u64,

    /// Height of the remote commitment which first excluded the HTLC
    pub remove_commit_height_remote: u64,
}

impl PaymentDescriptor {
    /// Constructs new `Add` entry; indexes are assigned by the update log
    pub fn with_add(
        payment_hash: sha256::Hash,
        amount_msat: u64,
        cltv_expiry: u32,
    ) -> PaymentDescriptor {
        PaymentDescriptor {
            entry_type: UpdateType::Add,
            log_index: 0,
            htlc_index: 0,
            parent_index: 0,
            payment_hash,
            amount_msat,
            cltv_expiry,
            preimage: None,
            local_output_index: None,
            remote_output_index: None,
            add_commit_height_local: 0,
            add_commit_height_remote: 0,
            remove_commit_height_local: 0,
            remove_commit_height_remote: 0,
        }
    }

    /// Constructs entry removing `parent` HTLC
    pub fn with_removal(
        parent: &PaymentDescriptor,
        preimage: Option<HashPreimage>,
    ) -> PaymentDescriptor {
        let entry_type = if preimage.is_some() {
            UpdateType::Settle
        } else {
            UpdateType::Fail
        };
        PaymentDescriptor {
            entry_type,
            parent_index: parent.htlc_index,
            preimage,
            ..PaymentDescriptor::with_add(
                parent.payment_hash,
                parent.amount_msat,
                parent.cltv_expiry,
            )
        }
    }

    /// Whether the entry was committed to by both commitment chains
    #[inline]
    pub fn is_locked_in(&self) -> bool {
        self.add_commit_height_local != 0 && self.add_commit_height_remote != 0
    }

    #[inline]
    pub fn is_removal_locked_in(&self) -> bool {
        self.remove_commit_height_local != 0
            && self.remove_commit_height_remote != 0
    }

    #[inline]
    fn add_height_mut(&mut self, remote_chain: bool) -> &mut u64 {
        if remote_chain {
            &mut self.add_commit_height_remote
        } else {
            &mut self.add_commit_height_local
        }
    }

    #[inline]
    fn remove_height_mut(&mut self, remote_chain: bool) -> &mut u64 {
        if remote_chain {
            &mut self.remove_commit_height_remote
        } else {
            &mut self.remove_commit_height_local
        }
    }

    #[inline]
    pub fn add_height(&self, remote_chain: bool) -> u64 {
        if remote_chain {
            self.add_commit_height_remote
        } else {
            self.add_commit_height_local
        }
    }
}

/// Errors evaluating HTLC views
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum HtlcError {
    /// HTLC with id {0} is not known
    UnknownHtlc(u64),

    /// HTLC with id {htlc_index} removed by update #{log_index} was not yet
    /// committed to the commitment chain
    UncommittedParent { log_index: u64, htlc_index: u64 },

    /// HTLC update #{0} leads to a negative channel balance
    NegativeBalance(u64),
}

/// Append-only log of the updates proposed by one of the channel parties
#[derive(Getters, Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct UpdateLog {
    /// Index of the next entry
    #[getter(as_copy)]
    log_index: u64,

    /// Id of the next HTLC
    #[getter(as_copy)]
    htlc_counter: u64,

    #[getter(skip)]
    entries: BTreeMap<u64, PaymentDescriptor>,

    #[getter(skip)]
    htlc_log_index: BTreeMap<u64, u64>,

    /// HTLCs which already have a pending removal in the counterparty log
    #[getter(skip)]
    modified_htlcs: BTreeSet<u64>,
}

impl UpdateLog {
    #[inline]
    pub fn new() -> UpdateLog {
        UpdateLog::default()
    }

    /// Appends `Settle` or `Fail` entry
    pub fn append_update(&mut self, mut entry: PaymentDescriptor) -> u64 {
        entry.log_index = self.log_index;
        self.entries.insert(self.log_index, entry);
        self.log_index += 1;
        self.log_index - 1
    }

    /// Appends `Add` entry, assigning it the next HTLC id
    pub fn append_htlc(&mut self, mut entry: PaymentDescriptor) -> u64 {
        let htlc_index = self.htlc_counter;
        entry.htlc_index = htlc_index;
        self.htlc_log_index.insert(htlc_index, self.log_index);
        self.htlc_counter += 1;
        self.append_update(entry);
        htlc_index
    }

    #[inline]
    pub fn lookup_htlc(&self, htlc_index: u64) -> Option<&PaymentDescriptor> {
        self.htlc_log_index
            .get(&htlc_index)
            .and_then(|log_index| self.entries.get(log_index))
    }

    #[inline]
    pub fn lookup_htlc_mut(
        &mut self,
        htlc_index: u64,
    ) -> Option<&mut PaymentDescriptor> {
        match self.htlc_log_index.get(&htlc_index) {
            Some(log_index) => self.entries.get_mut(log_index),
            None => None,
        }
    }

    #[inline]
    pub fn lookup_update(&self, log_index: u64) -> Option<&PaymentDescriptor> {
        self.entries.get(&log_index)
    }

    pub fn remove_update(&mut self, log_index: u64) {
        self.entries.remove(&log_index);
    }

    pub fn remove_htlc(&mut self, htlc_index: u64) {
        if let Some(log_index) = self.htlc_log_index.remove(&htlc_index) {
            self.entries.remove(&log_index);
        }
        self.modified_htlcs.remove(&htlc_index);
    }

    #[inline]
    pub fn mark_modified(&mut self, htlc_index: u64) {
        self.modified_htlcs.insert(htlc_index);
    }

    /// Releases HTLC whose pending removal was dropped
    #[inline]
    pub fn unmark_modified(&mut self, htlc_index: u64) {
        self.modified_htlcs.remove(&htlc_index);
    }

    #[inline]
    pub fn is_modified(&self, htlc_index: u64) -> bool {
        self.modified_htlcs.contains(&htlc_index)
    }

    /// Entries in log order
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &PaymentDescriptor> {
        self.entries.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all entries with log index starting from `log_index` and
    /// restores the counters
    pub fn truncate(&mut self, log_index: u64, htlc_counter: u64) {
        let dropped = self.entries.split_off(&log_index);
        for entry in dropped.values() {
            if entry.entry_type == UpdateType::Add {
                self.htlc_log_index.remove(&entry.htlc_index);
            }
        }
        self.log_index = log_index;
        self.htlc_counter = htlc_counter;
    }

    /// HTLCs from this log which are not removed from the given chain
    pub fn active_htlcs(
        &self,
        remote_chain: bool,
    ) -> impl Iterator<Item = &PaymentDescriptor> {
        self.entries.values().filter(move |entry| {
            entry.entry_type == UpdateType::Add
                && entry.add_height(remote_chain) != 0
        })
    }
}

/// Determines state of the HTLC with the given id, owned by `htlc_log`
pub fn htlc_state(
    htlc_log: &UpdateLog,
    counterparty_log: &UpdateLog,
    htlc_index: u64,
) -> Result<HtlcState, HtlcError> {
    let htlc = htlc_log
        .lookup_htlc(htlc_index)
        .ok_or(HtlcError::UnknownHtlc(htlc_index))?;
    let removal = counterparty_log.iter().find(|entry| {
        entry.entry_type != UpdateType::Add && entry.parent_index == htlc_index
    });
    Ok(match removal {
        None if htlc.is_locked_in() => HtlcState::Committed,
        None => HtlcState::Added,
        Some(entry) if entry.is_removal_locked_in() => HtlcState::Removed,
        Some(entry) if entry.entry_type == UpdateType::Settle => {
            HtlcState::Settled
        }
        Some(_) => HtlcState::Failed,
    })
}

/// Snapshot of HTLCs committed to by one of the commitment transactions
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct HtlcView {
    /// HTLCs offered by the local node
    pub our_updates: Vec<PaymentDescriptor>,

    /// HTLCs offered by the remote node
    pub their_updates: Vec<PaymentDescriptor>,
}

impl HtlcView {
    /// Constructs view from the list of HTLC entries; incoming HTLCs are
    /// treated as offered by the remote node
    pub fn with(
        htlcs: impl IntoIterator<Item = (bool, PaymentDescriptor)>,
    ) -> HtlcView {
        let mut view = HtlcView::default();
        for (incoming, htlc) in htlcs {
            if incoming {
                view.their_updates.push(htlc);
            } else {
                view.our_updates.push(htlc);
            }
        }
        view
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.our_updates.len() + self.their_updates.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total value of HTLCs in the view, in millisatoshis
    pub fn total_msat(&self) -> u64 {
        self.our_updates
            .iter()
            .chain(&self.their_updates)
            .map(|htlc| htlc.amount_msat)
            .sum()
    }
}

fn process_add(
    htlc: &mut PaymentDescriptor,
    our_balance: &mut u64,
    their_balance: &mut u64,
    next_height: u64,
    remote_chain: bool,
    incoming: bool,
    mutate_state: bool,
) -> Result<(), HtlcError> {
    if htlc.add_height(remote_chain) != 0 {
        return Ok(());
    }
    let balance = if incoming { their_balance } else { our_balance };
    *balance = balance
        .checked_sub(htlc.amount_msat)
        .ok_or(HtlcError::NegativeBalance(htlc.log_index))?;
    if mutate_state {
        *htlc.add_height_mut(remote_chain) = next_height;
    }
    Ok(())
}

fn process_remove(
    htlc: &mut PaymentDescriptor,
    our_balance: &mut u64,
    their_balance: &mut u64,
    next_height: u64,
    remote_chain: bool,
    incoming: bool,
    mutate_state: bool,
) {
    if *htlc.remove_height_mut(remote_chain) != 0 {
        return;
    }
    // Settled funds go to the HTLC receiver, failed return to the sender
    match (incoming, htlc.entry_type) {
        (true, UpdateType::Settle) | (false, UpdateType::Fail) => {
            *our_balance += htlc.amount_msat
        }
        (true, UpdateType::Fail) | (false, UpdateType::Settle) => {
            *their_balance += htlc.amount_msat
        }
        (_, UpdateType::Add) => {}
    }
    if mutate_state {
        *htlc.remove_height_mut(remote_chain) = next_height;
    }
}

fn removals_below(log: &UpdateLog, log_index: u64) -> Vec<u64> {
    log.entries
        .range(..log_index)
        .filter(|(_, entry)| entry.entry_type != UpdateType::Add)
        .map(|(index, _)| *index)
        .collect()
}

fn adds_below(log: &UpdateLog, log_index: u64) -> Vec<u64> {
    log.entries
        .range(..log_index)
        .filter(|(_, entry)| entry.entry_type == UpdateType::Add)
        .map(|(index, _)| *index)
        .collect()
}

/// Applies HTLC updates from both logs up to the given log indexes to the
/// balances of a commitment chain, returning HTLCs which remain active.
///
/// Only entries not yet applied to the chain change the balances. With
/// `mutate_state` the entries are marked as applied at `next_height`.
#[allow(clippy::too_many_arguments)]
pub fn evaluate_htlc_view(
    local_log: &mut UpdateLog,
    remote_log: &mut UpdateLog,
    our_log_index: u64,
    their_log_index: u64,
    our_balance: &mut u64,
    their_balance: &mut u64,
    next_height: u64,
    remote_chain: bool,
    mutate_state: bool,
) -> Result<HtlcView, HtlcError> {
    let mut skip_us = BTreeSet::new();
    let mut skip_them = BTreeSet::new();

    // Our settles and fails remove HTLCs offered by the remote node
    for log_index in removals_below(local_log, our_log_index) {
        let entry = local_log
            .entries
            .get_mut(&log_index)
            .ok_or(HtlcError::UnknownHtlc(log_index))?;
        let parent = remote_log
            .lookup_htlc(entry.parent_index)
            .ok_or(HtlcError::UnknownHtlc(entry.parent_index))?;
        if parent.add_height(remote_chain) == 0 {
            return Err(HtlcError::UncommittedParent {
                log_index,
                htlc_index: entry.parent_index,
            });
        }
        skip_them.insert(entry.parent_index);
        process_remove(
            entry,
            our_balance,
            their_balance,
            next_height,
            remote_chain,
            true,
            mutate_state,
        );
    }

    for log_index in removals_below(remote_log, their_log_index) {
        let entry = remote_log
            .entries
            .get_mut(&log_index)
            .ok_or(HtlcError::UnknownHtlc(log_index))?;
        let parent = local_log
            .lookup_htlc(entry.parent_index)
            .ok_or(HtlcError::UnknownHtlc(entry.parent_index))?;
        if parent.add_height(remote_chain) == 0 {
            return Err(HtlcError::UncommittedParent {
                log_index,
                htlc_index: entry.parent_index,
            });
        }
        skip_us.insert(entry.parent_index);
        process_remove(
            entry,
            our_balance,
            their_balance,
            next_height,
            remote_chain,
            false,
            mutate_state,
        );
    }

    let mut view = HtlcView::default();
    for log_index in adds_below(local_log, our_log_index) {
        if let Some(entry) = local_log.entries.get_mut(&log_index) {
            if skip_us.contains(&entry.htlc_index) {
                continue;
            }
            process_add(
                entry,
                our_balance,
                their_balance,
                next_height,
                remote_chain,
                false,
                mutate_state,
            )?;
            view.our_updates.push(entry.clone());
        }
    }
    for log_index in adds_below(remote_log, their_log_index) {
        if let Some(entry) = remote_log.entries.get_mut(&log_index) {
            if skip_them.contains(&entry.htlc_index) {
                continue;
            }
            process_add(
                entry,
                our_balance,
                their_balance,
                next_height,
                remote_chain,
                true,
                mutate_state,
            )?;
            view.their_updates.push(entry.clone());
        }
    }

    Ok(view)
}

/// Evicts fully removed HTLCs together with the entries removing them, once
/// the removal is committed to by both chain tails.
pub fn compact_logs(
    local_log: &mut UpdateLog,
    remote_log: &mut UpdateLog,
    local_chain_tail: u64,
    remote_chain_tail: u64,
) {
    fn compact(
        log_a: &mut UpdateLog,
        log_b: &mut UpdateLog,
        local_chain_tail: u64,
        remote_chain_tail: u64,
    ) {
        let evicted = log_a
            .entries
            .values()
            .filter(|entry| entry.entry_type != UpdateType::Add)
            .filter(|entry| entry.is_removal_locked_in())
            .filter(|entry| {
                remote_chain_tail >= entry.remove_commit_height_remote
                    && local_chain_tail >= entry.remove_commit_height_local
            })
            .map(|entry| (entry.log_index, entry.parent_index))
            .collect::<Vec<_>>();
        for (log_index, parent_index) in evicted {
            trace!(
                "Compacting update #{} removing HTLC #{}",
                log_index,
                parent_index
            );
            log_a.remove_update(log_index);
            log_b.remove_htlc(parent_index);
        }
    }

    compact(local_log, remote_log, local_chain_tail, remote_chain_tail);
    compact(remote_log, local_log, local_chain_tail, remote_chain_tail);
}
