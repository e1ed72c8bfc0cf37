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

//! Obscured commitment number stored in the commitment transaction locktime
//! and input sequence (BOLT-3 "commitment transaction" section).

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::{PackedLockTime, Sequence, Transaction};
use secp256k1::PublicKey;

/// Maximal commitment number which can be encoded
pub const STATE_HINT_MAX: u64 = (1 << 48) - 1;

const LOWER_24_BITS: u64 = 0x00_FF_FF_FF;

/// Upper byte of the commitment transaction locktime; keeps the locktime a
/// timestamp in the past
const LOCKTIME_UPPER_BYTE: u32 = 0x20 << 24;

/// Upper byte of the commitment transaction input sequence; disables
/// relative timelock interpretation
const SEQUENCE_UPPER_BYTE: u32 = 0x80 << 24;

/// Errors encoding commitment number into a transaction
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum StateHintError {
    /// commitment number {0} exceeds 48-bit range
    InvalidState(u64),

    /// commitment transaction must have exactly one input, while it has {0}
    InvalidInputCount(usize),
}

/// Computes the commitment number obscuring factor: lower 48 bits of
/// `SHA256(initiator_payment_basepoint || responder_payment_basepoint)`
pub fn obfuscator(
    initiator_payment_basepoint: PublicKey,
    responder_payment_basepoint: PublicKey,
) -> u64 {
    let mut engine = sha256::Hash::engine();
    engine.input(&initiator_payment_basepoint.serialize());
    engine.input(&responder_payment_basepoint.serialize());
    let obscuring_hash = sha256::Hash::from_engine(engine);

    let mut buf = [0u8; 8];
    buf.copy_from_slice(&obscuring_hash[24..]);
    u64::from_be_bytes(buf) & STATE_HINT_MAX
}

/// Embeds obscured commitment number into the transaction locktime (lower 24
/// bits) and the sequence of its single input (upper 24 bits).
pub fn set_state_hint(
    tx: &mut Transaction,
    state_num: u64,
    obfuscator: u64,
) -> Result<(), StateHintError> {
    if state_num > STATE_HINT_MAX {
        return Err(StateHintError::InvalidState(state_num));
    }
    if tx.input.len() != 1 {
        return Err(StateHintError::InvalidInputCount(tx.input.len()));
    }

    let obscured = state_num ^ (obfuscator & STATE_HINT_MAX);
    tx.lock_time =
        PackedLockTime(LOCKTIME_UPPER_BYTE | (obscured & LOWER_24_BITS) as u32);
    tx.input[0].sequence =
        Sequence(SEQUENCE_UPPER_BYTE | (obscured >> 24) as u32);
    Ok(())
}

/// Extracts the commitment number from a transaction produced with
/// [`set_state_hint`]
pub fn get_state_hint(
    tx: &Transaction,
    obfuscator: u64,
) -> Result<u64, StateHintError> {
    if tx.input.len() != 1 {
        return Err(StateHintError::InvalidInputCount(tx.input.len()));
    }
    let lower = tx.lock_time.0 as u64 & LOWER_24_BITS;
    let upper = tx.input[0].sequence.0 as u64 & LOWER_24_BITS;
    Ok(((upper << 24) | lower) ^ (obfuscator & STATE_HINT_MAX))
}
