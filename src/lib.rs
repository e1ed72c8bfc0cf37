// LNP/BP Core Library implementing LNPBP specifications & standards
// Written in 2019-2022 by
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

//! Lightning channel commitment engine.
//!
//! The library builds, signs, verifies and revokes BOLT-3 commitment
//! transactions, HTLC second-level transactions and justice transactions for
//! a single bidirectional payment channel on a Bitcoin-derived chain.

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate log;
#[cfg(feature = "serde")]
#[macro_use]
extern crate serde_crate as serde;

macro_rules! dumb_pubkey {
    () => {
        secp256k1::PublicKey::from_secret_key(
            secp256k1::SECP256K1,
            &secp256k1::ONE_KEY,
        )
    };
}

pub mod chain;
pub mod channel;

pub use chain::{ChainParams, SighashMode};
pub use channel::bolt::{
    ChannelConfig, ChannelState, ChannelType, Commitment, CommitmentKeyRing,
    Error, LightningChannel, Lifecycle,
};
pub use channel::{Funding, PsbtLnpFunding};
