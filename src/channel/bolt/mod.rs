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

//! BOLT-3 channel: commitment transactions, HTLC updates, revocation and
//! on-chain resolution of the channel outputs.

pub mod backend;
pub mod commitment;
pub mod derivation;
pub mod htlc;
pub mod interpreter;
pub mod keyset;
pub mod msgs;
pub mod persist;
pub mod policy;
pub mod resolution;
pub mod scripts;
pub mod shachain;
pub mod sign;
pub mod state;
pub mod state_hint;

mod channel;

pub use backend::{BackendError, ChainBackend, ChainEvent};
pub use channel::{
    BreachRemedy, ChainAction, ChannelSetup, ConstraintViolation, Error,
    ForceCloseSummary, LightningChannel, RemoteCloseSummary, SweepableOutput,
};
pub use commitment::{Commitment, CommitmentError, CommittedHtlc};
pub use htlc::{HashPreimage, HtlcError, PaymentDescriptor, UpdateLog};
pub use keyset::{
    ChannelConfig, ChannelType, CommitmentKeyRing, SerializedKeyRing,
};
pub use msgs::{
    CommitmentSigned, RevokeAndAck, UpdateAddHtlc, UpdateFailHtlc,
    UpdateFulfillHtlc,
};
pub use persist::{ChannelPersister, MemoryPersister, PersistError};
pub use policy::{Policy, PolicyError};
pub use resolution::{HtlcResolutions, ResolutionError};
pub use scripts::{
    funding_script_from_slices, to_local_script_from_slices, ScriptError,
    ScriptGenerators,
};
pub use shachain::{ShaChainError, ShaChainProducer, ShaChainStore};
pub use sign::{MemorySigner, SignDescriptor, Signer, SignerError};
pub use state::{ChannelState, CloseType, Lifecycle};
