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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::state::ChannelState;

/// Errors of the channel state storage
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum PersistError {
    /// channel state storage is unavailable: {0}
    Unavailable(String),

    /// channel state storage lock is poisoned
    Poisoned,
}

/// Durable storage of the channel state. The channel state machine calls it
/// before it reveals anything to the remote peer which can't be taken back.
pub trait ChannelPersister {
    fn persist(&self, state: &ChannelState) -> Result<(), PersistError>;
}

impl<P> ChannelPersister for Arc<P>
where
    P: ChannelPersister + ?Sized,
{
    #[inline]
    fn persist(&self, state: &ChannelState) -> Result<(), PersistError> {
        self.as_ref().persist(state)
    }
}

/// Persister keeping the latest channel state in memory. Clones share the
/// same storage.
#[derive(Clone, Debug, Default)]
pub struct MemoryPersister {
    last: Arc<Mutex<Option<ChannelState>>>,
    writes: Arc<Mutex<usize>>,
    failing: Arc<AtomicBool>,
}

impl MemoryPersister {
    #[inline]
    pub fn new() -> MemoryPersister {
        MemoryPersister::default()
    }

    /// Makes all subsequent writes fail (or succeed again)
    #[inline]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Last successfully persisted state
    pub fn last_state(&self) -> Result<Option<ChannelState>, PersistError> {
        Ok(self.last.lock().map_err(|_| PersistError::Poisoned)?.clone())
    }

    /// Number of successful writes
    pub fn writes(&self) -> Result<usize, PersistError> {
        Ok(*self.writes.lock().map_err(|_| PersistError::Poisoned)?)
    }
}

impl ChannelPersister for MemoryPersister {
    fn persist(&self, state: &ChannelState) -> Result<(), PersistError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistError::Unavailable(s!("write failure")));
        }
        *self.last.lock().map_err(|_| PersistError::Poisoned)? =
            Some(state.clone());
        *self.writes.lock().map_err(|_| PersistError::Poisoned)? += 1;
        trace!(
            "Persisted channel state at local height {} and remote height {}",
            state.local_commitment.height,
            state.remote_commitment.height
        );
        Ok(())
    }
}
