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

//! Per-commitment secret generation and compact storage following BOLT-3
//! "efficient per-commitment secret storage".
//!
//! Secrets are addressed by *index*, which runs downwards from `2^48 - 1`;
//! the secret for commitment height `n` has index `2^48 - 1 - n`.

use bitcoin::hashes::{sha256, Hash};

use super::state_hint::STATE_HINT_MAX;

/// Number of index bits
const INDEX_BITS: u8 = 48;

/// Index of the first secret
pub const START_INDEX: u64 = STATE_HINT_MAX;

#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum ShaChainError {
    /// commitment height {0} exceeds 48-bit range
    HeightOverflow(u64),

    /// secret with index {actual} was provided while index {expected} was
    /// expected
    UnexpectedIndex { expected: u64, actual: u64 },

    /// secret with index {0} does not derive previously received secrets
    InvalidSecret(u64),

    /// secret with index {0} is not known and can't be derived
    UnknownIndex(u64),
}

fn derive_secret(base: [u8; 32], bits: u8, index: u64) -> [u8; 32] {
    let mut secret = base;
    for bit in (0..bits).rev() {
        if index >> bit & 1 == 1 {
            secret[bit as usize / 8] ^= 1 << (bit % 8);
            secret = sha256::Hash::hash(&secret).into_inner();
        }
    }
    secret
}

#[inline]
fn height_to_index(height: u64) -> Result<u64, ShaChainError> {
    if height > START_INDEX {
        return Err(ShaChainError::HeightOverflow(height));
    }
    Ok(START_INDEX - height)
}

/// Generator of the local per-commitment secrets
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct ShaChainProducer {
    seed: [u8; 32],
}

impl ShaChainProducer {
    #[inline]
    pub fn with(seed: [u8; 32]) -> ShaChainProducer {
        ShaChainProducer { seed }
    }

    /// Secret at the given 48-bit index
    #[inline]
    pub fn at_index(&self, index: u64) -> [u8; 32] {
        derive_secret(self.seed, INDEX_BITS, index & START_INDEX)
    }

    /// Per-commitment secret for the commitment at `height`
    #[inline]
    pub fn at_height(&self, height: u64) -> Result<[u8; 32], ShaChainError> {
        Ok(self.at_index(height_to_index(height)?))
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
struct KnownSecret {
    index: u64,
    secret: [u8; 32],
}

/// Storage of the secrets revealed by the remote peer, keeping at most 49
/// entries from which all the previous secrets can be derived.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct ShaChainStore {
    known: Vec<Option<KnownSecret>>,
    next_index: u64,
}

impl Default for ShaChainStore {
    fn default() -> Self {
        ShaChainStore {
            known: vec![None; INDEX_BITS as usize + 1],
            next_index: START_INDEX,
        }
    }
}

impl ShaChainStore {
    #[inline]
    pub fn new() -> ShaChainStore {
        ShaChainStore::default()
    }

    /// Index expected for the next inserted secret
    #[inline]
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Number of secrets inserted so far
    #[inline]
    pub fn len(&self) -> u64 {
        START_INDEX - self.next_index
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts secret with an explicit index, which must be the next one in
    /// the descending sequence. Validates that the secret derives all the
    /// secrets it replaces.
    pub fn add_entry(
        &mut self,
        index: u64,
        secret: [u8; 32],
    ) -> Result<(), ShaChainError> {
        if index != self.next_index {
            return Err(ShaChainError::UnexpectedIndex {
                expected: self.next_index,
                actual: index,
            });
        }

        let position = (index.trailing_zeros() as u8).min(INDEX_BITS);
        for bit in 0..position {
            if let Some(known) = self.known[bit as usize] {
                if derive_secret(secret, position, known.index) != known.secret
                {
                    return Err(ShaChainError::InvalidSecret(index));
                }
            }
        }

        self.known[position as usize] = Some(KnownSecret { index, secret });
        self.next_index = self.next_index.wrapping_sub(1);
        Ok(())
    }

    /// Inserts the next secret in the sequence
    #[inline]
    pub fn add_next_entry(
        &mut self,
        secret: [u8; 32],
    ) -> Result<(), ShaChainError> {
        self.add_entry(self.next_index, secret)
    }

    /// Retrieves a previously inserted secret, or derives it from the stored
    /// ones
    pub fn lookup(&self, index: u64) -> Result<[u8; 32], ShaChainError> {
        for (bit, known) in self.known.iter().enumerate() {
            let known = match known {
                Some(known) => known,
                None => continue,
            };
            let mask = !((1u64 << bit) - 1);
            if index & mask == known.index & mask {
                return Ok(derive_secret(known.secret, bit as u8, index));
            }
        }
        Err(ShaChainError::UnknownIndex(index))
    }

    /// Retrieves per-commitment secret for the commitment at `height`
    #[inline]
    pub fn lookup_height(&self, height: u64) -> Result<[u8; 32], ShaChainError> {
        self.lookup(height_to_index(height)?)
    }
}
