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

//! Signing of channel transaction inputs and witness construction.
//!
//! Private keys never leave the [`Signer`] implementation; the rest of the
//! library operates with [`SignDescriptor`]s describing what has to be signed.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bitcoin::consensus::Encodable;
use bitcoin::hashes::{sha256d, Hash, HashEngine};
use bitcoin::{OutPoint, Script, Transaction, TxOut, Witness};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};

use super::derivation::{
    derive_revocation_privkey, derive_revocation_pubkey, tweak_privkey,
    tweak_pubkey_with_tweak,
};
use crate::chain::SighashMode;

/// Errors produced by transaction signers
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum SignerError {
    /// signer does not control private key for {0}
    KeyNotFound(PublicKey),

    /// signer did not respond within {0} ms
    HardwareTimeout(u64),

    /// signer is not available
    Unavailable,

    /// transaction has no input #{0} to sign
    NoInput(usize),
}

impl SignerError {
    /// Whether the operation may succeed if repeated later
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(self, SignerError::HardwareTimeout(_) | SignerError::Unavailable)
    }
}

/// Output spendable by the channel
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: Script,
    pub witness_script: Option<Script>,
}

/// Everything required to produce a signature for a single transaction
/// input, except the private key.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct SignDescriptor {
    /// Base public key the signing key is derived from
    pub key: PublicKey,

    /// Tweak added to the base key, as in [`tweak_pubkey_with_tweak`]
    pub single_tweak: Option<[u8; 32]>,

    /// Per-commitment secret turning a revocation base key into the
    /// revocation key
    pub double_tweak: Option<SecretKey>,

    pub witness_script: Script,

    /// Output being spent
    pub output: TxOut,

    pub sighash: SighashMode,

    pub input_index: usize,
}

impl SignDescriptor {
    /// Creates descriptor for signing `input_index` spending `output` locked
    /// with `witness_script`
    pub fn new(
        key: PublicKey,
        witness_script: Script,
        output: TxOut,
        input_index: usize,
        sighash: SighashMode,
    ) -> SignDescriptor {
        SignDescriptor {
            key,
            single_tweak: None,
            double_tweak: None,
            witness_script,
            output,
            sighash,
            input_index,
        }
    }

    #[inline]
    pub fn with_single_tweak(mut self, tweak: [u8; 32]) -> SignDescriptor {
        self.single_tweak = Some(tweak);
        self
    }

    #[inline]
    pub fn with_double_tweak(mut self, secret: SecretKey) -> SignDescriptor {
        self.double_tweak = Some(secret);
        self
    }

    /// Public key the produced signature verifies against
    pub fn signing_pubkey(&self) -> PublicKey {
        match (self.single_tweak, self.double_tweak) {
            (Some(tweak), _) => tweak_pubkey_with_tweak(&self.key, &tweak),
            (None, Some(secret)) => derive_revocation_pubkey(
                &self.key,
                &PublicKey::from_secret_key(SECP256K1, &secret),
            ),
            (None, None) => self.key,
        }
    }

    /// Signature hash of the described input in `tx`
    #[inline]
    pub fn sighash(
        &self,
        tx: &Transaction,
    ) -> Result<sha256d::Hash, SignerError> {
        segwit_sighash(
            tx,
            self.input_index,
            &self.witness_script,
            self.output.value,
            self.sighash,
        )
    }
}

/// Descriptor for signing input `input_index` which spends a segwit v0
/// output of `value` locked with `witness_script`. For P2WPKH outputs
/// `witness_script` is the P2PKH script code of the key.
#[allow(clippy::too_many_arguments)]
pub fn create_sign_descriptor(
    key: PublicKey,
    single_tweak: Option<[u8; 32]>,
    double_tweak: Option<SecretKey>,
    witness_script: Script,
    value: u64,
    input_index: usize,
    sighash: SighashMode,
) -> SignDescriptor {
    let script_pubkey = if witness_script.is_p2pkh() {
        let mut program = vec![0u8, 20];
        program.extend_from_slice(&witness_script[3..23]);
        Script::from(program)
    } else {
        witness_script.to_v0_p2wsh()
    };
    SignDescriptor {
        key,
        single_tweak,
        double_tweak,
        witness_script,
        output: TxOut {
            value,
            script_pubkey,
        },
        sighash,
        input_index,
    }
}

/// BIP-143 signature hash with the hash type defined by the sighash mode.
///
/// For fork-id chains the committed hash type includes the fork id, while
/// the rest of the preimage is identical to BIP-143.
pub fn segwit_sighash(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    value: u64,
    mode: SighashMode,
) -> Result<sha256d::Hash, SignerError> {
    let txin = tx
        .input
        .get(input_index)
        .ok_or(SignerError::NoInput(input_index))?;

    let mut prevouts = sha256d::Hash::engine();
    let mut sequences = sha256d::Hash::engine();
    for input in &tx.input {
        input
            .previous_output
            .consensus_encode(&mut prevouts)
            .expect("engines don't error");
        input
            .sequence
            .consensus_encode(&mut sequences)
            .expect("engines don't error");
    }
    let mut outputs = sha256d::Hash::engine();
    for output in &tx.output {
        output
            .consensus_encode(&mut outputs)
            .expect("engines don't error");
    }

    let mut engine = sha256d::Hash::engine();
    tx.version
        .consensus_encode(&mut engine)
        .expect("engines don't error");
    engine.input(&sha256d::Hash::from_engine(prevouts)[..]);
    engine.input(&sha256d::Hash::from_engine(sequences)[..]);
    txin.previous_output
        .consensus_encode(&mut engine)
        .expect("engines don't error");
    script_code
        .consensus_encode(&mut engine)
        .expect("engines don't error");
    value
        .consensus_encode(&mut engine)
        .expect("engines don't error");
    txin.sequence
        .consensus_encode(&mut engine)
        .expect("engines don't error");
    engine.input(&sha256d::Hash::from_engine(outputs)[..]);
    tx.lock_time
        .consensus_encode(&mut engine)
        .expect("engines don't error");
    mode.preimage_hash_type()
        .consensus_encode(&mut engine)
        .expect("engines don't error");
    Ok(sha256d::Hash::from_engine(engine))
}

#[inline]
fn message(sighash: sha256d::Hash) -> Message {
    Message::from_slice(&sighash[..]).expect("sighash has 32 bytes")
}

/// Checks signature of the input described by `desc` against `pubkey`
pub fn verify_signature(
    tx: &Transaction,
    desc: &SignDescriptor,
    signature: &Signature,
    pubkey: &PublicKey,
) -> Result<bool, SignerError> {
    let sighash = desc.sighash(tx)?;
    Ok(SECP256K1
        .verify_ecdsa(&message(sighash), signature, pubkey)
        .is_ok())
}

/// Signing capability. Implementations hold the private keys, or talk to a
/// device which does.
pub trait Signer {
    /// Produces signature for the input described by `desc`, without the
    /// sighash type byte
    fn sign_output_raw(
        &self,
        tx: &Transaction,
        desc: &SignDescriptor,
    ) -> Result<Signature, SignerError>;
}

impl<S> Signer for Arc<S>
where
    S: Signer + ?Sized,
{
    #[inline]
    fn sign_output_raw(
        &self,
        tx: &Transaction,
        desc: &SignDescriptor,
    ) -> Result<Signature, SignerError> {
        self.as_ref().sign_output_raw(tx, desc)
    }
}

/// Signer keeping private keys in memory
#[derive(Clone, Debug, Default)]
pub struct MemorySigner {
    keys: Vec<SecretKey>,
}

impl MemorySigner {
    #[inline]
    pub fn with(keys: impl IntoIterator<Item = SecretKey>) -> MemorySigner {
        MemorySigner {
            keys: keys.into_iter().collect(),
        }
    }

    #[inline]
    pub fn add_key(&mut self, key: SecretKey) {
        self.keys.push(key)
    }

    /// Finds private key for the descriptor: either a key matching the
    /// tweaked public key directly, or a base key which matches after
    /// applying the descriptor tweak.
    fn find_key(&self, desc: &SignDescriptor) -> Option<SecretKey> {
        let target = desc.signing_pubkey();
        self.keys.iter().find_map(|key| {
            if PublicKey::from_secret_key(SECP256K1, key) == target {
                return Some(*key);
            }
            let derived = match (desc.single_tweak, desc.double_tweak) {
                (Some(tweak), _) => tweak_privkey(key, &tweak),
                (None, Some(secret)) => derive_revocation_privkey(key, &secret),
                (None, None) => return None,
            };
            if PublicKey::from_secret_key(SECP256K1, &derived) == target {
                Some(derived)
            } else {
                None
            }
        })
    }
}

impl Signer for MemorySigner {
    fn sign_output_raw(
        &self,
        tx: &Transaction,
        desc: &SignDescriptor,
    ) -> Result<Signature, SignerError> {
        let key = self
            .find_key(desc)
            .ok_or_else(|| SignerError::KeyNotFound(desc.signing_pubkey()))?;
        let sighash = desc.sighash(tx)?;
        Ok(SECP256K1.sign_ecdsa(&message(sighash), &key))
    }
}

/// Wraps a signer which may block (hardware or remote signers) and bounds
/// the time each signing request may take.
///
/// Each request runs on its own worker thread. A request which times out
/// is not cancelled: its thread stays detached until the inner signer
/// returns and the late result is dropped. The inner signer thus must
/// eventually return from every call (by failing on its own transport
/// timeout, for instance), otherwise each timed out request leaks a thread.
#[derive(Debug)]
pub struct BoundedSigner<S> {
    inner: Arc<S>,
    timeout: Duration,
}

impl<S> Clone for BoundedSigner<S> {
    fn clone(&self) -> Self {
        BoundedSigner {
            inner: self.inner.clone(),
            timeout: self.timeout,
        }
    }
}

impl<S> BoundedSigner<S>
where
    S: Signer + Send + Sync + 'static,
{
    #[inline]
    pub fn with(signer: S, timeout: Duration) -> BoundedSigner<S> {
        BoundedSigner {
            inner: Arc::new(signer),
            timeout,
        }
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<S> Signer for BoundedSigner<S>
where
    S: Signer + Send + Sync + 'static,
{
    fn sign_output_raw(
        &self,
        tx: &Transaction,
        desc: &SignDescriptor,
    ) -> Result<Signature, SignerError> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let inner = self.inner.clone();
        let tx = tx.clone();
        let desc = desc.clone();
        thread::spawn(move || {
            // Receiver may be gone after the timeout
            let _ = sender.send(inner.sign_output_raw(&tx, &desc));
        });
        match receiver.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Signer did not respond within {} ms",
                    self.timeout.as_millis()
                );
                Err(SignerError::HardwareTimeout(
                    self.timeout.as_millis() as u64
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("Signer thread terminated without a response");
                Err(SignerError::Unavailable)
            }
        }
    }
}

/// Serializes signature for a witness stack, appending the sighash type byte
pub fn witness_sig(signature: &Signature, mode: SighashMode) -> Vec<u8> {
    let mut data = signature.serialize_der().to_vec();
    data.push(mode.sighash_byte());
    data
}

/// Witness spending the 2-of-2 funding output; signatures are ordered as the
/// keys in the funding script
pub fn funding_witness(
    local_key: PublicKey,
    local_sig: &Signature,
    remote_key: PublicKey,
    remote_sig: &Signature,
    funding_script: &Script,
    mode: SighashMode,
) -> Witness {
    let local = witness_sig(local_sig, mode);
    let remote = witness_sig(remote_sig, mode);
    let (first, second) = if local_key.serialize() < remote_key.serialize() {
        (local, remote)
    } else {
        (remote, local)
    };
    Witness::from_vec(vec![vec![], first, second, funding_script.to_bytes()])
}

/// Witness spending `to_local` or a second-level HTLC output after the CSV
/// delay
pub fn to_local_delay_witness(
    signature: &Signature,
    witness_script: &Script,
    mode: SighashMode,
) -> Witness {
    Witness::from_vec(vec![
        witness_sig(signature, mode),
        vec![],
        witness_script.to_bytes(),
    ])
}

/// Witness spending `to_local` or a second-level HTLC output with the
/// revocation key
pub fn to_local_revoke_witness(
    signature: &Signature,
    witness_script: &Script,
    mode: SighashMode,
) -> Witness {
    Witness::from_vec(vec![
        witness_sig(signature, mode),
        vec![1],
        witness_script.to_bytes(),
    ])
}

/// Witness spending P2WPKH `to_remote` output
pub fn to_remote_witness(
    signature: &Signature,
    pubkey: &PublicKey,
    mode: SighashMode,
) -> Witness {
    Witness::from_vec(vec![
        witness_sig(signature, mode),
        pubkey.serialize().to_vec(),
    ])
}

/// Witness spending any HTLC output with the revocation key
pub fn htlc_revoke_witness(
    signature: &Signature,
    revocation_key: &PublicKey,
    witness_script: &Script,
    mode: SighashMode,
) -> Witness {
    Witness::from_vec(vec![
        witness_sig(signature, mode),
        revocation_key.serialize().to_vec(),
        witness_script.to_bytes(),
    ])
}

/// Witness of the HTLC-timeout transaction spending an offered HTLC of the
/// commitment owner
pub fn htlc_timeout_witness(
    remote_sig: &Signature,
    local_sig: &Signature,
    witness_script: &Script,
    mode: SighashMode,
) -> Witness {
    Witness::from_vec(vec![
        vec![],
        witness_sig(remote_sig, mode),
        witness_sig(local_sig, mode),
        vec![],
        witness_script.to_bytes(),
    ])
}

/// Witness of the HTLC-success transaction spending a received HTLC of the
/// commitment owner
pub fn htlc_success_witness(
    remote_sig: &Signature,
    local_sig: &Signature,
    preimage: &[u8; 32],
    witness_script: &Script,
    mode: SighashMode,
) -> Witness {
    Witness::from_vec(vec![
        vec![],
        witness_sig(remote_sig, mode),
        witness_sig(local_sig, mode),
        preimage.to_vec(),
        witness_script.to_bytes(),
    ])
}

/// Witness of the counterparty claiming an HTLC offered by the commitment
/// owner with the payment preimage
pub fn offered_htlc_redeem_witness(
    signature: &Signature,
    preimage: &[u8; 32],
    witness_script: &Script,
    mode: SighashMode,
) -> Witness {
    Witness::from_vec(vec![
        witness_sig(signature, mode),
        preimage.to_vec(),
        witness_script.to_bytes(),
    ])
}

/// Witness of the counterparty reclaiming an HTLC received by the commitment
/// owner after it timed out
pub fn received_htlc_timeout_witness(
    signature: &Signature,
    witness_script: &Script,
    mode: SighashMode,
) -> Witness {
    Witness::from_vec(vec![
        witness_sig(signature, mode),
        vec![],
        witness_script.to_bytes(),
    ])
}
