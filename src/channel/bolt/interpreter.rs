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

//! Minimal segwit v0 script interpreter covering the opcodes used by the
//! channel scripts. Used to check that witnesses produced by the library
//! satisfy the outputs they spend, including timelock conditions.

use bitcoin::blockdata::opcodes::all::*;
use bitcoin::blockdata::opcodes::{self, Class, ClassifyContext};
use bitcoin::blockdata::script::Instruction;
use bitcoin::hashes::{hash160, ripemd160, sha256, sha256d, Hash};
use bitcoin::{PubkeyHash, Script, Transaction, TxOut};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SECP256K1};

use super::sign::segwit_sighash;
use crate::chain::SighashMode;

const MAX_ELEMENT_SIZE: usize = 520;
const MAX_STACK_SIZE: usize = 1000;
const MAX_PUBKEYS_PER_MULTISIG: i64 = 20;

const SEQUENCE_DISABLE_FLAG: u32 = 1 << 31;
const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;
const SEQUENCE_MASK: u32 = 0x0000_ffff;
const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Script evaluation failures
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum InterpreterError {
    /// spent output is not a segwit v0 output
    UnsupportedScriptPubkey,

    /// witness program does not commit to the provided witness
    WitnessProgramMismatch,

    /// witness of input #{0} is empty
    WitnessEmpty(usize),

    /// transaction has no input #{0}
    NoInput(usize),

    /// malformed script
    BadScript,

    /// stack element exceeds 520 bytes
    PushSize,

    /// stack size limit exceeded
    StackSize,

    /// operation requires more elements than the stack has
    InvalidStackOperation,

    /// unbalanced conditional
    UnbalancedConditional,

    /// argument of OP_IF/OP_NOTIF must be empty or 0x01
    MinimalIf,

    /// OP_VERIFY failed
    Verify,

    /// OP_EQUALVERIFY failed
    EqualVerify,

    /// OP_CHECKSIGVERIFY failed
    CheckSigVerify,

    /// OP_CHECKMULTISIGVERIFY failed
    CheckMultiSigVerify,

    /// OP_RETURN executed
    OpReturn,

    /// opcode {0:#04x} is not supported
    UnsupportedOpcode(u8),

    /// signature is not strictly DER-encoded
    SigDer,

    /// signature uses sighash type {0:#04x} which is not allowed on this
    /// chain
    SigHashType(u8),

    /// public key is not a valid compressed key
    PubkeyType,

    /// failed signature check with a non-empty signature
    NullFail,

    /// OP_CHECKMULTISIG dummy element is not empty
    NullDummy,

    /// invalid number of public keys in OP_CHECKMULTISIG
    PubkeyCount,

    /// invalid number of signatures in OP_CHECKMULTISIG
    SigCount,

    /// script number is not minimally encoded or overflows
    ScriptNum,

    /// negative locktime
    NegativeLocktime,

    /// locktime requirement is not satisfied
    UnsatisfiedLocktime,

    /// script evaluated to false
    EvalFalse,

    /// stack must contain a single element after evaluation
    CleanStack,
}

fn decode_num(data: &[u8], max_len: usize) -> Result<i64, InterpreterError> {
    if data.len() > max_len {
        return Err(InterpreterError::ScriptNum);
    }
    if let Some(last) = data.last() {
        // Minimal encoding: the most significant byte may be zero only if
        // it carries the sign bit of the next byte
        if last & 0x7f == 0
            && (data.len() == 1 || data[data.len() - 2] & 0x80 == 0)
        {
            return Err(InterpreterError::ScriptNum);
        }
    } else {
        return Ok(0);
    }
    let mut value = 0i64;
    for (no, byte) in data.iter().enumerate() {
        value |= (*byte as i64) << (8 * no);
    }
    let sign_bit = 0x80i64 << (8 * (data.len() - 1));
    if value & sign_bit != 0 {
        Ok(-(value & !sign_bit))
    } else {
        Ok(value)
    }
}

fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return vec![];
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut data = Vec::with_capacity(9);
    while abs > 0 {
        data.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if data.last().map(|b| b & 0x80 != 0).unwrap_or_default() {
        data.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        if let Some(last) = data.last_mut() {
            *last |= 0x80;
        }
    }
    data
}

fn cast_to_bool(data: &[u8]) -> bool {
    for (no, byte) in data.iter().enumerate() {
        if *byte != 0 {
            // Negative zero is false
            return !(no == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

/// Execution context of a single transaction input
pub struct Interpreter<'tx> {
    tx: &'tx Transaction,
    input_index: usize,
    value: u64,
    sighash: SighashMode,
}

impl<'tx> Interpreter<'tx> {
    pub fn new(
        tx: &'tx Transaction,
        input_index: usize,
        value: u64,
        sighash: SighashMode,
    ) -> Interpreter<'tx> {
        Interpreter {
            tx,
            input_index,
            value,
            sighash,
        }
    }

    /// Verifies input witness against the spent P2WSH or P2WPKH output
    pub fn verify_input(
        tx: &Transaction,
        input_index: usize,
        prevout: &TxOut,
        sighash: SighashMode,
    ) -> Result<(), InterpreterError> {
        let txin = tx
            .input
            .get(input_index)
            .ok_or(InterpreterError::NoInput(input_index))?;
        let mut stack = txin.witness.to_vec();
        let interpreter =
            Interpreter::new(tx, input_index, prevout.value, sighash);

        let script_pubkey = &prevout.script_pubkey;
        let script = if script_pubkey.is_v0_p2wsh() {
            let witness_script = Script::from(
                stack
                    .pop()
                    .ok_or(InterpreterError::WitnessEmpty(input_index))?,
            );
            if sha256::Hash::hash(witness_script.as_bytes())[..]
                != script_pubkey[2..]
            {
                return Err(InterpreterError::WitnessProgramMismatch);
            }
            witness_script
        } else if script_pubkey.is_v0_p2wpkh() {
            if stack.len() != 2 {
                return Err(InterpreterError::WitnessProgramMismatch);
            }
            Script::new_p2pkh(&PubkeyHash::from_slice(&script_pubkey[2..])
                .map_err(|_| InterpreterError::WitnessProgramMismatch)?)
        } else {
            return Err(InterpreterError::UnsupportedScriptPubkey);
        };

        if stack.iter().any(|elem| elem.len() > MAX_ELEMENT_SIZE) {
            return Err(InterpreterError::PushSize);
        }
        interpreter.execute(&script, &mut stack)?;
        match stack.len() {
            1 if cast_to_bool(&stack[0]) => Ok(()),
            1 => Err(InterpreterError::EvalFalse),
            0 => Err(InterpreterError::EvalFalse),
            _ => Err(InterpreterError::CleanStack),
        }
    }

    fn check_sig(
        &self,
        sig: &[u8],
        pubkey: &[u8],
        script: &Script,
    ) -> Result<bool, InterpreterError> {
        let pubkey = match pubkey.len() {
            33 => PublicKey::from_slice(pubkey)
                .map_err(|_| InterpreterError::PubkeyType)?,
            _ => return Err(InterpreterError::PubkeyType),
        };
        let (hash_type, der) = match sig.split_last() {
            None => return Ok(false),
            Some((hash_type, der)) => (*hash_type, der),
        };
        if hash_type != self.sighash.sighash_byte() {
            return Err(InterpreterError::SigHashType(hash_type));
        }
        let sig =
            Signature::from_der(der).map_err(|_| InterpreterError::SigDer)?;
        let sighash = segwit_sighash(
            self.tx,
            self.input_index,
            script,
            self.value,
            self.sighash,
        )
        .map_err(|_| InterpreterError::NoInput(self.input_index))?;
        let msg =
            Message::from_slice(&sighash[..]).expect("sighash has 32 bytes");
        if SECP256K1.verify_ecdsa(&msg, &sig, &pubkey).is_ok() {
            Ok(true)
        } else {
            Err(InterpreterError::NullFail)
        }
    }

    fn check_sequence(&self, required: i64) -> Result<(), InterpreterError> {
        if required < 0 {
            return Err(InterpreterError::NegativeLocktime);
        }
        let required = required as u32;
        if required & SEQUENCE_DISABLE_FLAG != 0 {
            return Ok(());
        }
        let sequence = self.tx.input[self.input_index].sequence.0;
        if self.tx.version < 2 || sequence & SEQUENCE_DISABLE_FLAG != 0 {
            return Err(InterpreterError::UnsatisfiedLocktime);
        }
        let mask = SEQUENCE_TYPE_FLAG | SEQUENCE_MASK;
        let (required, sequence) = (required & mask, sequence & mask);
        if (required < SEQUENCE_TYPE_FLAG) != (sequence < SEQUENCE_TYPE_FLAG) {
            return Err(InterpreterError::UnsatisfiedLocktime);
        }
        if required > sequence {
            return Err(InterpreterError::UnsatisfiedLocktime);
        }
        Ok(())
    }

    fn check_locktime(&self, required: i64) -> Result<(), InterpreterError> {
        if required < 0 {
            return Err(InterpreterError::NegativeLocktime);
        }
        let required = required as u64;
        let lock_time = self.tx.lock_time.0 as u64;
        let threshold = LOCKTIME_THRESHOLD as u64;
        if (required < threshold) != (lock_time < threshold) {
            return Err(InterpreterError::UnsatisfiedLocktime);
        }
        if required > lock_time {
            return Err(InterpreterError::UnsatisfiedLocktime);
        }
        if self.tx.input[self.input_index].sequence.0 == u32::MAX {
            return Err(InterpreterError::UnsatisfiedLocktime);
        }
        Ok(())
    }

    /// Executes script over the provided stack
    pub fn execute(
        &self,
        script: &Script,
        stack: &mut Vec<Vec<u8>>,
    ) -> Result<(), InterpreterError> {
        let mut exec_stack: Vec<bool> = vec![];

        macro_rules! pop {
            () => {
                stack.pop().ok_or(InterpreterError::InvalidStackOperation)?
            };
        }
        macro_rules! top {
            () => {
                stack.last().ok_or(InterpreterError::InvalidStackOperation)?
            };
        }

        for instruction in script.instructions() {
            let instruction =
                instruction.map_err(|_| InterpreterError::BadScript)?;
            let executing = exec_stack.iter().all(|branch| *branch);

            let op = match instruction {
                Instruction::PushBytes(data) => {
                    if data.len() > MAX_ELEMENT_SIZE {
                        return Err(InterpreterError::PushSize);
                    }
                    if executing {
                        stack.push(data.to_vec());
                    }
                    continue;
                }
                Instruction::Op(op) => op,
            };

            match op {
                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if executing {
                        let arg = pop!();
                        if arg.len() > 1 || (arg.len() == 1 && arg[0] != 1) {
                            return Err(InterpreterError::MinimalIf);
                        }
                        value = cast_to_bool(&arg);
                        if op == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec_stack.push(value);
                    continue;
                }
                OP_ELSE => {
                    let branch = exec_stack
                        .last_mut()
                        .ok_or(InterpreterError::UnbalancedConditional)?;
                    *branch = !*branch;
                    continue;
                }
                OP_ENDIF => {
                    exec_stack
                        .pop()
                        .ok_or(InterpreterError::UnbalancedConditional)?;
                    continue;
                }
                _ if !executing => continue,
                _ => {}
            }

            if let Class::PushNum(num) = op.classify(ClassifyContext::Legacy) {
                stack.push(encode_num(num as i64));
                continue;
            }

            match op {
                OP_NOP => {}
                OP_VERIFY => {
                    if !cast_to_bool(&pop!()) {
                        return Err(InterpreterError::Verify);
                    }
                }
                OP_RETURN => return Err(InterpreterError::OpReturn),
                OP_DROP => {
                    pop!();
                }
                OP_DUP => {
                    let elem = top!().clone();
                    stack.push(elem);
                }
                OP_SWAP => {
                    let len = stack.len();
                    if len < 2 {
                        return Err(InterpreterError::InvalidStackOperation);
                    }
                    stack.swap(len - 1, len - 2);
                }
                OP_SIZE => {
                    let size = top!().len();
                    stack.push(encode_num(size as i64));
                }
                OP_EQUAL | OP_EQUALVERIFY => {
                    let a = pop!();
                    let b = pop!();
                    let equal = a == b;
                    if op == OP_EQUALVERIFY {
                        if !equal {
                            return Err(InterpreterError::EqualVerify);
                        }
                    } else {
                        stack.push(if equal { vec![1] } else { vec![] });
                    }
                }
                OP_RIPEMD160 => {
                    let data = pop!();
                    stack.push(ripemd160::Hash::hash(&data)[..].to_vec());
                }
                OP_SHA256 => {
                    let data = pop!();
                    stack.push(sha256::Hash::hash(&data)[..].to_vec());
                }
                OP_HASH160 => {
                    let data = pop!();
                    stack.push(hash160::Hash::hash(&data)[..].to_vec());
                }
                OP_HASH256 => {
                    let data = pop!();
                    stack.push(sha256d::Hash::hash(&data)[..].to_vec());
                }
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let pubkey = pop!();
                    let sig = pop!();
                    let valid = self.check_sig(&sig, &pubkey, script)?;
                    if op == OP_CHECKSIGVERIFY {
                        if !valid {
                            return Err(InterpreterError::CheckSigVerify);
                        }
                    } else {
                        stack.push(if valid { vec![1] } else { vec![] });
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let keys_count = decode_num(&pop!(), 4)?;
                    if !(0..=MAX_PUBKEYS_PER_MULTISIG).contains(&keys_count) {
                        return Err(InterpreterError::PubkeyCount);
                    }
                    let mut keys = (0..keys_count)
                        .map(|_| stack.pop())
                        .collect::<Option<Vec<_>>>()
                        .ok_or(InterpreterError::InvalidStackOperation)?;
                    let sigs_count = decode_num(&pop!(), 4)?;
                    if !(0..=keys_count).contains(&sigs_count) {
                        return Err(InterpreterError::SigCount);
                    }
                    let mut sigs = (0..sigs_count)
                        .map(|_| stack.pop())
                        .collect::<Option<Vec<_>>>()
                        .ok_or(InterpreterError::InvalidStackOperation)?;
                    if !pop!().is_empty() {
                        return Err(InterpreterError::NullDummy);
                    }
                    // Popped in reverse; check in script order
                    keys.reverse();
                    sigs.reverse();

                    let mut valid = true;
                    let mut key_iter = keys.iter();
                    for sig in &sigs {
                        let mut matched = false;
                        for key in key_iter.by_ref() {
                            if self.check_sig(sig, key, script).unwrap_or(false)
                            {
                                matched = true;
                                break;
                            }
                        }
                        if !matched {
                            valid = false;
                            break;
                        }
                    }
                    if !valid && sigs.iter().any(|sig| !sig.is_empty()) {
                        return Err(InterpreterError::NullFail);
                    }
                    if op == OP_CHECKMULTISIGVERIFY {
                        if !valid {
                            return Err(InterpreterError::CheckMultiSigVerify);
                        }
                    } else {
                        stack.push(if valid { vec![1] } else { vec![] });
                    }
                }
                OP_CSV => {
                    self.check_sequence(decode_num(top!(), 5)?)?;
                }
                OP_CLTV => {
                    self.check_locktime(decode_num(top!(), 5)?)?;
                }
                op => {
                    return Err(InterpreterError::UnsupportedOpcode(
                        opcodes::All::to_u8(op),
                    ))
                }
            }

            if stack.len() > MAX_STACK_SIZE {
                return Err(InterpreterError::StackSize);
            }
        }

        if !exec_stack.is_empty() {
            return Err(InterpreterError::UnbalancedConditional);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use bitcoin::blockdata::script::Builder;
    use bitcoin::consensus::serialize;
    use bitcoin::{Amount, OutPoint, PackedLockTime, Sequence, TxIn, Witness};
    use secp256k1::SecretKey;

    use super::*;
    use crate::channel::bolt::derivation::{
        derive_revocation_privkey, derive_revocation_pubkey,
    };
    use crate::channel::bolt::scripts::ScriptGenerators;
    use crate::channel::bolt::sign::{
        htlc_revoke_witness, htlc_success_witness, htlc_timeout_witness,
        offered_htlc_redeem_witness, received_htlc_timeout_witness,
        to_local_delay_witness, to_local_revoke_witness, to_remote_witness,
        MemorySigner, SignDescriptor, Signer,
    };

    /// libbitcoinconsensus flags for the rules enforced by the interpreter:
    /// P2SH, DERSIG, NULLDUMMY, CHECKLOCKTIMEVERIFY, CHECKSEQUENCEVERIFY and
    /// WITNESS
    const CONSENSUS_FLAGS: u32 =
        1 | (1 << 2) | (1 << 4) | (1 << 9) | (1 << 10) | (1 << 11);

    fn key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    fn pubkey(byte: u8) -> PublicKey {
        PublicKey::from_secret_key(SECP256K1, &key(byte))
    }

    fn sweep_tx(sequence: u32) -> Transaction {
        Transaction {
            version: 2,
            lock_time: PackedLockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: Script::new(),
                sequence: Sequence(sequence),
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: 50_000,
                script_pubkey: TxOut::ln_to_remote(0, pubkey(9)).script_pubkey,
            }],
        }
    }

    #[test]
    fn numbers() {
        assert_eq!(encode_num(0), Vec::<u8>::new());
        assert_eq!(encode_num(144), vec![0x90, 0x00]);
        assert_eq!(encode_num(-1), vec![0x81]);
        assert_eq!(encode_num(32), vec![0x20]);
        assert_eq!(decode_num(&[0x90, 0x00], 5), Ok(144));
        assert_eq!(decode_num(&[0x81], 5), Ok(-1));
        assert_eq!(decode_num(&[0x20, 0x00], 5), Err(InterpreterError::ScriptNum));
        assert_eq!(
            decode_num(&[1, 2, 3, 4, 5, 6], 5),
            Err(InterpreterError::ScriptNum)
        );
        assert!(!cast_to_bool(&[0, 0x80]));
        assert!(cast_to_bool(&[0, 1]));
    }

    #[test]
    fn to_local_spends() {
        let delay_secret = key(1);
        let revocation_base = key(2);
        let commit_secret = key(3);
        let commit_point = PublicKey::from_secret_key(SECP256K1, &commit_secret);
        let revocation_key =
            derive_revocation_pubkey(&pubkey(2), &commit_point);
        let script =
            Script::ln_to_local(0, revocation_key, pubkey(1), 144);
        let prevout = TxOut {
            value: 100_000,
            script_pubkey: script.to_v0_p2wsh(),
        };
        let mode = SighashMode::Standard;
        let signer = MemorySigner::with(vec![delay_secret, revocation_base]);

        // Delayed path before and after the CSV delay
        for (sequence, ok) in [(143, false), (144, true), (u32::MAX, false)] {
            let mut tx = sweep_tx(sequence);
            let desc = SignDescriptor::new(
                pubkey(1),
                script.clone(),
                prevout.clone(),
                0,
                mode,
            );
            let sig = signer.sign_output_raw(&tx, &desc).unwrap();
            tx.input[0].witness = to_local_delay_witness(&sig, &script, mode);
            let res = Interpreter::verify_input(&tx, 0, &prevout, mode);
            if ok {
                assert_eq!(res, Ok(()));
            } else {
                assert_eq!(res, Err(InterpreterError::UnsatisfiedLocktime));
            }
        }

        // Revocation path is always available
        let mut tx = sweep_tx(0);
        let desc =
            SignDescriptor::new(pubkey(2), script.clone(), prevout.clone(), 0, mode)
                .with_double_tweak(commit_secret);
        assert_eq!(desc.signing_pubkey(), revocation_key);
        let sig = signer.sign_output_raw(&tx, &desc).unwrap();
        tx.input[0].witness = to_local_revoke_witness(&sig, &script, mode);
        assert_eq!(Interpreter::verify_input(&tx, 0, &prevout, mode), Ok(()));

        // Delay key can't be used in the revocation branch
        let desc =
            SignDescriptor::new(pubkey(1), script.clone(), prevout.clone(), 0, mode);
        let sig = signer.sign_output_raw(&tx, &desc).unwrap();
        tx.input[0].witness = to_local_revoke_witness(&sig, &script, mode);
        assert_eq!(
            Interpreter::verify_input(&tx, 0, &prevout, mode),
            Err(InterpreterError::NullFail)
        );

        // Revocation key derived with a wrong commitment secret fails
        let wrong = derive_revocation_privkey(&revocation_base, &key(4));
        let sighash = desc.sighash(&tx).unwrap();
        let sig = SECP256K1.sign_ecdsa(
            &Message::from_slice(&sighash[..]).unwrap(),
            &wrong,
        );
        tx.input[0].witness = to_local_revoke_witness(&sig, &script, mode);
        assert_eq!(
            Interpreter::verify_input(&tx, 0, &prevout, mode),
            Err(InterpreterError::NullFail)
        );
    }

    #[test]
    fn to_remote_spend() {
        let prevout = TxOut::ln_to_remote(70_000, pubkey(5));
        let mut tx = sweep_tx(0);
        let script = Script::ln_to_remote(0, pubkey(5));
        let desc =
            SignDescriptor::new(pubkey(5), script, prevout.clone(), 0, SighashMode::Standard);
        let sig = MemorySigner::with(vec![key(5)])
            .sign_output_raw(&tx, &desc)
            .unwrap();
        tx.input[0].witness =
            to_remote_witness(&sig, &pubkey(5), SighashMode::Standard);
        assert_eq!(
            Interpreter::verify_input(&tx, 0, &prevout, SighashMode::Standard),
            Ok(())
        );
        tx.input[0].witness =
            to_remote_witness(&sig, &pubkey(6), SighashMode::Standard);
        assert_eq!(
            Interpreter::verify_input(&tx, 0, &prevout, SighashMode::Standard),
            Err(InterpreterError::EqualVerify)
        );
    }

    #[test]
    fn sighash_type_enforced() {
        let prevout = TxOut::ln_to_remote(70_000, pubkey(5));
        let mut tx = sweep_tx(0);
        let script = Script::ln_to_remote(0, pubkey(5));
        let desc =
            SignDescriptor::new(pubkey(5), script, prevout.clone(), 0, SighashMode::Standard);
        let sig = MemorySigner::with(vec![key(5)])
            .sign_output_raw(&tx, &desc)
            .unwrap();
        tx.input[0].witness =
            to_remote_witness(&sig, &pubkey(5), SighashMode::Standard);
        assert_eq!(
            Interpreter::verify_input(&tx, 0, &prevout, SighashMode::ForkId(79)),
            Err(InterpreterError::SigHashType(0x01))
        );
    }

    #[test]
    fn minimal_if() {
        let script = Builder::new()
            .push_opcode(OP_IF)
            .push_int(1)
            .push_opcode(OP_ELSE)
            .push_int(0)
            .push_opcode(OP_ENDIF)
            .into_script();
        let tx = sweep_tx(0);
        let interpreter =
            Interpreter::new(&tx, 0, 0, SighashMode::Standard);
        let mut stack = vec![vec![2]];
        assert_eq!(
            interpreter.execute(&script, &mut stack),
            Err(InterpreterError::MinimalIf)
        );
        let mut stack = vec![vec![1]];
        assert_eq!(interpreter.execute(&script, &mut stack), Ok(()));
        assert_eq!(stack, vec![vec![1]]);
        let mut stack = vec![vec![]];
        assert_eq!(interpreter.execute(&script, &mut stack), Ok(()));
        assert_eq!(stack, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn unbalanced_conditional() {
        let script = Builder::new()
            .push_int(1)
            .push_opcode(OP_IF)
            .push_int(1)
            .into_script();
        let tx = sweep_tx(0);
        let interpreter =
            Interpreter::new(&tx, 0, 0, SighashMode::Standard);
        assert_eq!(
            interpreter.execute(&script, &mut vec![]),
            Err(InterpreterError::UnbalancedConditional)
        );
    }

    #[test]
    fn wrong_witness_script() {
        let script = Script::ln_to_local(0, pubkey(1), pubkey(2), 144);
        let prevout = TxOut {
            value: 1000,
            script_pubkey: script.to_v0_p2wsh(),
        };
        let mut tx = sweep_tx(144);
        tx.input[0].witness = Witness::from_vec(vec![
            vec![],
            vec![],
            Script::ln_to_local(0, pubkey(1), pubkey(2), 143).to_bytes(),
        ]);
        assert_eq!(
            Interpreter::verify_input(&tx, 0, &prevout, SighashMode::Standard),
            Err(InterpreterError::WitnessProgramMismatch)
        );
    }

    fn sign_standard(
        tx: &Transaction,
        witness_script: &Script,
        prevout: &TxOut,
        secret: u8,
    ) -> Signature {
        let desc = SignDescriptor::new(
            pubkey(secret),
            witness_script.clone(),
            prevout.clone(),
            0,
            SighashMode::Standard,
        );
        MemorySigner::with(vec![key(secret)])
            .sign_output_raw(tx, &desc)
            .unwrap()
    }

    /// Runs the input through both the interpreter and libbitcoinconsensus
    fn assert_engines_agree(tx: &Transaction, prevout: &TxOut, valid: bool) {
        let ours =
            Interpreter::verify_input(tx, 0, prevout, SighashMode::Standard);
        let consensus = prevout.script_pubkey.verify_with_flags(
            0,
            Amount::from_sat(prevout.value),
            &serialize(tx),
            CONSENSUS_FLAGS,
        );
        assert_eq!(ours.is_ok(), valid, "interpreter: {:?}", ours);
        assert_eq!(consensus.is_ok(), valid, "consensus: {:?}", consensus);
    }

    #[test]
    fn consensus_equivalence() {
        let mode = SighashMode::Standard;
        let wsh = |script: &Script| TxOut {
            value: 100_000,
            script_pubkey: script.to_v0_p2wsh(),
        };

        // to_local and second-level outputs: delay key 1, revocation key 2
        for script in [
            Script::ln_to_local(0, pubkey(2), pubkey(1), 144),
            Script::ln_htlc_output(0, pubkey(2), pubkey(1), 144),
        ] {
            let prevout = wsh(&script);
            for (sequence, valid) in [(144, true), (143, false)] {
                let mut tx = sweep_tx(sequence);
                let sig = sign_standard(&tx, &script, &prevout, 1);
                tx.input[0].witness =
                    to_local_delay_witness(&sig, &script, mode);
                assert_engines_agree(&tx, &prevout, valid);
            }
            for (secret, valid) in [(2, true), (1, false)] {
                let mut tx = sweep_tx(0);
                let sig = sign_standard(&tx, &script, &prevout, secret);
                tx.input[0].witness =
                    to_local_revoke_witness(&sig, &script, mode);
                assert_engines_agree(&tx, &prevout, valid);
            }
        }

        // to_remote
        let prevout = TxOut::ln_to_remote(70_000, pubkey(5));
        let script = Script::ln_to_remote(0, pubkey(5));
        let mut tx = sweep_tx(0);
        let sig = sign_standard(&tx, &script, &prevout, 5);
        for (key, valid) in [(pubkey(5), true), (pubkey(6), false)] {
            tx.input[0].witness = to_remote_witness(&sig, &key, mode);
            assert_engines_agree(&tx, &prevout, valid);
        }

        // HTLCs: revocation key 2, local HTLC key 3, remote HTLC key 4
        let preimage = [7u8; 32];
        let payment_hash = sha256::Hash::hash(&preimage);
        let offered = Script::ln_offered_htlc(
            0,
            pubkey(2),
            pubkey(3),
            pubkey(4),
            payment_hash,
        );
        let received = Script::ln_received_htlc(
            0,
            pubkey(2),
            pubkey(3),
            pubkey(4),
            500,
            payment_hash,
        );
        for script in [&offered, &received] {
            let prevout = wsh(script);
            for (secret, valid) in [(2, true), (4, false)] {
                let mut tx = sweep_tx(0);
                let sig = sign_standard(&tx, script, &prevout, secret);
                tx.input[0].witness =
                    htlc_revoke_witness(&sig, &pubkey(secret), script, mode);
                assert_engines_agree(&tx, &prevout, valid);
            }
        }

        // Offered HTLC: remote claim with the preimage and HTLC-timeout
        let prevout = wsh(&offered);
        for (preimage, valid) in [(preimage, true), ([8u8; 32], false)] {
            let mut tx = sweep_tx(0);
            let sig = sign_standard(&tx, &offered, &prevout, 4);
            tx.input[0].witness =
                offered_htlc_redeem_witness(&sig, &preimage, &offered, mode);
            assert_engines_agree(&tx, &prevout, valid);
        }
        for (local, valid) in [(3, true), (6, false)] {
            let mut tx = sweep_tx(0);
            tx.lock_time = PackedLockTime(500);
            let remote_sig = sign_standard(&tx, &offered, &prevout, 4);
            let local_sig = sign_standard(&tx, &offered, &prevout, local);
            tx.input[0].witness =
                htlc_timeout_witness(&remote_sig, &local_sig, &offered, mode);
            assert_engines_agree(&tx, &prevout, valid);
        }

        // Received HTLC: HTLC-success and remote reclaim after the expiry
        let prevout = wsh(&received);
        for (preimage, valid) in [(preimage, true), ([8u8; 32], false)] {
            let mut tx = sweep_tx(0);
            let remote_sig = sign_standard(&tx, &received, &prevout, 4);
            let local_sig = sign_standard(&tx, &received, &prevout, 3);
            tx.input[0].witness = htlc_success_witness(
                &remote_sig,
                &local_sig,
                &preimage,
                &received,
                mode,
            );
            assert_engines_agree(&tx, &prevout, valid);
        }
        for (lock_time, valid) in [(500, true), (499, false)] {
            let mut tx = sweep_tx(0);
            tx.lock_time = PackedLockTime(lock_time);
            let sig = sign_standard(&tx, &received, &prevout, 4);
            tx.input[0].witness =
                received_htlc_timeout_witness(&sig, &received, mode);
            assert_engines_agree(&tx, &prevout, valid);
        }
    }
}
