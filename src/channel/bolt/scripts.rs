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

//! Script templates for BOLT-3 transaction outputs.
//!
//! Implementations for [`Script`] produce *witness scripts* (for P2WPKH
//! `to_remote` outputs: the script code committed to by the BIP-143
//! signature hash), implementations for [`TxOut`] produce the complete
//! output with the P2WSH/P2WPKH script pubkey.

use bitcoin::blockdata::opcodes::all::*;
use bitcoin::blockdata::script;
use bitcoin::hashes::{ripemd160, sha256, Hash};
use bitcoin::{PubkeyHash, Script, TxOut, WPubkeyHash};
use secp256k1::PublicKey;

/// Errors constructing scripts from externally provided key material
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum ScriptError {
    /// key `{0}` is not a valid compressed secp256k1 point
    InvalidKeyEncoding(&'static str),
}

/// Parses a public key from its serialized form, naming the key in the error
pub fn pubkey_from_slice(
    data: &[u8],
    name: &'static str,
) -> Result<PublicKey, ScriptError> {
    PublicKey::from_slice(data)
        .map_err(|_| ScriptError::InvalidKeyEncoding(name))
}

#[inline]
fn btc_key(pubkey: PublicKey) -> bitcoin::PublicKey {
    bitcoin::PublicKey::new(pubkey)
}

#[inline]
fn pubkey_hash(pubkey: PublicKey) -> PubkeyHash {
    PubkeyHash::hash(&pubkey.serialize())
}

pub trait ScriptGenerators {
    fn ln_funding(
        amount: u64,
        local_pubkey: PublicKey,
        remote_pubkey: PublicKey,
    ) -> Self;

    /// NB: `local_delayedpubkey` belongs to the owner of the commitment
    /// transaction, which is the remote node when we generate a transaction
    /// which we will sign for the remote node.
    fn ln_to_local(
        amount: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self;

    fn ln_to_remote(amount: u64, remote_pubkey: PublicKey) -> Self;

    /// HTLC offered by the commitment owner, whose key is
    /// `local_htlcpubkey`
    fn ln_offered_htlc(
        amount: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: sha256::Hash,
    ) -> Self;

    /// HTLC received by the commitment owner, whose key is
    /// `local_htlcpubkey`
    fn ln_received_htlc(
        amount: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        cltv_expiry: u32,
        payment_hash: sha256::Hash,
    ) -> Self;

    /// Output of the second-level HTLC-timeout and HTLC-success transactions
    fn ln_htlc_output(
        amount: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self;
}

impl ScriptGenerators for Script {
    fn ln_funding(
        _: u64,
        local_pubkey: PublicKey,
        remote_pubkey: PublicKey,
    ) -> Self {
        let mut pk = [local_pubkey, remote_pubkey];
        pk.sort_by_key(PublicKey::serialize);

        script::Builder::new()
            .push_int(2)
            .push_key(&btc_key(pk[0]))
            .push_key(&btc_key(pk[1]))
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script()
    }

    fn ln_to_local(
        _: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        script::Builder::new()
            .push_opcode(OP_IF)
            .push_key(&btc_key(revocationpubkey))
            .push_opcode(OP_ELSE)
            .push_int(to_self_delay as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_key(&btc_key(local_delayedpubkey))
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    fn ln_to_remote(_: u64, remote_pubkey: PublicKey) -> Self {
        Script::new_p2pkh(&pubkey_hash(remote_pubkey))
    }

    fn ln_offered_htlc(
        _: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: sha256::Hash,
    ) -> Self {
        script::Builder::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(&pubkey_hash(revocationpubkey)[..])
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_key(&btc_key(remote_htlcpubkey))
            .push_opcode(OP_SWAP)
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_NOTIF)
            .push_opcode(OP_DROP)
            .push_int(2)
            .push_opcode(OP_SWAP)
            .push_key(&btc_key(local_htlcpubkey))
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_HASH160)
            .push_slice(&ripemd160::Hash::hash(&payment_hash[..])[..])
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_ENDIF)
            .into_script()
    }

    fn ln_received_htlc(
        _: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        cltv_expiry: u32,
        payment_hash: sha256::Hash,
    ) -> Self {
        script::Builder::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(&pubkey_hash(revocationpubkey)[..])
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_key(&btc_key(remote_htlcpubkey))
            .push_opcode(OP_SWAP)
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_HASH160)
            .push_slice(&ripemd160::Hash::hash(&payment_hash[..])[..])
            .push_opcode(OP_EQUALVERIFY)
            .push_int(2)
            .push_opcode(OP_SWAP)
            .push_key(&btc_key(local_htlcpubkey))
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_DROP)
            .push_int(cltv_expiry as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_ENDIF)
            .into_script()
    }

    #[inline]
    fn ln_htlc_output(
        amount: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        Script::ln_to_local(
            amount,
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        )
    }
}

impl ScriptGenerators for TxOut {
    #[inline]
    fn ln_funding(
        amount: u64,
        local_pubkey: PublicKey,
        remote_pubkey: PublicKey,
    ) -> Self {
        TxOut {
            value: amount,
            script_pubkey: Script::ln_funding(
                amount,
                local_pubkey,
                remote_pubkey,
            )
            .to_v0_p2wsh(),
        }
    }

    #[inline]
    fn ln_to_local(
        amount: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        TxOut {
            value: amount,
            script_pubkey: Script::ln_to_local(
                amount,
                revocationpubkey,
                local_delayedpubkey,
                to_self_delay,
            )
            .to_v0_p2wsh(),
        }
    }

    #[inline]
    fn ln_to_remote(amount: u64, remote_pubkey: PublicKey) -> Self {
        TxOut {
            value: amount,
            script_pubkey: Script::new_v0_p2wpkh(&WPubkeyHash::hash(
                &remote_pubkey.serialize(),
            )),
        }
    }

    #[inline]
    fn ln_offered_htlc(
        amount: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: sha256::Hash,
    ) -> Self {
        TxOut {
            value: amount,
            script_pubkey: Script::ln_offered_htlc(
                amount,
                revocationpubkey,
                local_htlcpubkey,
                remote_htlcpubkey,
                payment_hash,
            )
            .to_v0_p2wsh(),
        }
    }

    #[inline]
    fn ln_received_htlc(
        amount: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        cltv_expiry: u32,
        payment_hash: sha256::Hash,
    ) -> Self {
        TxOut {
            value: amount,
            script_pubkey: Script::ln_received_htlc(
                amount,
                revocationpubkey,
                local_htlcpubkey,
                remote_htlcpubkey,
                cltv_expiry,
                payment_hash,
            )
            .to_v0_p2wsh(),
        }
    }

    #[inline]
    fn ln_htlc_output(
        amount: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        TxOut::ln_to_local(
            amount,
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        )
    }
}

/// Builds the funding witness script from serialized keys, as they come
/// from the wire or from storage; rejects keys which are not valid
/// compressed points.
pub fn funding_script_from_slices(
    local_pubkey: &[u8],
    remote_pubkey: &[u8],
) -> Result<Script, ScriptError> {
    Ok(Script::ln_funding(
        0,
        pubkey_from_slice(local_pubkey, "local_funding_pubkey")?,
        pubkey_from_slice(remote_pubkey, "remote_funding_pubkey")?,
    ))
}

/// Builds the `to_local` witness script from serialized keys, for callers
/// (watchtowers for instance) which hold the keys in raw form
pub fn to_local_script_from_slices(
    revocationpubkey: &[u8],
    local_delayedpubkey: &[u8],
    to_self_delay: u16,
) -> Result<Script, ScriptError> {
    Ok(Script::ln_to_local(
        0,
        pubkey_from_slice(revocationpubkey, "revocationpubkey")?,
        pubkey_from_slice(local_delayedpubkey, "local_delayedpubkey")?,
        to_self_delay,
    ))
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::hashes::hex::FromHex;

    use super::*;

    macro_rules! pk {
        ($hex:expr) => {
            PublicKey::from_str($hex).unwrap()
        };
    }

    macro_rules! script {
        ($hex:expr) => {
            Script::from(Vec::<u8>::from_hex($hex).unwrap())
        };
    }

    fn revocationpubkey() -> PublicKey {
        pk!("0212a140cd0c6539d07cd08dfe09984dec3251ea808b892efeac3ede9402bf2b19")
    }
    fn local_htlcpubkey() -> PublicKey {
        pk!("030d417a46946384f88d5f3337267c5e579765875dc4daca813e21734b140639e7")
    }
    fn remote_htlcpubkey() -> PublicKey {
        pk!("0394854aa6eab5b2a8122cc726e9dded053a2184d88256816826d6231c068d4a5b")
    }

    #[test]
    fn bolt3_funding_witness_script() {
        let local = pk!(
            "023da092f6980e58d2c037173180e9a465476026ee50f96695963e8efe436f54eb"
        );
        let remote = pk!(
            "030e9f7b623d2ccc7c9bd44d66d5ce21ce504c0acf6385a132cec6d3c39fa711c1"
        );
        let expected = script!("5221023da092f6980e58d2c037173180e9a465476026ee50f96695963e8efe436f54eb21030e9f7b623d2ccc7c9bd44d66d5ce21ce504c0acf6385a132cec6d3c39fa711c152ae");
        assert_eq!(Script::ln_funding(0, local, remote), expected);
        assert_eq!(Script::ln_funding(0, remote, local), expected);
        assert_eq!(
            TxOut::ln_funding(10_000_000, local, remote).script_pubkey,
            script!("0020c015c4a6be010e21657068fc2e6a9d02b27ebe4d490a25846f7237f104d1a3cd")
        );
    }

    #[test]
    fn bolt3_to_local() {
        let txout = TxOut::ln_to_local(
            6_989_140,
            revocationpubkey(),
            pk!("03fd5960528dc152014952efdb702a88f71e3c1653b2314431701ec77e57fde83c"),
            144,
        );
        assert_eq!(
            txout.script_pubkey,
            script!("00204adb4e2f00643db396dd120d4e7dc17625f5f2c11a40d857accc862d6b7dd80e")
        );
        assert_eq!(txout.value, 6_989_140);
    }

    #[test]
    fn bolt3_to_remote() {
        let txout = TxOut::ln_to_remote(3_000_000, remote_htlcpubkey());
        assert_eq!(
            txout.script_pubkey,
            script!("0014ccf1af2f2aabee14bb40fa3851ab2301de843110")
        );
        assert_eq!(
            Script::ln_to_remote(0, remote_htlcpubkey()),
            script!("76a914ccf1af2f2aabee14bb40fa3851ab2301de84311088ac")
        );
    }

    #[test]
    fn bolt3_offered_htlc() {
        let payment_hash = sha256::Hash::hash(&[2u8; 32]);
        assert_eq!(
            Script::ln_offered_htlc(
                2_000_000,
                revocationpubkey(),
                local_htlcpubkey(),
                remote_htlcpubkey(),
                payment_hash
            ),
            script!("76a91414011f7254d96b819c76986c277d115efce6f7b58763ac67210394854aa6eab5b2a8122cc726e9dded053a2184d88256816826d6231c068d4a5b7c820120876475527c21030d417a46946384f88d5f3337267c5e579765875dc4daca813e21734b140639e752ae67a914b43e1b38138a41b37f7cd9a1d274bc63e3a9b5d188ac6868")
        );
    }

    #[test]
    fn bolt3_received_htlc() {
        let payment_hash = sha256::Hash::hash(&[0u8; 32]);
        let witness_script = Script::ln_received_htlc(
            1000,
            revocationpubkey(),
            local_htlcpubkey(),
            remote_htlcpubkey(),
            500,
            payment_hash,
        );
        assert_eq!(
            witness_script,
            script!("76a91414011f7254d96b819c76986c277d115efce6f7b58763ac67210394854aa6eab5b2a8122cc726e9dded053a2184d88256816826d6231c068d4a5b7c8201208763a914b8bcb07f6344b42ab04250c86a6e8b75d3fdbbc688527c21030d417a46946384f88d5f3337267c5e579765875dc4daca813e21734b140639e752ae677502f401b175ac6868")
        );
        let txout = TxOut::ln_received_htlc(
            1000,
            revocationpubkey(),
            local_htlcpubkey(),
            remote_htlcpubkey(),
            500,
            payment_hash,
        );
        assert_eq!(txout.script_pubkey, witness_script.to_v0_p2wsh());
        assert_eq!(
            txout.script_pubkey,
            script!("002052bfef0479d7b293c27e0f1eb294bea154c63a3294ef092c19af51409bce0e2a")
        );
    }

    #[test]
    fn raw_keys() {
        let revocation = revocationpubkey().serialize();
        let delayed = local_htlcpubkey().serialize();
        assert!(to_local_script_from_slices(&revocation, &delayed, 144).is_ok());
        assert_eq!(
            to_local_script_from_slices(&revocation, &[0x05; 33], 144),
            Err(ScriptError::InvalidKeyEncoding("local_delayedpubkey"))
        );
        assert_eq!(
            funding_script_from_slices(&[], &delayed),
            Err(ScriptError::InvalidKeyEncoding("local_funding_pubkey"))
        );
    }
}
