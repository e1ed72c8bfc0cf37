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

//! Chain parameters for Bitcoin-derived networks.
//!
//! Parameters are explicit values passed to every component which needs them;
//! there is no process-wide network selection.

use bitcoin::blockdata::constants::genesis_block;
use bitcoin::{BlockHash, Network};

/// Fork id used by Bitcoin Gold replay-protected signatures
pub const FORKID_BTG: u32 = 79;

/// Flag added to the sighash type byte when signing with a fork id
pub const SIGHASH_FORKID: u8 = 0x40;

/// `SIGHASH_ALL` sighash type byte
pub const SIGHASH_ALL: u8 = 0x01;

/// Size of a P2WSH output script, in bytes
pub const P2WSH_SIZE: usize = 34;

/// Default minimum relay fee, in satoshis per kilobyte
pub const DEFAULT_RELAY_FEE_PER_KB: u64 = 1000;

/// Signature hashing algorithm used by a chain for segwit v0 inputs.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub enum SighashMode {
    /// BIP-143 with plain `SIGHASH_ALL`
    #[display("SIGHASH_ALL")]
    Standard,

    /// BIP-143 with `SIGHASH_ALL | SIGHASH_FORKID` and the fork id mixed into
    /// the upper bits of the committed hash type
    #[display("SIGHASH_ALL|FORKID({0})")]
    ForkId(u32),
}

impl SighashMode {
    /// Sighash type byte appended to DER-encoded signatures
    #[inline]
    pub fn sighash_byte(self) -> u8 {
        match self {
            SighashMode::Standard => SIGHASH_ALL,
            SighashMode::ForkId(_) => SIGHASH_ALL | SIGHASH_FORKID,
        }
    }

    /// Hash type value committed to by the signature hash preimage
    #[inline]
    pub fn preimage_hash_type(self) -> u32 {
        match self {
            SighashMode::Standard => SIGHASH_ALL as u32,
            SighashMode::ForkId(fork_id) => {
                (SIGHASH_ALL | SIGHASH_FORKID) as u32 | (fork_id << 8)
            }
        }
    }
}

/// Known chains
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub enum Chain {
    #[display("bitcoin")]
    Bitcoin,

    #[display("testnet")]
    BitcoinTestnet,

    #[display("regtest")]
    BitcoinRegtest,

    #[display("bitgold")]
    Bitgold,

    #[display("bitgold-regtest")]
    BitgoldRegtest,
}

/// Parameters of a Bitcoin-derived chain a channel resides within
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[display("{chain}")]
pub struct ChainParams {
    pub chain: Chain,

    /// Genesis block hash; used as the `chain_hash` identifying the chain in
    /// the Lightning protocol
    pub genesis_hash: BlockHash,

    /// Version byte for P2PKH addresses
    pub pubkey_address_prefix: u8,

    /// Version byte for P2SH addresses
    pub script_address_prefix: u8,

    /// Human-readable part for bech32 segwit addresses
    pub bech32_hrp: String,

    /// Sighash algorithm for segwit v0 inputs
    pub sighash: SighashMode,

    /// Dust limit used for channel outputs by default, in satoshis
    pub default_dust_limit: u64,
}

impl ChainParams {
    fn with(
        chain: Chain,
        network: Network,
        pubkey_address_prefix: u8,
        script_address_prefix: u8,
        bech32_hrp: &str,
        sighash: SighashMode,
    ) -> ChainParams {
        ChainParams {
            chain,
            genesis_hash: genesis_block(network).block_hash(),
            pubkey_address_prefix,
            script_address_prefix,
            bech32_hrp: bech32_hrp.to_owned(),
            sighash,
            default_dust_limit: default_dust_limit(),
        }
    }

    pub fn bitcoin_mainnet() -> ChainParams {
        ChainParams::with(
            Chain::Bitcoin,
            Network::Bitcoin,
            0,
            5,
            "bc",
            SighashMode::Standard,
        )
    }

    pub fn bitcoin_testnet() -> ChainParams {
        ChainParams::with(
            Chain::BitcoinTestnet,
            Network::Testnet,
            111,
            196,
            "tb",
            SighashMode::Standard,
        )
    }

    pub fn bitcoin_regtest() -> ChainParams {
        ChainParams::with(
            Chain::BitcoinRegtest,
            Network::Regtest,
            111,
            196,
            "bcrt",
            SighashMode::Standard,
        )
    }

    /// Bitcoin Gold shares Bitcoin history up to the fork, and so its genesis
    /// block.
    pub fn bitgold_mainnet() -> ChainParams {
        ChainParams::with(
            Chain::Bitgold,
            Network::Bitcoin,
            38,
            23,
            "btg",
            SighashMode::ForkId(FORKID_BTG),
        )
    }

    pub fn bitgold_regtest() -> ChainParams {
        ChainParams::with(
            Chain::BitgoldRegtest,
            Network::Regtest,
            111,
            196,
            "btgrt",
            SighashMode::ForkId(FORKID_BTG),
        )
    }

    /// Value used in the `chain_hash` fields of Lightning messages
    #[inline]
    pub fn chain_hash(&self) -> BlockHash {
        self.genesis_hash
    }
}

/// Computes the dust threshold for an output with a script of `script_size`
/// bytes under the given relay fee: the output is dust if spending it costs
/// more than a third of its value.
pub fn dust_threshold(script_size: usize, relay_fee_per_kb: u64) -> u64 {
    let varint_size = match script_size {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        _ => 5,
    };
    // value, script length prefix, script and a P2PKH input spending it
    let total_size = 8 + varint_size + script_size as u64 + 148;
    let byte_fee = relay_fee_per_kb / 1000;
    3 * total_size * byte_fee
}

/// Dust limit for P2WSH channel outputs under the default relay fee
#[inline]
pub fn default_dust_limit() -> u64 {
    dust_threshold(P2WSH_SIZE, DEFAULT_RELAY_FEE_PER_KB)
}
