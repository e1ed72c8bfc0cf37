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

//! BOLT-3 per-commitment key derivation.
//!
//! All functions here are pure: they depend only on their arguments and use
//! the global verification context, so they can be called from any thread.

use bitcoin::hashes::{sha256, Hash, HashEngine};
use secp256k1::{PublicKey, Scalar, SecretKey, SECP256K1};

/// Computes `SHA256(a || b)` over the compressed serialization of two points
fn point_hash(a: &PublicKey, b: &PublicKey) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(&a.serialize());
    engine.input(&b.serialize());
    sha256::Hash::from_engine(engine).into_inner()
}

fn scalar(bytes: [u8; 32]) -> Scalar {
    Scalar::from_be_bytes(bytes).expect("negligible probability")
}

/// Tweak used to derive per-commitment keys from a base point:
/// `SHA256(per_commitment_point || basepoint)`
#[inline]
pub fn single_tweak(
    per_commitment_point: &PublicKey,
    basepoint: &PublicKey,
) -> [u8; 32] {
    point_hash(per_commitment_point, basepoint)
}

/// Derives `basepoint + SHA256(per_commitment_point || basepoint)·G`, i.e.
/// `localpubkey`, `remotepubkey`, `local_htlcpubkey`, `remote_htlcpubkey`,
/// `local_delayedpubkey` and `remote_delayedpubkey` from BOLT-3.
pub fn tweak_pubkey(
    basepoint: &PublicKey,
    per_commitment_point: &PublicKey,
) -> PublicKey {
    let tweak = single_tweak(per_commitment_point, basepoint);
    tweak_pubkey_with_tweak(basepoint, &tweak)
}

/// Adds an already computed tweak to the base point
pub fn tweak_pubkey_with_tweak(
    basepoint: &PublicKey,
    tweak: &[u8; 32],
) -> PublicKey {
    basepoint
        .add_exp_tweak(SECP256K1, &scalar(*tweak))
        .expect("negligible probability")
}

/// Private counterpart of [`tweak_pubkey`]: `basepoint_secret + tweak`
pub fn tweak_privkey(
    basepoint_secret: &SecretKey,
    tweak: &[u8; 32],
) -> SecretKey {
    basepoint_secret
        .add_tweak(&scalar(*tweak))
        .expect("negligible probability")
}

/// Derives BOLT-3 `revocationpubkey`:
/// `revocation_basepoint·SHA256(revocation_basepoint || per_commitment_point)
///  + per_commitment_point·SHA256(per_commitment_point ||
///  revocation_basepoint)`
pub fn derive_revocation_pubkey(
    revocation_basepoint: &PublicKey,
    per_commitment_point: &PublicKey,
) -> PublicKey {
    let revocation_tweak =
        point_hash(revocation_basepoint, per_commitment_point);
    let per_commitment_tweak =
        point_hash(per_commitment_point, revocation_basepoint);

    let tweaked_revocation_basepoint = revocation_basepoint
        .mul_tweak(SECP256K1, &scalar(revocation_tweak))
        .expect("negligible probability");
    let tweaked_per_commitment_point = per_commitment_point
        .mul_tweak(SECP256K1, &scalar(per_commitment_tweak))
        .expect("negligible probability");

    tweaked_revocation_basepoint
        .combine(&tweaked_per_commitment_point)
        .expect("negligible probability")
}

/// Derives the private key for `revocationpubkey`. Requires both the
/// revocation basepoint secret and the per-commitment secret, so it becomes
/// computable only once the counterparty revealed the latter.
pub fn derive_revocation_privkey(
    revocation_basepoint_secret: &SecretKey,
    per_commitment_secret: &SecretKey,
) -> SecretKey {
    let revocation_basepoint =
        PublicKey::from_secret_key(SECP256K1, revocation_basepoint_secret);
    let per_commitment_point =
        PublicKey::from_secret_key(SECP256K1, per_commitment_secret);

    let revocation_tweak =
        point_hash(&revocation_basepoint, &per_commitment_point);
    let per_commitment_tweak =
        point_hash(&per_commitment_point, &revocation_basepoint);

    let revocation_part = revocation_basepoint_secret
        .mul_tweak(&scalar(revocation_tweak))
        .expect("negligible probability");
    let per_commitment_part = per_commitment_secret
        .mul_tweak(&scalar(per_commitment_tweak))
        .expect("negligible probability");

    revocation_part
        .add_tweak(&Scalar::from(per_commitment_part))
        .expect("negligible probability")
}

/// Converts a per-commitment secret into the per-commitment point
pub fn commit_point_from_secret(
    per_commitment_secret: &[u8; 32],
) -> Result<PublicKey, secp256k1::Error> {
    let secret = SecretKey::from_slice(per_commitment_secret)?;
    Ok(PublicKey::from_secret_key(SECP256K1, &secret))
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
    macro_rules! sk {
        ($hex:expr) => {
            SecretKey::from_str($hex).unwrap()
        };
    }

    const BASE_SECRET: &str =
        "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const PER_COMMITMENT_SECRET: &str =
        "1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100";
    const BASE_POINT: &str =
        "036d6caac248af96f6afa7f904f550253a0f3ef3f5aa2fe6838a95b216691468e2";
    const PER_COMMITMENT_POINT: &str =
        "025f7117a78150fe2ef97db7cfc83bd57b2e2c0d0dd25eaf467a4a1c2a45ce1486";

    #[test]
    fn bolt3_points_from_secrets() {
        let base_secret = sk!(BASE_SECRET);
        assert_eq!(
            PublicKey::from_secret_key(SECP256K1, &base_secret),
            pk!(BASE_POINT)
        );
        let secret = <[u8; 32]>::from_hex(PER_COMMITMENT_SECRET).unwrap();
        assert_eq!(
            commit_point_from_secret(&secret).unwrap(),
            pk!(PER_COMMITMENT_POINT)
        );
        assert!(commit_point_from_secret(&[0u8; 32]).is_err());
    }

    #[test]
    fn bolt3_localkey_derivation() {
        let localpubkey =
            tweak_pubkey(&pk!(BASE_POINT), &pk!(PER_COMMITMENT_POINT));
        assert_eq!(
            localpubkey,
            pk!("0235f2dbfaa89b57ec7b055afe29849ef7ddfeb1cefdb9ebdc43f5494984db29e5")
        );
        // Re-derivation is idempotent
        assert_eq!(
            localpubkey,
            tweak_pubkey(&pk!(BASE_POINT), &pk!(PER_COMMITMENT_POINT))
        );

        let tweak = single_tweak(&pk!(PER_COMMITMENT_POINT), &pk!(BASE_POINT));
        let localprivkey = tweak_privkey(&sk!(BASE_SECRET), &tweak);
        assert_eq!(
            PublicKey::from_secret_key(SECP256K1, &localprivkey),
            localpubkey
        );
        assert_eq!(
            localprivkey,
            sk!("cbced912d3b21bf196a766651e436aff192362621ce317704ea2f75d87e7be0f")
        );
    }

    #[test]
    fn bolt3_payment_key_derivation() {
        let commit_point = pk!(PER_COMMITMENT_POINT);
        assert_eq!(
            tweak_pubkey(
                &pk!("034f355bdcb7cc0af728ef3cceb9615d90684bb5b2ca5f859ab0f0b704075871aa"),
                &commit_point
            ),
            pk!("030d417a46946384f88d5f3337267c5e579765875dc4daca813e21734b140639e7")
        );
        assert_eq!(
            tweak_pubkey(
                &pk!("032c0b7cf95324a07d05398b240174dc0c2be444d96b159aa6c7f7b1e668680991"),
                &commit_point
            ),
            pk!("0394854aa6eab5b2a8122cc726e9dded053a2184d88256816826d6231c068d4a5b")
        );
    }

    #[test]
    fn bolt3_revocationkey_derivation() {
        let expected = pk!("02916e326636d19c33f13e8c0c3a03dd157f332f3e99c317c141dd865eb01f8ff0");
        // Each party computes the key on its own
        let ours =
            derive_revocation_pubkey(&pk!(BASE_POINT), &pk!(PER_COMMITMENT_POINT));
        let theirs = derive_revocation_pubkey(
            &PublicKey::from_secret_key(SECP256K1, &sk!(BASE_SECRET)),
            &commit_point_from_secret(
                &<[u8; 32]>::from_hex(PER_COMMITMENT_SECRET).unwrap(),
            )
            .unwrap(),
        );
        assert_eq!(ours, expected);
        assert_eq!(theirs, expected);

        let privkey = derive_revocation_privkey(
            &sk!(BASE_SECRET),
            &sk!(PER_COMMITMENT_SECRET),
        );
        assert_eq!(PublicKey::from_secret_key(SECP256K1, &privkey), expected);
        assert_eq!(
            privkey,
            sk!("d09ffff62ddb2297ab000cc85bcb4283fdeb6aa052affbc9dddcf33b61078110")
        );
    }

    #[test]
    fn wrong_point_gives_other_key() {
        let other_point = pk!("0394854aa6eab5b2a8122cc726e9dded053a2184d88256816826d6231c068d4a5b");
        assert_ne!(
            derive_revocation_pubkey(&pk!(BASE_POINT), &other_point),
            derive_revocation_pubkey(&pk!(BASE_POINT), &pk!(PER_COMMITMENT_POINT))
        );
    }
}
