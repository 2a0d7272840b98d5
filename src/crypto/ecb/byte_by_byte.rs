use std::collections::HashMap;

use log::{debug, info, trace};
use rayon::prelude::*;
use snafu::{ensure, OptionExt};

use crate::crypto::common::{block_at, is_valid_pkcs_7, strip_pad_pkcs_7};
use crate::crypto::oracle::Oracle;
use crate::crypto::probe::{discover_block_size, discover_prefix_length, BlockSizeInfo, FILLER};
use crate::util::{
    InvalidBlockSizeSnafu, NoTableMatchSnafu, ResponseTooShortSnafu, Result, SecretNotTerminatedSnafu,
};
#[cfg(test)]
use crate::crypto::cipher::{random_cipher, Aes128};
#[cfg(test)]
use crate::crypto::ecb::encrypt_ecb;
#[cfg(test)]
use crate::crypto::oracle::{EncryptionOracle, Mode, OracleBuilder};
#[cfg(test)]
use crate::util::{b64_to_bytes, Error};
#[cfg(test)]
use rand::{rngs::StdRng, Rng, SeedableRng};
#[cfg(test)]
use rstest::rstest;

// Ciphertext block -> the candidate byte that produced it. Collisions keep the
// lowest candidate, same as an ascending sequential scan.
fn build_table(
    oracle: &dyn Oracle,
    filler: &[u8],
    known: &[u8],
    offset: usize,
    block_size: usize,
) -> Result<HashMap<Vec<u8>, u8>> {
    let entries = (0..=u8::MAX)
        .into_par_iter()
        .map(|candidate| -> Result<(Vec<u8>, u8)> {
            let payload = [filler, known, &[candidate][..]].concat();
            let response = oracle.encrypt(&payload)?;
            Ok((block_at(&response, offset, block_size)?.to_vec(), candidate))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut table = HashMap::with_capacity(entries.len());
    for (block, candidate) in entries {
        table.entry(block).or_insert(candidate);
    }
    Ok(table)
}

// The oracle must not put anything in front of the attacker's input; see
// recover_suffix_with_prefix for that case
pub fn recover_suffix(oracle: &dyn Oracle, info: &BlockSizeInfo) -> Result<Vec<u8>> {
    let block_size = info.block_size;
    ensure!(block_size > 0, InvalidBlockSizeSnafu { block_size });
    let hidden_len = info.hidden_len()?;

    let mut known: Vec<u8> = Vec::with_capacity(hidden_len + 1);
    // One byte past the secret is the first padding byte, so this bounds the loop
    while known.len() <= hidden_len {
        let filler = vec![FILLER; block_size - 1 - known.len() % block_size];
        let offset = block_size * (known.len() / block_size);

        let response = oracle.encrypt(&filler)?;
        let target = block_at(&response, offset, block_size)?;
        trace!("target block at {}: {}", offset, hex::encode(target));

        let table = build_table(oracle, &filler, &known, offset, block_size)?;
        let byte = *table.get(target).context(NoTableMatchSnafu { position: known.len() })?;
        known.push(byte);
        debug!("recovered byte {}: {:#04x}", known.len() - 1, byte);

        // A literal 0x01 inside the secret is valid padding too
        if known.len() > hidden_len && is_valid_pkcs_7(&known, block_size) {
            let secret = strip_pad_pkcs_7(&known);
            info!("recovered {} byte suffix", secret.len());
            return Ok(secret);
        }
    }
    SecretNotTerminatedSnafu { recovered: known.len() }.fail()
}

// Discover the block size and the prefix, then attack through an adaptor that
// pushes the attacker input onto a block boundary and cuts the prefix off
pub fn recover_suffix_with_prefix(oracle: &dyn Oracle) -> Result<Vec<u8>> {
    let block_size = discover_block_size(oracle)?.block_size;
    let prefix_len = discover_prefix_length(oracle, block_size)?;
    let align = (block_size - prefix_len % block_size) % block_size;
    let skip = prefix_len + align;
    debug!("aligning {} byte prefix with {} filler bytes", prefix_len, align);

    let aligned = |input: &[u8]| -> Result<Vec<u8>> {
        let response = oracle.encrypt(&[vec![FILLER; align].as_slice(), input].concat())?;
        ensure!(response.len() >= skip, ResponseTooShortSnafu { len: response.len(), needed: skip });
        Ok(response[skip..].to_vec())
    };

    let info = discover_block_size(&aligned)?;
    recover_suffix(&aligned, &info)
}

#[cfg(test)]
const SECRET: &str = "Um9sbGluJyBpbiBteSA1LjAKV2l0aCBteSByYWctdG9wIGRvd24gc28gbXkgaGFpciBjYW4gYmxvdwpUaGUgZ2lybGllcyBvbiBzdGFuZGJ5IHdhdmluZyBqdXN0IHRvIHNheSBoaQpEaWQgeW91IHN0b3A/IE5vLCBJIGp1c3QgZHJvdmUgYnkK";
#[cfg(test)]
const EXPECTED: &[u8] = b"Rollin' in my 5.0\nWith my rag-top down so my hair can blow\nThe girlies on standby waving just to say hi\nDid you stop? No, I just drove by\n";

#[cfg(test)]
#[rstest]
#[case(16)]
#[case(8)]
fn test_recover_suffix_no_prefix(#[case] block_size: usize) {
    let mut rng = StdRng::seed_from_u64(12);
    let secret = b64_to_bytes(SECRET).unwrap();
    let oracle = EncryptionOracle::ecb_suffix(random_cipher(block_size, &mut rng), &secret);

    let info = discover_block_size(&oracle).unwrap();
    assert_eq!(block_size, info.block_size);
    let result = recover_suffix(&oracle, &info).unwrap();
    assert_eq!(EXPECTED.to_vec(), result);
    assert!(oracle.verify_suffix(&result));
}

#[cfg(test)]
#[rstest]
#[case(16, 0)]
#[case(16, 7)]
#[case(16, 37)]
#[case(8, 3)]
#[case(8, 19)]
fn test_recover_suffix_with_prefix(#[case] block_size: usize, #[case] prefix_len: usize) {
    let mut rng = StdRng::seed_from_u64(prefix_len as u64);
    let mut prefix = vec![0u8; prefix_len];
    rng.fill(prefix.as_mut_slice());
    let secret = b64_to_bytes(SECRET).unwrap();
    let oracle = OracleBuilder::default()
        .pullback_add_left_padding(&prefix)
        .pullback_add_right_padding(&secret)
        .pushforward_ecb(random_cipher(block_size, &mut rng));

    assert_eq!(EXPECTED.to_vec(), recover_suffix_with_prefix(&oracle).unwrap());
}

#[test]
fn test_recover_suffix_random_prefixes() {
    let mut rng = StdRng::seed_from_u64(14);
    let secret = b64_to_bytes(SECRET).unwrap();
    for _ in 0..5 {
        let oracle = EncryptionOracle::ecb_suffix_with_random_prefix::<0, 100>(
            Box::new(Aes128::random(&mut rng)),
            &secret,
            &mut rng,
        );
        assert_eq!(EXPECTED.to_vec(), recover_suffix_with_prefix(&oracle).unwrap());
    }
}

#[cfg(test)]
#[rstest]
#[case(b"odd\x01")]
#[case(b"\x02\x02 then more")]
#[case(b"")]
#[case(b"exactly sixteen!")]
fn test_recover_suffix_past_padding_lookalikes(#[case] secret: &[u8]) {
    let mut rng = StdRng::seed_from_u64(15);
    let oracle = EncryptionOracle::ecb_suffix(Box::new(Aes128::random(&mut rng)), secret);
    let info = discover_block_size(&oracle).unwrap();
    assert_eq!(secret.to_vec(), recover_suffix(&oracle, &info).unwrap());
}

#[test]
fn test_recover_suffix_refuses_cbc() {
    let mut rng = StdRng::seed_from_u64(16);
    let oracle = OracleBuilder::default()
        .pullback_add_right_padding(b"not recoverable")
        .pushforward_cbc(Box::new(Aes128::random(&mut rng)), &mut rng);
    assert_eq!(Mode::Cbc, oracle.mode());

    let info = discover_block_size(&oracle).unwrap();
    assert!(matches!(
        recover_suffix(&oracle, &info),
        Err(Error::NoTableMatch { position: 0 })
    ));
}

#[test]
fn test_recover_suffix_rejects_echo_oracle() {
    let identity = |buf: &[u8]| -> Result<Vec<u8>> { Ok(buf.to_vec()) };
    let info = discover_block_size(&identity).unwrap();
    assert!(matches!(
        recover_suffix(&identity, &info),
        Err(Error::OracleNotPadding { .. })
    ));
    assert!(matches!(
        recover_suffix_with_prefix(&identity),
        Err(Error::OracleNotPadding { .. })
    ));
}

#[test]
fn test_build_table_keeps_lowest_colliding_candidate() {
    // Every candidate from 5 up encrypts to the same block
    let clamped = |buf: &[u8]| -> Result<Vec<u8>> {
        let last = buf.last().copied().unwrap_or(0);
        Ok(vec![last.min(5); 4])
    };
    for _ in 0..20 {
        let table = build_table(&clamped, b"", b"", 0, 4).unwrap();
        assert_eq!(6, table.len());
        assert_eq!(Some(&5), table.get(&vec![5u8; 4]));
        assert_eq!(Some(&2), table.get(&vec![2u8; 4]));
    }
}

#[test]
fn test_recover_suffix_prefers_lowest_colliding_byte() {
    let mut rng = StdRng::seed_from_u64(20);
    let cipher = Aes128::random(&mut rng);
    let secret = b"seven bit secret, spread over two blocks";
    // Dropping the top bit of attacker bytes makes c and c | 0x80 collide
    let lossy = |buf: &[u8]| -> Result<Vec<u8>> {
        let masked: Vec<u8> = buf.iter().map(|b| b & 0x7f).collect();
        encrypt_ecb(&cipher, &[masked.as_slice(), &secret[..]].concat())
    };
    let info = discover_block_size(&lossy).unwrap();
    assert_eq!(secret.to_vec(), recover_suffix(&lossy, &info).unwrap());
}
