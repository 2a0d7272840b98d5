use snafu::ensure;

pub mod bitflip;
pub mod padding;

use crate::crypto::cipher::BlockCipher;
use crate::crypto::common::{pad_pkcs_7, strip_pad_pkcs_7};
use crate::crypto::xor::fixed_xor;
use crate::util::{InvalidLengthSnafu, Result};
#[cfg(test)]
use crate::crypto::cipher::{Aes128, TripleDes};
#[cfg(test)]
use crate::crypto::ecb::encrypt_ecb;
#[cfg(test)]
use crate::util::Error;
#[cfg(test)]
use rand::{rngs::StdRng, Rng, SeedableRng};

pub fn encrypt_cbc(cipher: &dyn BlockCipher, plaintext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    let block_size = cipher.block_size();
    ensure!(iv.len() == block_size, InvalidLengthSnafu { len: iv.len(), block_size });

    let padded = pad_pkcs_7(plaintext, block_size)?;
    let mut out = Vec::with_capacity(padded.len());
    let mut prev = iv.to_vec();
    for block in padded.chunks(block_size) {
        prev = cipher.encrypt_block(&fixed_xor(block, &prev))?;
        out.extend_from_slice(&prev);
    }
    Ok(out)
}

// Chaining only: the caller decides what to do with the padding
pub fn decrypt_cbc_blocks(cipher: &dyn BlockCipher, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    let block_size = cipher.block_size();
    ensure!(iv.len() == block_size, InvalidLengthSnafu { len: iv.len(), block_size });
    ensure!(
        ciphertext.len() % block_size == 0,
        InvalidLengthSnafu { len: ciphertext.len(), block_size }
    );

    let decrypted = cipher.decrypt_blocks(ciphertext)?;
    let prevs = iv.chunks(block_size).chain(ciphertext.chunks(block_size));
    Ok(decrypted.chunks(block_size)
        .zip(prevs)
        .flat_map(|(block, prev)| fixed_xor(block, prev))
        .collect())
}

pub fn decrypt_cbc(cipher: &dyn BlockCipher, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    let decrypted = decrypt_cbc_blocks(cipher, ciphertext, iv)?;
    Ok(strip_pad_pkcs_7(&decrypted))
}

#[test]
fn test_cbc_first_block_matches_ecb_of_xor() {
    let cipher = Aes128::new(b"YELLOW SUBMARINE").unwrap();
    let iv = b"yellow submarine";
    let plaintext = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let ciphertext = encrypt_cbc(&cipher, plaintext, iv).unwrap();
    assert_eq!(64, ciphertext.len());

    let first = cipher.encrypt_block(&fixed_xor(&plaintext[..16], iv)).unwrap();
    assert_eq!(first, ciphertext[..16].to_vec());
    assert_eq!(plaintext.to_vec(), decrypt_cbc(&cipher, &ciphertext, iv).unwrap());
}

#[test]
fn test_cbc_hides_repeated_blocks() {
    let cipher = Aes128::new(b"YELLOW SUBMARINE").unwrap();
    let ciphertext = encrypt_cbc(&cipher, &[b'A'; 48], &[0u8; 16]).unwrap();
    let ecb = encrypt_ecb(&cipher, &[b'A'; 48]).unwrap();
    assert_ne!(ciphertext[16..32], ciphertext[32..48]);
    assert_eq!(ecb[16..32], ecb[32..48]);
}

#[test]
fn test_cbc_round_trip_random_lengths() {
    let mut rng = StdRng::seed_from_u64(11);
    let aes = Aes128::random(&mut rng);
    let des = TripleDes::random(&mut rng);
    for _ in 0..40 {
        let len = rng.gen_range(0..=1000);
        let mut plaintext = vec![0u8; len];
        rng.fill(plaintext.as_mut_slice());
        for cipher in [&aes as &dyn BlockCipher, &des] {
            let mut iv = vec![0u8; cipher.block_size()];
            rng.fill(iv.as_mut_slice());
            let ciphertext = encrypt_cbc(cipher, &plaintext, &iv).unwrap();
            assert_eq!(plaintext, decrypt_cbc(cipher, &ciphertext, &iv).unwrap());
        }
    }
}

#[test]
fn test_cbc_contract_violations() {
    let cipher = Aes128::new(b"YELLOW SUBMARINE").unwrap();
    assert!(matches!(
        decrypt_cbc(&cipher, &[0u8; 33], &[0u8; 16]),
        Err(Error::InvalidLength { len: 33, .. })
    ));
    assert!(matches!(
        encrypt_cbc(&cipher, b"data", &[0u8; 8]),
        Err(Error::InvalidLength { len: 8, .. })
    ));
}
