use crate::crypto::cipher::BlockCipher;
use crate::crypto::common::{pad_pkcs_7, strip_pad_pkcs_7};
use crate::util::Result;
#[cfg(test)]
use crate::crypto::cipher::{Aes128, TripleDes};
#[cfg(test)]
use crate::util::Error;
#[cfg(test)]
use rand::{rngs::StdRng, Rng, SeedableRng};

pub mod byte_by_byte;
pub mod cut_and_paste;

pub fn encrypt_ecb(cipher: &dyn BlockCipher, plaintext: &[u8]) -> Result<Vec<u8>> {
    let padded = pad_pkcs_7(plaintext, cipher.block_size())?;
    cipher.encrypt_blocks(&padded)
}

pub fn decrypt_ecb(cipher: &dyn BlockCipher, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let decrypted = cipher.decrypt_blocks(ciphertext)?;
    Ok(strip_pad_pkcs_7(&decrypted))
}

#[test]
fn test_aes_ecb_identical_blocks_repeat() {
    let cipher = Aes128::new(b"YELLOW SUBMARINE").unwrap();
    let ciphertext = encrypt_ecb(&cipher, &[b'A'; 32]).unwrap();
    assert_eq!(48, ciphertext.len());
    assert_eq!(ciphertext[0..16], ciphertext[16..32]);
    assert_ne!(ciphertext[16..32], ciphertext[32..48]);
}

#[test]
fn test_ecb_round_trip_random_lengths() {
    let mut rng = StdRng::seed_from_u64(10);
    let aes = Aes128::random(&mut rng);
    let des = TripleDes::random(&mut rng);
    for _ in 0..40 {
        let len = rng.gen_range(0..=1000);
        let mut plaintext = vec![0u8; len];
        rng.fill(plaintext.as_mut_slice());
        for cipher in [&aes as &dyn BlockCipher, &des] {
            let ciphertext = encrypt_ecb(cipher, &plaintext).unwrap();
            assert_eq!(0, ciphertext.len() % cipher.block_size());
            assert_eq!(plaintext, decrypt_ecb(cipher, &ciphertext).unwrap());
        }
    }
}

#[test]
fn test_decrypt_ecb_rejects_partial_block() {
    let cipher = Aes128::new(b"YELLOW SUBMARINE").unwrap();
    let result = decrypt_ecb(&cipher, &[0u8; 20]);
    assert!(matches!(result, Err(Error::InvalidLength { len: 20, block_size: 16 })));
}
