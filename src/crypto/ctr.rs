use snafu::ensure;

use crate::crypto::cipher::BlockCipher;
use crate::crypto::xor::fixed_xor;
use crate::util::{InvalidBlockSizeSnafu, Result};
#[cfg(test)]
use crate::crypto::cipher::{Aes128, TripleDes};
#[cfg(test)]
use crate::util::{b64_to_bytes, Error};
#[cfg(test)]
use rand::{rngs::StdRng, Rng, SeedableRng};

// Counter block is nonce (64 bit LE) ++ block count (64 bit LE)
const CTR_BLOCK_SIZE: usize = 16;

fn counter_block(nonce: u64, counter: u64) -> Vec<u8> {
    [nonce.to_le_bytes(), counter.to_le_bytes()].concat()
}

// Encryption and decryption are the same operation. No padding; the last
// keystream block is cut to the length of the input.
pub fn apply_ctr(cipher: &dyn BlockCipher, nonce: u64, buf: &[u8]) -> Result<Vec<u8>> {
    let block_size = cipher.block_size();
    ensure!(block_size == CTR_BLOCK_SIZE, InvalidBlockSizeSnafu { block_size });

    let mut out = Vec::with_capacity(buf.len());
    for (counter, chunk) in buf.chunks(block_size).enumerate() {
        let keystream = cipher.encrypt_block(&counter_block(nonce, counter as u64))?;
        out.extend(fixed_xor(chunk, &keystream[..chunk.len()]));
    }
    Ok(out)
}

#[test]
fn test_apply_ctr_known_answer() {
    let ciphertext = b64_to_bytes("L77na/nrFsKvynd6HzOoG7GHTLXsTVu9qvY/2syLXzhPweyyMTJULu/6/kXX0KSvoOLSFQ==").unwrap();
    let cipher = Aes128::new(b"YELLOW SUBMARINE").unwrap();
    let expected = b"Yo, VIP Let's kick it Ice, Ice, baby Ice, Ice, baby ".to_vec();
    assert_eq!(expected, apply_ctr(&cipher, 0, &ciphertext).unwrap());
    assert_eq!(ciphertext, apply_ctr(&cipher, 0, &expected).unwrap());
}

#[test]
fn test_counter_block_layout() {
    assert_eq!(hex!("01000000000000000200000000000000").to_vec(), counter_block(1, 2));
}

#[test]
fn test_apply_ctr_round_trip_random_lengths() {
    let mut rng = StdRng::seed_from_u64(40);
    let cipher = Aes128::random(&mut rng);
    for _ in 0..20 {
        let nonce: u64 = rng.gen();
        let mut plaintext = vec![0u8; rng.gen_range(0..=200)];
        rng.fill(plaintext.as_mut_slice());
        let ciphertext = apply_ctr(&cipher, nonce, &plaintext).unwrap();
        assert_eq!(plaintext.len(), ciphertext.len());
        assert_eq!(plaintext, apply_ctr(&cipher, nonce, &ciphertext).unwrap());
    }
}

#[test]
fn test_apply_ctr_reused_nonce_leaks_xor() {
    let cipher = Aes128::new(b"YELLOW SUBMARINE").unwrap();
    let a = b"attack at dawn, bring snacks";
    let b = b"retreat at dusk, leave tents";
    let ca = apply_ctr(&cipher, 7, a).unwrap();
    let cb = apply_ctr(&cipher, 7, b).unwrap();
    assert_eq!(fixed_xor(a, b), fixed_xor(&ca, &cb));
    assert_ne!(ca, apply_ctr(&cipher, 8, a).unwrap());
}

#[test]
fn test_apply_ctr_needs_sixteen_byte_blocks() {
    let cipher = TripleDes::random(&mut StdRng::seed_from_u64(41));
    assert!(matches!(
        apply_ctr(&cipher, 0, b"data"),
        Err(Error::InvalidBlockSize { block_size: 8 })
    ));
}
