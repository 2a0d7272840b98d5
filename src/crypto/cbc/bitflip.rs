use std::sync::Mutex;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use snafu::ensure;

use crate::crypto::cbc::{decrypt_cbc, encrypt_cbc};
use crate::crypto::cipher::BlockCipher;
use crate::crypto::oracle::Oracle;
use crate::crypto::probe::FILLER;
use crate::crypto::xor::{fixed_xor, xor_in_place};
use crate::util::{CiphertextTooShortSnafu, InvalidBlockSizeSnafu, ResponseTooShortSnafu, Result};
#[cfg(test)]
use crate::crypto::cipher::{Aes128, TripleDes};
#[cfg(test)]
use crate::util::Error;

pub const COOKIE_PREFIX: &[u8] = b"comment1=cooking%20MCs;userdata=";
pub const COOKIE_SUFFIX: &[u8] = b";comment2=%20like%20a%20pound%20of%20bacon";
pub const ADMIN_TAG: &[u8] = b";admin=true;";

fn escape(userdata: &[u8]) -> Vec<u8> {
    userdata.iter()
        .flat_map(|&b| match b {
            b';' => b"%3B".to_vec(),
            b'=' => b"%3D".to_vec(),
            _ => vec![b],
        })
        .collect()
}

// CBC-encrypted cookies around escaped user data. Output is IV ++ ciphertext.
pub struct CookieOracle {
    cipher: Box<dyn BlockCipher>,
    ivs: Mutex<StdRng>,
}

impl CookieOracle {
    pub fn new(cipher: Box<dyn BlockCipher>, rng: &mut impl Rng) -> Self {
        CookieOracle { cipher, ivs: Mutex::new(StdRng::seed_from_u64(rng.gen())) }
    }

    pub fn is_admin(&self, cookie: &[u8]) -> Result<bool> {
        let block_size = self.cipher.block_size();
        ensure!(
            cookie.len() >= 2 * block_size,
            CiphertextTooShortSnafu { len: cookie.len(), block_size }
        );
        let (iv, ciphertext) = cookie.split_at(block_size);
        let plaintext = decrypt_cbc(self.cipher.as_ref(), ciphertext, iv)?;
        Ok(plaintext.windows(ADMIN_TAG.len()).any(|w| w == ADMIN_TAG))
    }
}

impl Oracle for CookieOracle {
    fn encrypt(&self, userdata: &[u8]) -> Result<Vec<u8>> {
        let plaintext = [COOKIE_PREFIX, escape(userdata).as_slice(), COOKIE_SUFFIX].concat();
        let mut iv = vec![0u8; self.cipher.block_size()];
        self.ivs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .fill(iv.as_mut_slice());
        let ciphertext = encrypt_cbc(self.cipher.as_ref(), &plaintext, &iv)?;
        Ok([iv, ciphertext].concat())
    }
}

// `prefix_len` counts every response byte in front of the attacker's
// plaintext, IV block included. The first of two filler blocks is sacrificed:
// flipping its ciphertext rewrites the second into ;admin=true;
pub fn forge_admin(oracle: &dyn Oracle, block_size: usize, prefix_len: usize) -> Result<Vec<u8>> {
    ensure!(block_size >= ADMIN_TAG.len(), InvalidBlockSizeSnafu { block_size });
    let align = (block_size - prefix_len % block_size) % block_size;
    let mut cookie = oracle.encrypt(&vec![FILLER; align + 2 * block_size])?;

    let start = prefix_len + align;
    ensure!(
        cookie.len() >= start + 2 * block_size,
        ResponseTooShortSnafu { len: cookie.len(), needed: start + 2 * block_size }
    );

    let desired = [ADMIN_TAG, vec![FILLER; block_size - ADMIN_TAG.len()].as_slice()].concat();
    let flips = fixed_xor(&desired, &vec![FILLER; block_size]);
    xor_in_place(&mut cookie[start..start + block_size], &flips);
    debug!("flipped ciphertext block at offset {}", start);
    Ok(cookie)
}

#[test]
fn test_escape() {
    assert_eq!(b"a%3Bb%3Dc".to_vec(), escape(b"a;b=c"));
    assert_eq!(b"plain".to_vec(), escape(b"plain"));
}

#[test]
fn test_cookie_oracle_escapes_admin() {
    let mut rng = StdRng::seed_from_u64(16);
    let oracle = CookieOracle::new(Box::new(Aes128::random(&mut rng)), &mut rng);
    let cookie = oracle.encrypt(b";admin=true;").unwrap();
    assert!(!oracle.is_admin(&cookie).unwrap());
    assert!(oracle.is_admin(&cookie[..8]).is_err());
}

#[test]
fn test_forge_admin() {
    let mut rng = StdRng::seed_from_u64(16);
    for _ in 0..10 {
        let oracle = CookieOracle::new(Box::new(Aes128::random(&mut rng)), &mut rng);
        let cookie = forge_admin(&oracle, 16, 16 + COOKIE_PREFIX.len()).unwrap();
        assert!(oracle.is_admin(&cookie).unwrap());
    }
}

#[test]
fn test_forge_admin_unaligned_prefix() {
    let mut rng = StdRng::seed_from_u64(17);
    let oracle = CookieOracle::new(Box::new(Aes128::random(&mut rng)), &mut rng);
    // Three bytes of our own before the filler
    let shifted = |input: &[u8]| oracle.encrypt(&[&b"xyz"[..], input].concat());
    let cookie = forge_admin(&shifted, 16, 16 + COOKIE_PREFIX.len() + 3).unwrap();
    assert!(oracle.is_admin(&cookie).unwrap());
}

#[test]
fn test_forge_admin_needs_room_for_tag() {
    let mut rng = StdRng::seed_from_u64(18);
    let oracle = CookieOracle::new(Box::new(TripleDes::random(&mut rng)), &mut rng);
    assert!(matches!(
        forge_admin(&oracle, 8, 8 + COOKIE_PREFIX.len()),
        Err(Error::InvalidBlockSize { block_size: 8 })
    ));
}
