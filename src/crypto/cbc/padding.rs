use std::sync::Mutex;

use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use snafu::{ensure, OptionExt};

use crate::crypto::cbc::{decrypt_cbc_blocks, encrypt_cbc};
use crate::crypto::cipher::BlockCipher;
use crate::crypto::common::{is_valid_pkcs_7, strip_pad_pkcs_7};
use crate::util::{CiphertextTooShortSnafu, InvalidBlockSizeSnafu, InvalidLengthSnafu, NoValidGuessSnafu, Result};
#[cfg(test)]
use crate::crypto::cipher::{random_cipher, Aes128};
#[cfg(test)]
use crate::crypto::xor::fixed_xor;
#[cfg(test)]
use crate::util::{b64_to_bytes, Error};
#[cfg(test)]
use rstest::rstest;

// Holds a secret plaintext under a hidden key and answers one question about
// any ciphertext: does it decrypt to valid PKCS#7 padding?
pub struct PaddingOracle {
    cipher: Box<dyn BlockCipher>,
    plaintext: Vec<u8>,
    ivs: Mutex<StdRng>,
}

impl PaddingOracle {
    pub fn new(cipher: Box<dyn BlockCipher>, plaintext: &[u8], rng: &mut impl Rng) -> Self {
        PaddingOracle {
            cipher,
            plaintext: plaintext.to_vec(),
            ivs: Mutex::new(StdRng::seed_from_u64(rng.gen())),
        }
    }

    pub fn block_size(&self) -> usize {
        self.cipher.block_size()
    }

    // IV ++ CBC(plaintext), with a fresh IV every call
    pub fn ciphertext(&self) -> Result<Vec<u8>> {
        let mut iv = vec![0u8; self.block_size()];
        self.ivs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .fill(iv.as_mut_slice());
        let ciphertext = encrypt_cbc(self.cipher.as_ref(), &self.plaintext, &iv)?;
        Ok([iv, ciphertext].concat())
    }

    // The first block is the IV; anything shorter than IV plus one block is invalid
    pub fn is_valid_padding(&self, buf: &[u8]) -> bool {
        let block_size = self.block_size();
        if buf.len() < 2 * block_size || buf.len() % block_size != 0 {
            return false;
        }
        let (iv, ciphertext) = buf.split_at(block_size);
        match decrypt_cbc_blocks(self.cipher.as_ref(), ciphertext, iv) {
            Ok(decrypted) => is_valid_pkcs_7(&decrypted, block_size),
            Err(_) => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn verify(&self, candidate: &[u8]) -> bool {
        self.plaintext == candidate
    }
}

// Prev block altered so that position p decrypts to v XOR (plain byte) XOR g,
// and every already recovered byte to the right decrypts to v
fn forge(prev: &[u8], known: &[u8], p: usize, guess: u8) -> Vec<u8> {
    let v = (prev.len() - p) as u8;
    let mut forged = prev.to_vec();
    forged[p] ^= guess ^ v;
    for pos in p + 1..prev.len() {
        forged[pos] ^= known[pos] ^ v;
    }
    forged
}

fn query(is_valid: &(impl Fn(&[u8]) -> bool + Sync), forged: &[u8], target: &[u8]) -> bool {
    is_valid(&[forged, target].concat())
}

// With nothing known yet, a decryption ending in 0x02 0x02 (and so on) also
// validates. Flipping the second to last byte only breaks those. The trivial
// guess leaves prev untouched and so always validates on the final block; it is
// tried last and only accepted if it survives the same flip.
fn last_byte(
    prev: &[u8],
    target: &[u8],
    block: usize,
    is_valid: &(impl Fn(&[u8]) -> bool + Sync),
) -> Result<u8> {
    let block_size = prev.len();
    let p = block_size - 1;
    let trivial = 1u8;
    let known = vec![0u8; block_size];

    let confirms = |guess: u8| {
        let mut forged = forge(prev, &known, p, guess);
        forged[p - 1] ^= 0xff;
        query(is_valid, &forged, target)
    };

    let candidates: Vec<u8> = (0..=u8::MAX)
        .into_par_iter()
        .filter(|&guess| guess != trivial && query(is_valid, &forge(prev, &known, p, guess), target))
        .collect();
    trace!("block {}: {} candidates for last byte", block, candidates.len());

    if let Some(guess) = candidates.into_iter().find(|&guess| confirms(guess)) {
        return Ok(guess);
    }
    if query(is_valid, prev, target) && confirms(trivial) {
        return Ok(trivial);
    }
    NoValidGuessSnafu { block, position: p }.fail()
}

fn attack_block(
    prev: &[u8],
    target: &[u8],
    block: usize,
    is_valid: &(impl Fn(&[u8]) -> bool + Sync),
) -> Result<Vec<u8>> {
    let block_size = prev.len();
    let mut known = vec![0u8; block_size];
    known[block_size - 1] = last_byte(prev, target, block, is_valid)?;

    for p in (0..block_size - 1).rev() {
        let byte = (0..=u8::MAX)
            .into_par_iter()
            .find_first(|&guess| query(is_valid, &forge(prev, &known, p, guess), target))
            .context(NoValidGuessSnafu { block, position: p })?;
        known[p] = byte;
    }
    debug!("block {}: {}", block, hex::encode(&known));
    Ok(known)
}

// Decrypts `ciphertext` (IV first) using only a padding validity predicate.
// Blocks are attacked from the last pair to the first.
pub fn attack_cbc_padding(
    ciphertext: &[u8],
    block_size: usize,
    is_valid: &(impl Fn(&[u8]) -> bool + Sync),
) -> Result<Vec<u8>> {
    ensure!((2..=u8::MAX as usize).contains(&block_size), InvalidBlockSizeSnafu { block_size });
    ensure!(
        ciphertext.len() % block_size == 0,
        InvalidLengthSnafu { len: ciphertext.len(), block_size }
    );
    ensure!(
        ciphertext.len() >= 2 * block_size,
        CiphertextTooShortSnafu { len: ciphertext.len(), block_size }
    );

    let blocks: Vec<&[u8]> = ciphertext.chunks(block_size).collect();
    let mut recovered: Vec<Vec<u8>> = Vec::with_capacity(blocks.len() - 1);
    for idx in (1..blocks.len()).rev() {
        recovered.push(attack_block(blocks[idx - 1], blocks[idx], idx - 1, is_valid)?);
    }
    recovered.reverse();

    let plaintext = strip_pad_pkcs_7(&recovered.concat());
    info!("padding oracle attack recovered {} bytes", plaintext.len());
    Ok(plaintext)
}

#[cfg(test)]
fn attack(oracle: &PaddingOracle) -> Vec<u8> {
    let ciphertext = oracle.ciphertext().unwrap();
    attack_cbc_padding(&ciphertext, oracle.block_size(), &|buf: &[u8]| oracle.is_valid_padding(buf)).unwrap()
}

#[cfg(test)]
#[rstest]
#[case("MDAwMDAwTm93IHRoYXQgdGhlIHBhcnR5IGlzIGp1bXBpbmc=", b"000000Now that the party is jumping")]
#[case("MDAwMDAxV2l0aCB0aGUgYmFzcyBraWNrZWQgaW4gYW5kIHRoZSBWZWdhJ3MgYXJlIHB1bXBpbic=", b"000001With the bass kicked in and the Vega's are pumpin'")]
#[case("MDAwMDAyUXVpY2sgdG8gdGhlIHBvaW50LCB0byB0aGUgcG9pbnQsIG5vIGZha2luZw==", b"000002Quick to the point, to the point, no faking")]
#[case("MDAwMDAzQ29va2luZyBNQydzIGxpa2UgYSBwb3VuZCBvZiBiYWNvbg==", b"000003Cooking MC's like a pound of bacon")]
#[case("MDAwMDA0QnVybmluZyAnZW0sIGlmIHlvdSBhaW4ndCBxdWljayBhbmQgbmltYmxl", b"000004Burning 'em, if you ain't quick and nimble")]
#[case("MDAwMDA1SSBnbyBjcmF6eSB3aGVuIEkgaGVhciBhIGN5bWJhbA==", b"000005I go crazy when I hear a cymbal")]
#[case("MDAwMDA2QW5kIGEgaGlnaCBoYXQgd2l0aCBhIHNvdXBlZCB1cCB0ZW1wbw==", b"000006And a high hat with a souped up tempo")]
#[case("MDAwMDA3SSdtIG9uIGEgcm9sbCwgaXQncyB0aW1lIHRvIGdvIHNvbG8=", b"000007I'm on a roll, it's time to go solo")]
#[case("MDAwMDA4b2xsaW4nIGluIG15IGZpdmUgcG9pbnQgb2g=", b"000008ollin' in my five point oh")]
#[case("MDAwMDA5aXRoIG15IHJhZy10b3AgZG93biBzbyBteSBoYWlyIGNhbiBibG93", b"000009ith my rag-top down so my hair can blow")]
fn test_attack_cbc_padding(#[case] encoded: &str, #[case] expected: &[u8]) {
    let mut rng = StdRng::seed_from_u64(17);
    let plaintext = b64_to_bytes(encoded).unwrap();
    assert_eq!(expected.to_vec(), plaintext);

    let oracle = PaddingOracle::new(Box::new(Aes128::random(&mut rng)), &plaintext, &mut rng);
    let result = attack(&oracle);
    assert_eq!(expected.to_vec(), result);
    assert!(oracle.verify(&result));
}

#[cfg(test)]
#[rstest]
#[case(16)]
#[case(8)]
fn test_attack_cbc_padding_every_padding_length(#[case] block_size: usize) {
    let mut rng = StdRng::seed_from_u64(block_size as u64);
    for len in 0..2 * block_size {
        let plaintext: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
        let oracle = PaddingOracle::new(random_cipher(block_size, &mut rng), &plaintext, &mut rng);
        assert_eq!(plaintext, attack(&oracle));
    }
}

#[cfg(test)]
#[rstest]
#[case(b"fifteen bytes..\x01and another block")]
#[case(b"fourteen bytes\x02\x02then the rest")]
#[case(b"ends with a lone one\x01")]
#[case(b"\x10\x10\x10\x10\x10\x10\x10\x10\x10\x10\x10\x10\x10\x10\x10\x10")]
fn test_attack_cbc_padding_lookalike_bytes(#[case] plaintext: &[u8]) {
    let mut rng = StdRng::seed_from_u64(18);
    for _ in 0..8 {
        let oracle = PaddingOracle::new(Box::new(Aes128::random(&mut rng)), plaintext, &mut rng);
        assert_eq!(plaintext.to_vec(), attack(&oracle));
    }
}

#[test]
fn test_padding_oracle_predicate() {
    let mut rng = StdRng::seed_from_u64(19);
    let oracle = PaddingOracle::new(Box::new(Aes128::random(&mut rng)), b"YELLOW SUBMARINE", &mut rng);
    let ciphertext = oracle.ciphertext().unwrap();
    assert_eq!(48, ciphertext.len());
    assert_ne!(ciphertext, oracle.ciphertext().unwrap());
    assert!(oracle.is_valid_padding(&ciphertext));
    assert!(!oracle.is_valid_padding(&ciphertext[..16]));
    assert!(!oracle.is_valid_padding(&ciphertext[..47]));

    // Flipping the last byte of the middle block shifts the pad byte to 0x11
    let mut tampered = ciphertext.clone();
    tampered[31] ^= 0x01;
    assert!(!oracle.is_valid_padding(&tampered));
}

#[test]
fn test_attack_cbc_padding_contract_violations() {
    let always = |_: &[u8]| true;
    assert!(matches!(
        attack_cbc_padding(&[0u8; 33], 16, &always),
        Err(Error::InvalidLength { len: 33, block_size: 16 })
    ));
    assert!(matches!(
        attack_cbc_padding(&[0u8; 16], 16, &always),
        Err(Error::CiphertextTooShort { len: 16, block_size: 16 })
    ));
    assert!(matches!(
        attack_cbc_padding(&[0u8; 16], 1, &always),
        Err(Error::InvalidBlockSize { block_size: 1 })
    ));
    assert!(matches!(
        attack_cbc_padding(&[0u8; 48], 16, &|_: &[u8]| false),
        Err(Error::NoValidGuess { block: 1, position: 15 })
    ));
}

#[test]
fn test_attack_block_takes_smallest_accepted_guess() {
    // Decryption of the target is fixed; byte 1 is accepted anywhere in 0..16
    let intermediate = [10u8, 20, 30, 40];
    let lenient = |buf: &[u8]| {
        let plain = fixed_xor(&buf[..4], &intermediate);
        let n = plain[3] as usize;
        (1..=4).contains(&n)
            && (4 - n..4).all(|i| if i == 1 { plain[i] < 16 } else { plain[i] == n as u8 })
    };
    // 16..32 all pass at byte 1
    for _ in 0..20 {
        assert_eq!(vec![10, 16, 30, 40], attack_block(&[0u8; 4], &[0u8; 4], 0, &lenient).unwrap());
    }
}
