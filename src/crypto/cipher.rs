use openssl::symm::{Cipher, Crypter, Mode as Direction};
use rand::Rng;
use snafu::{ensure, ResultExt};

use crate::crypto::common::generate_random_bytes;
use crate::util::{CryptoSnafu, InvalidKeySnafu, InvalidLengthSnafu, Result};

// A keyed permutation over fixed-size blocks. Modes of operation live in
// `ecb` and `cbc`; implementors only ever see whole blocks.
pub trait BlockCipher: Send + Sync {
    fn block_size(&self) -> usize;
    fn encrypt_block(&self, block: &[u8]) -> Result<Vec<u8>>;
    fn decrypt_block(&self, block: &[u8]) -> Result<Vec<u8>>;

    fn encrypt_blocks(&self, buf: &[u8]) -> Result<Vec<u8>> {
        check_blocks(buf, self.block_size())?;
        let mut out = Vec::with_capacity(buf.len());
        for block in buf.chunks(self.block_size()) {
            out.extend(self.encrypt_block(block)?);
        }
        Ok(out)
    }

    fn decrypt_blocks(&self, buf: &[u8]) -> Result<Vec<u8>> {
        check_blocks(buf, self.block_size())?;
        let mut out = Vec::with_capacity(buf.len());
        for block in buf.chunks(self.block_size()) {
            out.extend(self.decrypt_block(block)?);
        }
        Ok(out)
    }
}

fn check_blocks(buf: &[u8], block_size: usize) -> Result<()> {
    ensure!(
        buf.len() % block_size == 0,
        InvalidLengthSnafu { len: buf.len(), block_size }
    );
    Ok(())
}

// Raw ECB through openssl with padding switched off, so the crypter is a pure
// block permutation
struct OpensslBlock {
    cipher: Cipher,
    key: Vec<u8>,
}

impl OpensslBlock {
    fn new(cipher: Cipher, key: &[u8]) -> Result<Self> {
        ensure!(
            key.len() == cipher.key_len(),
            InvalidKeySnafu { len: key.len(), expected: cipher.key_len() }
        );
        Ok(OpensslBlock { cipher, key: key.to_vec() })
    }

    fn run(&self, direction: Direction, buf: &[u8]) -> Result<Vec<u8>> {
        check_blocks(buf, self.cipher.block_size())?;
        let mut crypter = Crypter::new(self.cipher, direction, &self.key, None)
            .context(CryptoSnafu)?;
        crypter.pad(false);
        let mut out = vec![0u8; buf.len() + self.cipher.block_size()];
        let mut count = crypter.update(buf, &mut out).context(CryptoSnafu)?;
        count += crypter.finalize(&mut out[count..]).context(CryptoSnafu)?;
        out.truncate(count);
        Ok(out)
    }

    fn run_block(&self, direction: Direction, block: &[u8]) -> Result<Vec<u8>> {
        ensure!(
            block.len() == self.cipher.block_size(),
            InvalidLengthSnafu { len: block.len(), block_size: self.cipher.block_size() }
        );
        self.run(direction, block)
    }
}

// AES-128, 16 byte blocks
pub struct Aes128(OpensslBlock);

impl Aes128 {
    pub const KEY_SIZE: usize = 16;

    pub fn new(key: &[u8]) -> Result<Self> {
        OpensslBlock::new(Cipher::aes_128_ecb(), key).map(Aes128)
    }

    pub fn random(rng: &mut impl Rng) -> Self {
        let key: [u8; Self::KEY_SIZE] = generate_random_bytes(rng);
        Aes128(OpensslBlock { cipher: Cipher::aes_128_ecb(), key: key.to_vec() })
    }
}

impl BlockCipher for Aes128 {
    fn block_size(&self) -> usize { self.0.cipher.block_size() }

    fn encrypt_block(&self, block: &[u8]) -> Result<Vec<u8>> {
        self.0.run_block(Direction::Encrypt, block)
    }

    fn decrypt_block(&self, block: &[u8]) -> Result<Vec<u8>> {
        self.0.run_block(Direction::Decrypt, block)
    }

    fn encrypt_blocks(&self, buf: &[u8]) -> Result<Vec<u8>> {
        self.0.run(Direction::Encrypt, buf)
    }

    fn decrypt_blocks(&self, buf: &[u8]) -> Result<Vec<u8>> {
        self.0.run(Direction::Decrypt, buf)
    }
}

// Three-key DES-EDE3, 8 byte blocks
pub struct TripleDes(OpensslBlock);

impl TripleDes {
    pub const KEY_SIZE: usize = 24;

    pub fn new(key: &[u8]) -> Result<Self> {
        OpensslBlock::new(Cipher::des_ede3(), key).map(TripleDes)
    }

    pub fn random(rng: &mut impl Rng) -> Self {
        let key: [u8; Self::KEY_SIZE] = generate_random_bytes(rng);
        TripleDes(OpensslBlock { cipher: Cipher::des_ede3(), key: key.to_vec() })
    }
}

impl BlockCipher for TripleDes {
    fn block_size(&self) -> usize { self.0.cipher.block_size() }

    fn encrypt_block(&self, block: &[u8]) -> Result<Vec<u8>> {
        self.0.run_block(Direction::Encrypt, block)
    }

    fn decrypt_block(&self, block: &[u8]) -> Result<Vec<u8>> {
        self.0.run_block(Direction::Decrypt, block)
    }

    fn encrypt_blocks(&self, buf: &[u8]) -> Result<Vec<u8>> {
        self.0.run(Direction::Encrypt, buf)
    }

    fn decrypt_blocks(&self, buf: &[u8]) -> Result<Vec<u8>> {
        self.0.run(Direction::Decrypt, buf)
    }
}

// Triple DES for 8 byte blocks, AES otherwise
#[cfg(test)]
pub(crate) fn random_cipher(block_size: usize, rng: &mut impl Rng) -> Box<dyn BlockCipher> {
    match block_size {
        8 => Box::new(TripleDes::random(rng)),
        _ => Box::new(Aes128::random(rng)),
    }
}

#[test]
fn test_aes_128_known_answer() {
    // FIPS-197 appendix C.1
    let cipher = Aes128::new(&hex!("000102030405060708090a0b0c0d0e0f")).unwrap();
    let plaintext = hex!("00112233445566778899aabbccddeeff");
    let expected = hex!("69c4e0d86a7b0430d8cdb78070b4c55a");
    let encrypted = cipher.encrypt_block(&plaintext).unwrap();
    assert_eq!(expected.to_vec(), encrypted);
    assert_eq!(plaintext.to_vec(), cipher.decrypt_block(&encrypted).unwrap());
}

#[test]
fn test_block_sizes_and_bad_input() {
    let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(3);
    let aes = Aes128::random(&mut rng);
    let des = TripleDes::random(&mut rng);
    assert_eq!(16, aes.block_size());
    assert_eq!(8, des.block_size());

    let block = [7u8; 8];
    assert_eq!(block.to_vec(), des.decrypt_block(&des.encrypt_block(&block).unwrap()).unwrap());
    assert!(aes.encrypt_block(&block).is_err());
    assert!(aes.encrypt_blocks(&[0u8; 17]).is_err());
    assert!(Aes128::new(b"short").is_err());
}

#[test]
fn test_bulk_matches_blockwise() {
    let cipher = Aes128::new(b"YELLOW SUBMARINE").unwrap();
    let buf: Vec<u8> = (0..64u8).collect();
    let bulk = cipher.encrypt_blocks(&buf).unwrap();
    let blockwise: Vec<u8> = buf.chunks(16)
        .flat_map(|b| cipher.encrypt_block(b).unwrap())
        .collect();
    assert_eq!(bulk, blockwise);
    assert_eq!(buf, cipher.decrypt_blocks(&bulk).unwrap());
}
