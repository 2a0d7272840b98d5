use std::fmt;
use std::sync::Mutex;

use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::crypto::cbc::encrypt_cbc;
use crate::crypto::cipher::{Aes128, BlockCipher};
use crate::crypto::common::random_bytes_in_range;
use crate::crypto::ecb::encrypt_ecb;
use crate::util::Result;
#[cfg(test)]
use crate::crypto::cbc::decrypt_cbc;
#[cfg(test)]
use crate::crypto::cipher::TripleDes;
#[cfg(test)]
use crate::crypto::ecb::decrypt_ecb;

// Chosen-plaintext access to an encryption function. Everything the oracle
// knows stays behind this call.
pub trait Oracle: Sync {
    fn encrypt(&self, input: &[u8]) -> Result<Vec<u8>>;
}

impl<F> Oracle for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>> + Sync,
{
    fn encrypt(&self, input: &[u8]) -> Result<Vec<u8>> {
        self(input)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Ecb,
    Cbc,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Ecb => write!(f, "ECB"),
            Mode::Cbc => write!(f, "CBC"),
        }
    }
}

enum Chaining {
    Ecb,
    // Seeded once from the construction rng; a fresh IV is drawn per query
    Cbc { ivs: Mutex<StdRng> },
}

// encrypt(prefix ++ input ++ suffix) under a key fixed at construction. CBC
// oracles return the IV as the first ciphertext block.
pub struct EncryptionOracle {
    cipher: Box<dyn BlockCipher>,
    prefix: Vec<u8>,
    suffix: Vec<u8>,
    chaining: Chaining,
}

impl EncryptionOracle {
    pub fn builder() -> OracleBuilder {
        OracleBuilder::default()
    }

    pub fn plain(cipher: Box<dyn BlockCipher>) -> Self {
        Self::builder().pushforward_ecb(cipher)
    }

    pub fn ecb_suffix(cipher: Box<dyn BlockCipher>, secret: &[u8]) -> Self {
        Self::builder()
            .pullback_add_right_padding(secret)
            .pushforward_ecb(cipher)
    }

    pub fn ecb_suffix_with_random_prefix<const MIN: usize, const MAX: usize>(
        cipher: Box<dyn BlockCipher>,
        secret: &[u8],
        rng: &mut impl Rng,
    ) -> Self {
        Self::builder()
            .pullback_add_random_left_padding::<MIN, MAX>(rng)
            .pullback_add_right_padding(secret)
            .pushforward_ecb(cipher)
    }

    #[cfg(test)]
    pub(crate) fn mode(&self) -> Mode {
        match self.chaining {
            Chaining::Ecb => Mode::Ecb,
            Chaining::Cbc { .. } => Mode::Cbc,
        }
    }

    #[cfg(test)]
    pub(crate) fn verify_suffix(&self, candidate: &[u8]) -> bool {
        self.suffix == candidate
    }

    fn next_iv(&self, ivs: &Mutex<StdRng>) -> Vec<u8> {
        let mut iv = vec![0u8; self.cipher.block_size()];
        let mut rng = ivs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.fill(iv.as_mut_slice());
        iv
    }
}

impl Oracle for EncryptionOracle {
    fn encrypt(&self, input: &[u8]) -> Result<Vec<u8>> {
        let plaintext = [self.prefix.as_slice(), input, self.suffix.as_slice()].concat();
        trace!("oracle query: {} attacker bytes", input.len());
        match &self.chaining {
            Chaining::Ecb => encrypt_ecb(self.cipher.as_ref(), &plaintext),
            Chaining::Cbc { ivs } => {
                let iv = self.next_iv(ivs);
                let ciphertext = encrypt_cbc(self.cipher.as_ref(), &plaintext, &iv)?;
                Ok([iv, ciphertext].concat())
            }
        }
    }
}

// Plaintext wrapping first, then the cipher mode
#[derive(Default)]
pub struct OracleBuilder {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
}

impl OracleBuilder {
    pub fn pullback_add_left_padding(mut self, lpad: &[u8]) -> Self {
        self.prefix = [lpad, self.prefix.as_slice()].concat();
        self
    }

    pub fn pullback_add_right_padding(mut self, rpad: &[u8]) -> Self {
        self.suffix.extend_from_slice(rpad);
        self
    }

    pub fn pullback_add_random_left_padding<const MIN: usize, const MAX: usize>(self, rng: &mut impl Rng) -> Self {
        let padding = random_bytes_in_range(rng, MIN, MAX);
        self.pullback_add_left_padding(&padding)
    }

    pub fn pullback_add_random_right_padding<const MIN: usize, const MAX: usize>(self, rng: &mut impl Rng) -> Self {
        let padding = random_bytes_in_range(rng, MIN, MAX);
        self.pullback_add_right_padding(&padding)
    }

    pub fn pushforward_ecb(self, cipher: Box<dyn BlockCipher>) -> EncryptionOracle {
        EncryptionOracle {
            cipher,
            prefix: self.prefix,
            suffix: self.suffix,
            chaining: Chaining::Ecb,
        }
    }

    pub fn pushforward_cbc(self, cipher: Box<dyn BlockCipher>, rng: &mut impl Rng) -> EncryptionOracle {
        EncryptionOracle {
            cipher,
            prefix: self.prefix,
            suffix: self.suffix,
            chaining: Chaining::Cbc { ivs: Mutex::new(StdRng::seed_from_u64(rng.gen())) },
        }
    }
}

// AES under ECB or CBC, picked by coin flip at construction, wrapping the
// attacker input in 5..=10 random bytes on each side
pub struct AmbiguousOracle {
    inner: EncryptionOracle,
    mode: Mode,
}

impl AmbiguousOracle {
    pub fn new(rng: &mut impl Rng) -> Self {
        let mode = if rng.gen() { Mode::Ecb } else { Mode::Cbc };
        Self::with_mode(mode, rng)
    }

    pub fn with_mode(mode: Mode, rng: &mut impl Rng) -> Self {
        let cipher = Box::new(Aes128::random(rng));
        let builder = OracleBuilder::default()
            .pullback_add_random_left_padding::<5, 10>(rng)
            .pullback_add_random_right_padding::<5, 10>(rng);
        let inner = match mode {
            Mode::Ecb => builder.pushforward_ecb(cipher),
            Mode::Cbc => builder.pushforward_cbc(cipher, rng),
        };
        AmbiguousOracle { inner, mode }
    }

    // Ciphertext plus the mode actually used, for checking a guess
    pub fn encrypt_tagged(&self, input: &[u8]) -> Result<(Vec<u8>, Mode)> {
        Ok((self.inner.encrypt(input)?, self.mode))
    }
}

impl Oracle for AmbiguousOracle {
    fn encrypt(&self, input: &[u8]) -> Result<Vec<u8>> {
        self.inner.encrypt(input)
    }
}

#[test]
fn test_ecb_oracle_is_deterministic() {
    let mut rng = StdRng::seed_from_u64(1);
    let oracle = EncryptionOracle::ecb_suffix(Box::new(Aes128::random(&mut rng)), b"secret");
    assert_eq!(oracle.encrypt(b"hello").unwrap(), oracle.encrypt(b"hello").unwrap());
    assert_ne!(oracle.encrypt(b"hello").unwrap(), oracle.encrypt(b"jello").unwrap());
    assert!(oracle.verify_suffix(b"secret"));
    assert!(!oracle.verify_suffix(b"secreT"));
}

#[test]
fn test_ecb_oracle_wraps_input() {
    let oracle = EncryptionOracle::builder()
        .pullback_add_left_padding(b"left-")
        .pullback_add_right_padding(b"-right")
        .pushforward_ecb(Box::new(TripleDes::new(&(0..24u8).collect::<Vec<_>>()).unwrap()));
    let ciphertext = oracle.encrypt(b"middle").unwrap();
    let plaintext = decrypt_ecb(oracle.cipher.as_ref(), &ciphertext).unwrap();
    assert_eq!(b"left-middle-right".to_vec(), plaintext);
}

#[test]
fn test_cbc_oracle_uses_fresh_iv() {
    let mut rng = StdRng::seed_from_u64(2);
    let oracle = EncryptionOracle::builder()
        .pullback_add_right_padding(b" tail")
        .pushforward_cbc(Box::new(Aes128::random(&mut rng)), &mut rng);
    let first = oracle.encrypt(b"head").unwrap();
    let second = oracle.encrypt(b"head").unwrap();
    assert_ne!(first, second);
    assert_eq!(Mode::Cbc, oracle.mode());

    for response in [first, second] {
        let (iv, ciphertext) = response.split_at(16);
        let plaintext = decrypt_cbc(oracle.cipher.as_ref(), ciphertext, iv).unwrap();
        assert_eq!(b"head tail".to_vec(), plaintext);
    }
}

#[test]
fn test_random_prefix_length_in_range() {
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..20 {
        let oracle = EncryptionOracle::ecb_suffix_with_random_prefix::<3, 40>(
            Box::new(Aes128::random(&mut rng)),
            b"x",
            &mut rng,
        );
        assert!((3..=40).contains(&oracle.prefix.len()));
    }
}

#[test]
fn test_ambiguous_oracle_is_reproducible_under_seed() {
    let modes = |seed| {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..16)
            .map(|_| AmbiguousOracle::new(&mut rng).encrypt_tagged(b"").unwrap().1)
            .collect::<Vec<_>>()
    };
    assert_eq!(modes(4), modes(4));
    assert!(modes(4).contains(&Mode::Ecb));
    assert!(modes(4).contains(&Mode::Cbc));
}

#[test]
fn test_ambiguous_oracle_tags_forced_mode() {
    let mut rng = StdRng::seed_from_u64(5);
    for mode in [Mode::Ecb, Mode::Cbc] {
        let oracle = AmbiguousOracle::with_mode(mode, &mut rng);
        assert_eq!(mode, oracle.inner.mode());
        assert_eq!(mode, oracle.encrypt_tagged(b"input").unwrap().1);
    }
}
