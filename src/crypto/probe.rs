use itertools::Itertools;
use log::{debug, info};
use snafu::{ensure, OptionExt};

use crate::crypto::common::{block_at, repeating_block};
use crate::crypto::oracle::{Mode, Oracle};
use crate::util::{
    InvalidBlockSizeSnafu, NoBlockSizeChangeSnafu, OracleNotPaddingSnafu, PrefixNotFoundSnafu, Result,
};
#[cfg(test)]
use crate::crypto::cipher::{random_cipher, Aes128};
#[cfg(test)]
use crate::crypto::oracle::{AmbiguousOracle, EncryptionOracle};
#[cfg(test)]
use crate::util::Error;
#[cfg(test)]
use rand::{rngs::StdRng, SeedableRng};
#[cfg(test)]
use rstest::rstest;

// Upper bound on how many attacker bytes block size discovery will try
pub const MAX_BLOCK_SIZE: usize = 256;
pub const FILLER: u8 = b'A';
pub const ALT_FILLER: u8 = b'B';
const ALIGN_BYTE: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizeInfo {
    pub block_size: usize,
    // Attacker bytes needed before the oracle emits a whole extra padding block
    pub input_size_to_full_padding: usize,
    // Ciphertext length for an empty query
    pub initial_len: usize,
}

impl BlockSizeInfo {
    // Bytes the oracle adds around the attacker's input, before padding. An
    // oracle that grows before a full block of input has been sent is not
    // padding its plaintext at all.
    pub fn hidden_len(&self) -> Result<usize> {
        self.initial_len
            .checked_sub(self.input_size_to_full_padding)
            .context(OracleNotPaddingSnafu {
                initial_len: self.initial_len,
                input_size_to_full_padding: self.input_size_to_full_padding,
            })
    }
}

// Given an oracle of the form
// (fixed block encryption function) . (fixed lpad ++) . (++ fixed rpad)
// grow the input one byte at a time until the ciphertext jumps by a block
pub fn discover_block_size(oracle: &dyn Oracle) -> Result<BlockSizeInfo> {
    let initial_len = oracle.encrypt(&[])?.len();
    let mut input: Vec<u8> = Vec::new();
    while input.len() < MAX_BLOCK_SIZE {
        input.push(FILLER);
        let len = oracle.encrypt(&input)?.len();
        if len > initial_len {
            let info = BlockSizeInfo {
                block_size: len - initial_len,
                input_size_to_full_padding: input.len(),
                initial_len,
            };
            info!("discovered block size {} after {} filler bytes", info.block_size, input.len());
            return Ok(info);
        }
    }
    NoBlockSizeChangeSnafu { tried: input.len() }.fail()
}

// Three identical blocks of input guarantee two aligned identical blocks even
// behind an unaligned prefix. ECB maps them to identical ciphertext; CBC
// does not.
pub fn sniff_mode(oracle: &dyn Oracle, block_size: usize) -> Result<Mode> {
    ensure!(block_size > 0, InvalidBlockSizeSnafu { block_size });
    let ciphertext = oracle.encrypt(&vec![FILLER; 3 * block_size])?;
    let mode = match repeating_block(&ciphertext, block_size) {
        Some(_) => Mode::Ecb,
        None => Mode::Cbc,
    };
    debug!("sniffed mode {}", mode);
    Ok(mode)
}

// Number of pairs of identical blocks
pub fn ecb_score(ciphertext: &[u8], block_size: usize) -> usize {
    ciphertext.chunks(block_size)
        .tuple_combinations()
        .filter(|(a, b)| a == b)
        .count()
}

pub fn detect_ecb(ciphertext: &[u8], block_size: usize) -> bool {
    ecb_score(ciphertext, block_size) > 0
}

// Block indices at which `count` consecutive identical blocks start
pub fn find_repeating_run(buf: &[u8], block_size: usize, count: usize) -> Vec<usize> {
    let blocks: Vec<&[u8]> = buf.chunks_exact(block_size).collect();
    if count == 0 || blocks.len() < count {
        return Vec::new();
    }
    blocks.windows(count)
        .enumerate()
        .filter(|(_, run)| run.iter().all_equal())
        .map(|(idx, _)| idx)
        .collect()
}

// For each alignment i, send i alignment bytes followed by three blocks of
// filler. Once prefix + i is a multiple of the block size the filler shows up
// as three identical ciphertext blocks. The same run must move with the
// filler content, otherwise it was part of the prefix.
pub fn discover_prefix_length(oracle: &dyn Oracle, block_size: usize) -> Result<usize> {
    ensure!(block_size > 0, InvalidBlockSizeSnafu { block_size });
    for i in 0..block_size {
        let padding = vec![ALIGN_BYTE; i];
        let query = |filler: u8| oracle.encrypt(&[padding.clone(), vec![filler; 3 * block_size]].concat());

        let first = query(FILLER)?;
        let runs = find_repeating_run(&first, block_size, 3);
        if runs.is_empty() {
            continue;
        }

        let second = query(ALT_FILLER)?;
        let confirmed = find_repeating_run(&second, block_size, 3);
        let location = runs.into_iter().find(|&idx| {
            let offset = idx * block_size;
            confirmed.contains(&idx)
                && block_at(&first, offset, block_size).ok() != block_at(&second, offset, block_size).ok()
        });

        if let Some(prefix_len) = location.and_then(|idx| (idx * block_size).checked_sub(i)) {
            info!("discovered prefix length {} (alignment {})", prefix_len, i);
            return Ok(prefix_len);
        }
        debug!("alignment {} matched only inside fixed content", i);
    }
    PrefixNotFoundSnafu { block_size }.fail()
}

#[cfg(test)]
#[rstest]
#[case(8, 0)]
#[case(8, 13)]
#[case(16, 0)]
#[case(16, 16)]
#[case(16, 138)]
fn test_discover_block_size(#[case] block_size: usize, #[case] secret_len: usize) {
    let mut rng = StdRng::seed_from_u64(secret_len as u64);
    let secret = vec![b'?'; secret_len];
    let oracle = EncryptionOracle::ecb_suffix(random_cipher(block_size, &mut rng), &secret);

    let info = discover_block_size(&oracle).unwrap();
    assert_eq!(block_size, info.block_size);
    assert_eq!(secret_len, info.hidden_len().unwrap());
    assert_eq!(block_size - secret_len % block_size, info.input_size_to_full_padding);
}

#[test]
fn test_discover_block_size_needs_a_block_cipher() {
    let identity = |buf: &[u8]| -> Result<Vec<u8>> { Ok(buf.to_vec()) };
    let constant = |_: &[u8]| -> Result<Vec<u8>> { Ok(vec![0; 16]) };
    assert_eq!(1, discover_block_size(&identity).unwrap().block_size);
    assert!(matches!(
        discover_block_size(&constant),
        Err(Error::NoBlockSizeChange { tried: MAX_BLOCK_SIZE })
    ));
}

#[test]
fn test_hidden_len_rejects_non_padding_oracle() {
    // An oracle that echoes its input grows on the very first byte
    let identity = |buf: &[u8]| -> Result<Vec<u8>> { Ok(buf.to_vec()) };
    let info = discover_block_size(&identity).unwrap();
    assert_eq!(0, info.initial_len);
    assert!(matches!(
        info.hidden_len(),
        Err(Error::OracleNotPadding { initial_len: 0, input_size_to_full_padding: 1 })
    ));

    // Unpadded output that only ever grows in whole blocks
    let unpadded = |buf: &[u8]| -> Result<Vec<u8>> { Ok(vec![0; 16 * ((buf.len() + 15) / 16)]) };
    let info = discover_block_size(&unpadded).unwrap();
    assert_eq!(16, info.block_size);
    assert!(info.hidden_len().is_err());
}

#[test]
fn test_sniff_mode_forced_oracles() {
    let mut rng = StdRng::seed_from_u64(100);
    for _ in 0..100 {
        let ecb = AmbiguousOracle::with_mode(Mode::Ecb, &mut rng);
        let cbc = AmbiguousOracle::with_mode(Mode::Cbc, &mut rng);
        assert_eq!(Mode::Ecb, sniff_mode(&ecb, 16).unwrap());
        assert_eq!(Mode::Cbc, sniff_mode(&cbc, 16).unwrap());
    }
}

#[test]
fn test_sniff_mode_matches_coin_flip() {
    let mut rng = StdRng::seed_from_u64(101);
    for _ in 0..100 {
        let oracle = AmbiguousOracle::new(&mut rng);
        let block_size = discover_block_size(&oracle).unwrap().block_size;
        let (_, used) = oracle.encrypt_tagged(b"").unwrap();
        assert_eq!(used, sniff_mode(&oracle, block_size).unwrap());
    }
}

#[test]
fn test_ecb_score() {
    let ciphertext = b"aaaabbbbaaaaccccaaaa";
    assert_eq!(3, ecb_score(ciphertext, 4));
    assert!(detect_ecb(ciphertext, 4));
    assert!(!detect_ecb(b"abcdefgh", 4));
}

#[test]
fn test_find_repeating_run() {
    let buf = b"xxaaaaaabbyy";
    assert_eq!(vec![1], find_repeating_run(buf, 2, 3));
    assert_eq!(vec![1, 2], find_repeating_run(buf, 2, 2));
    assert!(find_repeating_run(buf, 2, 7).is_empty());
    assert!(find_repeating_run(buf, 2, 0).is_empty());
}

#[cfg(test)]
#[rstest]
#[case(8)]
#[case(16)]
fn test_discover_prefix_length_all_offsets(#[case] block_size: usize) {
    let mut rng = StdRng::seed_from_u64(block_size as u64);
    for prefix_len in 0..2 * block_size {
        let prefix: Vec<u8> = (0..prefix_len).map(|i| (i * 37 + 11) as u8).collect();
        let oracle = EncryptionOracle::builder()
            .pullback_add_left_padding(&prefix)
            .pullback_add_right_padding(b"attack at dawn")
            .pushforward_ecb(random_cipher(block_size, &mut rng));
        assert_eq!(prefix_len, discover_prefix_length(&oracle, block_size).unwrap());
    }
}

#[test]
fn test_discover_prefix_length_ignores_repeats_inside_prefix() {
    let mut rng = StdRng::seed_from_u64(5);
    // Three identical prefix blocks followed by an unaligned tail
    let prefix = [vec![b'A'; 48], b"tail".to_vec()].concat();
    let oracle = EncryptionOracle::builder()
        .pullback_add_left_padding(&prefix)
        .pushforward_ecb(Box::new(Aes128::random(&mut rng)));
    assert_eq!(prefix.len(), discover_prefix_length(&oracle, 16).unwrap());
}

#[test]
fn test_discover_prefix_length_fails_on_cbc() {
    let mut rng = StdRng::seed_from_u64(6);
    let oracle = AmbiguousOracle::with_mode(Mode::Cbc, &mut rng);
    assert!(matches!(
        discover_prefix_length(&oracle, 16),
        Err(Error::PrefixNotFound { block_size: 16 })
    ));
}
