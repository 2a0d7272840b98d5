use rand::Rng;
use snafu::{ensure, OptionExt};
use std::collections::HashSet;

use crate::util::{InvalidBlockSizeSnafu, ResponseTooShortSnafu, Result};

// Padding value must fit in one byte
pub fn pad_pkcs_7(buf: &[u8], block_size: usize) -> Result<Vec<u8>> {
    ensure!(
        (1..=u8::MAX as usize).contains(&block_size),
        InvalidBlockSizeSnafu { block_size }
    );
    let padding_length = block_size - (buf.len() % block_size);
    Ok([buf, vec![padding_length as u8; padding_length].as_slice()].concat())
}

#[test]
fn test_pad_pkcs_7() {
    let case = b"YELLOW SUBMARINE";
    let expected = b"YELLOW SUBMARINE\x04\x04\x04\x04".to_vec();
    assert_eq!(expected, pad_pkcs_7(case, 20).unwrap());

    // Already aligned input gets a whole block of padding
    let expected_2 = [case.to_vec(), vec![16; 16]].concat();
    assert_eq!(expected_2, pad_pkcs_7(case, case.len()).unwrap());

    assert_eq!(vec![1u8; 1], pad_pkcs_7(b"", 1).unwrap());
    assert!(pad_pkcs_7(case, 0).is_err());
    assert!(pad_pkcs_7(case, 256).is_err());
}

// Valid iff the last byte p satisfies 1 <= p <= block_size and the last p
// bytes all equal p
pub fn is_valid_pkcs_7(buf: &[u8], block_size: usize) -> bool {
    let Some(&final_byte) = buf.last() else {
        return false;
    };
    let padding_len = final_byte as usize;
    padding_len >= 1
        && padding_len <= block_size
        && padding_len <= buf.len()
        && buf.iter()
            .rev()
            .take(padding_len)
            .all(|&b| b == final_byte)
}

#[test]
fn test_is_valid_pkcs_7() {
    assert!(is_valid_pkcs_7(b"ICE ICE BABY\x04\x04\x04\x04", 16));
    assert!(!is_valid_pkcs_7(b"ICE ICE BABY\x05\x05\x05\x05", 16));
    assert!(!is_valid_pkcs_7(b"ICE ICE BABY\x01\x02\x03\x04", 16));
    assert!(!is_valid_pkcs_7(b"ICE ICE BABY\x00", 16));
    assert!(!is_valid_pkcs_7(b"", 16));
    assert!(!is_valid_pkcs_7(b"\x03\x03", 16));

    // Inclusive upper bound: a full block of padding is valid
    assert!(is_valid_pkcs_7(&[16u8; 16], 16));
    assert!(!is_valid_pkcs_7(&[17u8; 17], 16));
}

// Buffers whose final byte exceeds their length come back untouched
pub fn strip_pad_pkcs_7(buf: &[u8]) -> Vec<u8> {
    match buf.last() {
        Some(&final_byte) if (final_byte as usize) <= buf.len() => {
            buf[..buf.len() - final_byte as usize].to_vec()
        }
        _ => buf.to_vec(),
    }
}

#[test]
fn test_strip_pad_pkcs_7() {
    assert_eq!(b"ICE ICE BABY".to_vec(), strip_pad_pkcs_7(b"ICE ICE BABY\x04\x04\x04\x04"));
    assert_eq!(b"\x09\x09".to_vec(), strip_pad_pkcs_7(b"\x09\x09"));
    assert_eq!(Vec::<u8>::new(), strip_pad_pkcs_7(b""));
    assert_eq!(Vec::<u8>::new(), strip_pad_pkcs_7(&[2, 2]));
}

#[test]
fn test_pad_then_strip_all_block_sizes() {
    let data: Vec<u8> = (0..70u8).collect();
    for block_size in 1..=255 {
        for len in [0, 1, block_size - 1, block_size, 69] {
            let buf = &data[..len.min(data.len())];
            let padded = pad_pkcs_7(buf, block_size).unwrap();
            assert_eq!(0, padded.len() % block_size);
            assert!(is_valid_pkcs_7(&padded, block_size));
            assert_eq!(buf.to_vec(), strip_pad_pkcs_7(&padded));
        }
    }
}

pub fn repeating_block(arr: &[u8], size: usize) -> Option<(usize, Vec<u8>)> {
    let mut blocks: HashSet<&[u8]> = HashSet::new();
    for (idx, block) in arr.chunks(size).enumerate() {
        if blocks.contains(block) {
            return Some((idx, block.to_vec()));
        }
        blocks.insert(block);
    }
    None
}

#[test]
fn test_repeating_block() {
    let arr = b"aaabbbcccaaa";
    assert_eq!(Some((3, b"aaa".to_vec())), repeating_block(arr, 3));
    assert_eq!(None,                       repeating_block(arr, 4));
}

// The block of an oracle response starting at `offset`
pub(crate) fn block_at(buf: &[u8], offset: usize, block_size: usize) -> Result<&[u8]> {
    buf.get(offset..offset + block_size)
        .context(ResponseTooShortSnafu { len: buf.len(), needed: offset + block_size })
}

#[test]
fn test_block_at() {
    let buf = b"aaaabbbbcc";
    assert_eq!(b"bbbb", block_at(buf, 4, 4).unwrap());
    assert_eq!(b"abbb", block_at(buf, 3, 4).unwrap());
    assert!(matches!(
        block_at(buf, 8, 4),
        Err(crate::util::Error::ResponseTooShort { len: 10, needed: 12 })
    ));
}

pub fn generate_random_bytes<const N: usize>(rng: &mut impl Rng) -> [u8; N] {
    let mut data = [0u8; N];
    rng.fill(&mut data[..]);
    data
}

pub fn random_bytes_in_range(rng: &mut impl Rng, min: usize, max: usize) -> Vec<u8> {
    let len = rng.gen_range(min..=max);
    let mut data = vec![0u8; len];
    rng.fill(data.as_mut_slice());
    data
}

#[test]
fn test_random_bytes_are_seeded() {
    use rand::{rngs::StdRng, SeedableRng};

    let a: [u8; 16] = generate_random_bytes(&mut StdRng::seed_from_u64(7));
    let b: [u8; 16] = generate_random_bytes(&mut StdRng::seed_from_u64(7));
    assert_eq!(a, b);

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
        let len = random_bytes_in_range(&mut rng, 5, 10).len();
        assert!((5..=10).contains(&len));
    }
}
