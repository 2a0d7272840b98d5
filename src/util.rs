use base64::{Engine as _, engine::general_purpose};
use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("block size {block_size} is outside 1..=255"))]
    InvalidBlockSize { block_size: usize },

    #[snafu(display("length {len} is not a multiple of the block size {block_size}"))]
    InvalidLength { len: usize, block_size: usize },

    #[snafu(display("ciphertext of {len} bytes needs at least two blocks of {block_size}"))]
    CiphertextTooShort { len: usize, block_size: usize },

    #[snafu(display("key of {len} bytes, expected {expected}"))]
    InvalidKey { len: usize, expected: usize },

    #[snafu(display("ciphertext length never changed after {tried} extra input bytes"))]
    NoBlockSizeChange { tried: usize },

    #[snafu(display("{initial_len} byte response grew after {input_size_to_full_padding} input bytes; the oracle does not pad"))]
    OracleNotPadding { initial_len: usize, input_size_to_full_padding: usize },

    #[snafu(display("no aligned run of identical blocks found for block size {block_size}"))]
    PrefixNotFound { block_size: usize },

    #[snafu(display("no lookup table entry matched the target block for byte {position}"))]
    NoTableMatch { position: usize },

    #[snafu(display("oracle returned {len} bytes, needed at least {needed}"))]
    ResponseTooShort { len: usize, needed: usize },

    #[snafu(display("recovered {recovered} bytes without reaching valid padding"))]
    SecretNotTerminated { recovered: usize },

    #[snafu(display("no guess produced valid padding for block {block}, byte {position}"))]
    NoValidGuess { block: usize, position: usize },

    #[snafu(display("profile has no {field} field"))]
    MissingField { field: String },

    #[snafu(display("block cipher failure: {source}"))]
    Crypto { source: openssl::error::ErrorStack },

    #[snafu(display("base64 decoding failed: {source}"))]
    Decode { source: base64::DecodeError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub fn b64_to_bytes(input: &str) -> Result<Vec<u8>> {
    let stripped: String = input.split_whitespace().collect();
    general_purpose::STANDARD
        .decode(stripped)
        .context(DecodeSnafu)
}

#[test]
fn test_b64_to_bytes() {
    let case = "SSdtIGtpbGxpbmcgeW91ciBicmFpbiBs\naWtlIGEgcG9pc29ub3VzIG11c2hyb29t";
    let expected = b"I'm killing your brain like a poisonous mushroom".to_vec();
    assert_eq!(expected, b64_to_bytes(case).unwrap());
    assert!(matches!(b64_to_bytes("not*base64"), Err(Error::Decode { .. })));
}
