pub mod cipher;
pub mod common;
pub mod xor;
pub mod ecb;
pub mod cbc;
pub mod ctr;
pub mod oracle;
pub mod probe;

#[cfg(test)]
mod generic_tests {
    use rand::{rngs::StdRng, SeedableRng};

    use crate::crypto::cbc::encrypt_cbc;
    use crate::crypto::cbc::padding::{attack_cbc_padding, PaddingOracle};
    use crate::crypto::cipher::{Aes128, BlockCipher, TripleDes};
    use crate::crypto::ecb::byte_by_byte::{recover_suffix, recover_suffix_with_prefix};
    use crate::crypto::ecb::encrypt_ecb;
    use crate::crypto::oracle::{EncryptionOracle, Mode, Oracle};
    use crate::crypto::probe::{detect_ecb, discover_block_size, discover_prefix_length, ecb_score, sniff_mode};
    use crate::util::*;

    #[test]
    fn test_detect_ecb_among_cbc() {
        let mut rng = StdRng::seed_from_u64(8);
        let cipher = Aes128::random(&mut rng);
        let plaintext = [b"YELLOW SUBMARINE".repeat(3), b"and a tail".to_vec()].concat();
        let mut ciphertexts: Vec<Vec<u8>> = (0..10u8)
            .map(|i| encrypt_cbc(&cipher, &plaintext, &[i; 16]).unwrap())
            .collect();
        ciphertexts.insert(6, encrypt_ecb(&cipher, &plaintext).unwrap());

        let found: Vec<usize> = ciphertexts.iter()
            .enumerate()
            .filter(|(_, ct)| detect_ecb(ct, 16))
            .map(|(idx, _)| idx)
            .collect();
        assert_eq!(vec![6], found);
        assert_eq!(3, ecb_score(&ciphertexts[6], 16));
    }

    // Learn the oracle's structure, then pick the attack that fits
    fn inspect_and_recover(oracle: &dyn Oracle) -> Result<Vec<u8>> {
        let info = discover_block_size(oracle)?;
        assert_eq!(Mode::Ecb, sniff_mode(oracle, info.block_size)?);
        match discover_prefix_length(oracle, info.block_size)? {
            0 => recover_suffix(oracle, &info),
            _ => recover_suffix_with_prefix(oracle),
        }
    }

    #[test]
    fn test_discover_then_recover() {
        let mut rng = StdRng::seed_from_u64(2024);
        let secret = b"Quick to the point, to the point, no faking\n";
        for _ in 0..4 {
            let ciphers: [Box<dyn BlockCipher>; 2] =
                [Box::new(Aes128::random(&mut rng)), Box::new(TripleDes::random(&mut rng))];
            for cipher in ciphers {
                let oracle = EncryptionOracle::ecb_suffix_with_random_prefix::<0, 40>(cipher, secret, &mut rng);
                assert_eq!(secret.to_vec(), inspect_and_recover(&oracle).unwrap());
            }
        }
    }

    #[test]
    fn test_padding_oracle_on_triple_des() {
        let mut rng = StdRng::seed_from_u64(2025);
        let plaintext = b"Cooking MC's like a pound of bacon";
        let oracle = PaddingOracle::new(Box::new(TripleDes::random(&mut rng)), plaintext, &mut rng);
        let ciphertext = oracle.ciphertext().unwrap();
        let result = attack_cbc_padding(&ciphertext, 8, &|buf: &[u8]| oracle.is_valid_padding(buf)).unwrap();
        assert_eq!(plaintext.to_vec(), result);
    }
}
