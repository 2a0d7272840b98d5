use std::collections::HashMap;

use log::debug;
use snafu::{ensure, OptionExt};

use crate::crypto::cipher::BlockCipher;
use crate::crypto::common::{block_at, pad_pkcs_7};
use crate::crypto::ecb::{decrypt_ecb, encrypt_ecb};
use crate::crypto::oracle::Oracle;
use crate::crypto::probe::FILLER;
use crate::util::{InvalidBlockSizeSnafu, MissingFieldSnafu, ResponseTooShortSnafu, Result};
#[cfg(test)]
use crate::crypto::cipher::{random_cipher, Aes128};
#[cfg(test)]
use crate::util::Error;
#[cfg(test)]
use rand::{rngs::StdRng, SeedableRng};
#[cfg(test)]
use rstest::rstest;

const EMAIL_FIELD: &[u8] = b"email=";
// Everything an encoded profile holds before the role value, with an empty email
const ROLE_BOUNDARY: &[u8] = b"email=&uid=10&role=";
const DEFAULT_UID: &[u8] = b"10";
const DEFAULT_ROLE: &[u8] = b"user";
pub const ADMIN_ROLE: &[u8] = b"admin";

#[derive(Debug, PartialEq, Eq)]
pub struct Profile {
    pub email: Vec<u8>,
    pub uid: Vec<u8>,
    pub role: Vec<u8>,
}

impl Profile {
    // Metacharacters are dropped so the email cannot add its own fields
    pub fn for_email(email: &[u8]) -> Profile {
        Profile {
            email: email.iter().copied().filter(|&b| b != b'&' && b != b'=').collect(),
            uid: DEFAULT_UID.to_vec(),
            role: DEFAULT_ROLE.to_vec(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        [
            EMAIL_FIELD, self.email.as_slice(),
            &b"&uid="[..], self.uid.as_slice(),
            &b"&role="[..], self.role.as_slice(),
        ].concat()
    }

    pub fn decode(buf: &[u8]) -> Result<Profile> {
        let mut fields = parse_key_value(buf);
        let mut take = |field: &str| fields.remove(field.as_bytes()).context(MissingFieldSnafu { field });
        Ok(Profile {
            email: take("email")?,
            uid: take("uid")?,
            role: take("role")?,
        })
    }
}

// foo=bar&baz=qux. A key without `=` maps to an empty value, only the first
// `=` splits, and the first occurrence of a key wins.
pub fn parse_key_value(buf: &[u8]) -> HashMap<Vec<u8>, Vec<u8>> {
    let mut fields = HashMap::new();
    for pair in buf.split(|&b| b == b'&') {
        let mut parts = pair.splitn(2, |&b| b == b'=');
        let key = parts.next().unwrap_or_default().to_vec();
        let value = parts.next().unwrap_or_default().to_vec();
        fields.entry(key).or_insert(value);
    }
    fields
}

// Encodes the profile for an attacker-chosen email and ECB-encrypts it under a
// key fixed at construction
pub struct ProfileOracle {
    cipher: Box<dyn BlockCipher>,
}

impl ProfileOracle {
    pub fn new(cipher: Box<dyn BlockCipher>) -> Self {
        ProfileOracle { cipher }
    }

    pub fn role_of(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let encoded = decrypt_ecb(self.cipher.as_ref(), ciphertext)?;
        Ok(Profile::decode(&encoded)?.role)
    }
}

impl Oracle for ProfileOracle {
    fn encrypt(&self, email: &[u8]) -> Result<Vec<u8>> {
        encrypt_ecb(self.cipher.as_ref(), &Profile::for_email(email).encode())
    }
}

// Two queries. The first lines up pad("admin") on a block boundary right after
// `email=` and cuts that block out. The second picks an email length that ends
// a block exactly at `role=`; the trailing `user` block is swapped for the
// admin block.
pub fn forge_admin_profile(oracle: &dyn Oracle, block_size: usize) -> Result<Vec<u8>> {
    ensure!(block_size > ADMIN_ROLE.len(), InvalidBlockSizeSnafu { block_size });

    let align = (block_size - EMAIL_FIELD.len() % block_size) % block_size;
    let payload = [vec![FILLER; align], pad_pkcs_7(ADMIN_ROLE, block_size)?].concat();
    let response = oracle.encrypt(&payload)?;
    let admin_block = block_at(&response, EMAIL_FIELD.len() + align, block_size)?;
    debug!("admin block cut at offset {}", EMAIL_FIELD.len() + align);

    let email_len = (block_size - ROLE_BOUNDARY.len() % block_size) % block_size;
    let keep = ROLE_BOUNDARY.len() + email_len;
    let response = oracle.encrypt(&vec![FILLER; email_len])?;
    ensure!(response.len() >= keep, ResponseTooShortSnafu { len: response.len(), needed: keep });

    Ok([&response[..keep], admin_block].concat())
}

#[test]
fn test_profile_for_strips_metacharacters() {
    let profile = Profile::for_email(b"foo@bar.com&role=admin");
    assert_eq!(b"email=foo@bar.comroleadmin&uid=10&role=user".to_vec(), profile.encode());
}

#[test]
fn test_parse_key_value() {
    let fields = parse_key_value(b"foo=bar&baz=qux&zap=zazzle");
    assert_eq!(3, fields.len());
    assert_eq!(Some(&b"qux".to_vec()), fields.get(b"baz".as_slice()));

    let fields = parse_key_value(b"role=user&role=admin&flag&eq=a=b");
    assert_eq!(Some(&b"user".to_vec()), fields.get(b"role".as_slice()));
    assert_eq!(Some(&Vec::new()), fields.get(b"flag".as_slice()));
    assert_eq!(Some(&b"a=b".to_vec()), fields.get(b"eq".as_slice()));
}

#[test]
fn test_profile_decode() {
    let profile = Profile::for_email(b"me@example.com");
    assert_eq!(profile, Profile::decode(&profile.encode()).unwrap());
    assert!(matches!(
        Profile::decode(b"email=me@example.com&uid=10"),
        Err(Error::MissingField { field }) if field == "role"
    ));
}

#[test]
fn test_profile_oracle_keeps_user_role() {
    let mut rng = StdRng::seed_from_u64(30);
    let oracle = ProfileOracle::new(Box::new(Aes128::random(&mut rng)));
    let ciphertext = oracle.encrypt(b"me@example.com&role=admin").unwrap();
    assert_eq!(DEFAULT_ROLE.to_vec(), oracle.role_of(&ciphertext).unwrap());
}

#[cfg(test)]
#[rstest]
#[case(16)]
#[case(8)]
fn test_forge_admin_profile(#[case] block_size: usize) {
    let mut rng = StdRng::seed_from_u64(block_size as u64 + 30);
    for _ in 0..5 {
        let oracle = ProfileOracle::new(random_cipher(block_size, &mut rng));
        let forged = forge_admin_profile(&oracle, block_size).unwrap();
        assert_eq!(ADMIN_ROLE.to_vec(), oracle.role_of(&forged).unwrap());
    }
}

#[test]
fn test_forge_admin_profile_needs_room_for_role() {
    let oracle = |_: &[u8]| -> Result<Vec<u8>> { Ok(vec![0; 40]) };
    assert!(matches!(
        forge_admin_profile(&oracle, 5),
        Err(Error::InvalidBlockSize { block_size: 5 })
    ));
}
