//! Fixtures and a token mint for tests
//!
//! Two RSA-2048 signing keys are checked in under `data/rsa/`. `JWKS`
//! publishes only the first; `ROTATED_JWKS` publishes both, as a provider
//! would after rotating in a new key.
//!
//! `KNOWN_ANSWER_TOKEN` was signed once with the first key and is never
//! regenerated. It is valid at `KNOWN_ANSWER_TIME`.

#![allow(missing_docs, clippy::missing_panics_doc)]

use ring::{rand::SystemRandom, signature::RsaKeyPair};

use crate::{
    clock::UnixTime,
    jwa::Algorithm,
    jwk::{KeyId, KeyIdRef, KeySet, VerificationKey},
    jwt::{ClaimSet, Header, Token},
};

pub const KEY_ID: &str = "dlqt-test-1";
pub const ROTATED_KEY_ID: &str = "dlqt-test-2";

pub const JWKS: &str = include_str!("../data/rsa/jwks.json");
pub const ROTATED_JWKS: &str = include_str!("../data/rsa/jwks-rotated.json");

pub const KNOWN_ANSWER_TOKEN: &str = include_str!("../data/rsa/known-answer.jwt");
pub const KNOWN_ANSWER_TIME: UnixTime = UnixTime(1_700_001_000);

pub const TENANT: &str = "11111111-2222-3333-4444-555555555555";
pub const OTHER_TENANT: &str = "99999999-8888-7777-6666-555555555555";
pub const AUTHORITY_HOST: &str = "login.microsoftonline.com";
pub const ISSUER: &str =
    "https://login.microsoftonline.com/11111111-2222-3333-4444-555555555555/v2.0";
pub const AUDIENCE: &str = "api://dlqt-test";
pub const OBJECT_ID: &str = "6f0c1e3a-0000-4000-8000-000000000001";

const PRIMARY_PKCS8: &[u8] = include_bytes!("../data/rsa/dlqt-test-1.pk8");
const ROTATED_PKCS8: &[u8] = include_bytes!("../data/rsa/dlqt-test-2.pk8");

/// The key set publishing only [`KEY_ID`]
pub fn key_set() -> KeySet {
    serde_json::from_str(JWKS).expect("fixture key set is valid")
}

/// The key set publishing both [`KEY_ID`] and [`ROTATED_KEY_ID`]
pub fn rotated_key_set() -> KeySet {
    serde_json::from_str(ROTATED_JWKS).expect("fixture key set is valid")
}

/// The verification key for one of the fixture key ids
pub fn verification_key(kid: &str) -> VerificationKey {
    rotated_key_set()
        .find_signing_key(KeyIdRef::from_str(kid))
        .expect("fixture key is published")
        .to_verification_key()
        .expect("fixture key is a valid RSA key")
}

/// Claims that pass every check for the fixture tenant and audience
///
/// Valid from `now` for one hour, holding `dlq.fetch` and `dlq.retrigger`.
pub fn claims(now: UnixTime) -> ClaimSet {
    ClaimSet::new()
        .with_issuer(ISSUER)
        .with_audience(AUDIENCE)
        .with_issued_at(now)
        .with_not_before(now)
        .with_expiration(now.saturating_add(3600))
        .with_object_id(OBJECT_ID)
        .with_scp("dlq.fetch dlq.retrigger")
}

/// Signs tokens with one of the checked-in private keys
#[derive(Debug)]
pub struct TokenMint {
    key_pair: RsaKeyPair,
    kid: KeyId,
    rng: SystemRandom,
}

impl TokenMint {
    fn from_pkcs8(der: &[u8], kid: &'static str) -> Self {
        Self {
            key_pair: RsaKeyPair::from_pkcs8(der).expect("fixture private key is valid"),
            kid: KeyId::from_static(kid),
            rng: SystemRandom::new(),
        }
    }

    /// Signs with the key published under [`KEY_ID`]
    pub fn primary() -> Self {
        Self::from_pkcs8(PRIMARY_PKCS8, KEY_ID)
    }

    /// Signs with the key published under [`ROTATED_KEY_ID`]
    pub fn rotated() -> Self {
        Self::from_pkcs8(ROTATED_PKCS8, ROTATED_KEY_ID)
    }

    /// Keeps the private key but advertises a different `kid` in the header
    pub fn with_key_id(mut self, kid: impl Into<KeyId>) -> Self {
        self.kid = kid.into();
        self
    }

    /// Signs `claims` with `alg`, naming this mint's key id
    pub fn sign(&self, alg: Algorithm, claims: &ClaimSet) -> Token {
        let header = Header {
            alg: alg.as_str().to_owned(),
            kid: Some(self.kid.clone()),
            typ: Some("JWT".to_owned()),
        };
        self.sign_with_header(alg, &header, claims)
    }

    /// Signs `claims` with `alg` under an arbitrary header
    ///
    /// The header's `alg` is not required to match `alg`, which allows
    /// building tokens that lie about how they were signed.
    pub fn sign_with_header(&self, alg: Algorithm, header: &Header, claims: &ClaimSet) -> Token {
        let message = format!("{}.{}", encode_json(header), encode_json(claims));

        let mut signature = vec![0; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(alg.signing_params(), &self.rng, message.as_bytes(), &mut signature)
            .expect("signing with a fixture key succeeds");

        Token::new(format!("{message}.{}", encode(&signature)))
    }
}

/// Builds an unsigned token with an arbitrary header, e.g. `alg: none`
pub fn unsigned(header: &Header, claims: &ClaimSet) -> Token {
    Token::new(format!("{}.{}.", encode_json(header), encode_json(claims)))
}

fn encode_json<T: serde::Serialize>(value: &T) -> String {
    encode(&serde_json::to_vec(value).expect("fixture values serialize"))
}

fn encode(bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    URL_SAFE_NO_PAD.encode(bytes)
}
