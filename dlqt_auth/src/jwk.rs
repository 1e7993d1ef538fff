//! Published signing keys and their conversion into verification keys
//!
//! An identity provider publishes its signing keys as a JSON Web Key Set:
//!
//! ```json
//! {"keys":[{"kty":"RSA","use":"sig","kid":"…","n":"…","e":"AQAB"}]}
//! ```
//!
//! Records are kept exactly as published ([`PublishedKey`]) and only turned
//! into a [`VerificationKey`] once a token actually names them.

use aliri_braid::braid;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::{error, jwa};

/// An identifier for a published key
#[braid(serde, ref_doc = "A borrowed reference to a [`KeyId`]")]
pub struct KeyId;

const SIGNING_USE: &str = "sig";
const RSA_KEY_TYPE: &str = "RSA";

/// A single key record as published by the identity provider
///
/// Unrecognized members (`x5c`, `x5t`, `issuer`, …) are ignored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedKey {
    /// Key identifier, unique within one key set
    pub kid: KeyId,

    /// Key type; only `RSA` keys can be converted
    pub kty: String,

    /// Modulus, unpadded base64url big-endian
    pub n: String,

    /// Public exponent, unpadded base64url big-endian
    pub e: String,

    /// Intended use of the key, `sig` for signing keys
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
}

impl PublishedKey {
    /// Whether the key is published for verifying signatures
    #[must_use]
    pub fn is_signing_key(&self) -> bool {
        self.usage.as_deref() == Some(SIGNING_USE)
    }

    /// Materializes the RSA public key described by this record
    ///
    /// # Errors
    ///
    /// Returns an error if the record is not an RSA key or if its
    /// components cannot be decoded.
    pub fn to_verification_key(&self) -> Result<VerificationKey, error::KeyRejected> {
        VerificationKey::try_from(self)
    }
}

/// A set of published keys, fetched and replaced as a unit
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    #[serde(deserialize_with = "deserialize_keys")]
    keys: Vec<PublishedKey>,
}

impl KeySet {
    /// Constructs a key set from a list of key records
    #[must_use]
    pub fn from_keys(keys: Vec<PublishedKey>) -> Self {
        Self { keys }
    }

    /// Adds a key to the set
    pub fn add_key(&mut self, key: PublishedKey) {
        self.keys.push(key);
    }

    /// A view of the keys in this set
    #[must_use]
    pub fn keys(&self) -> &[PublishedKey] {
        &self.keys
    }

    /// The number of keys in this set
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Finds the signing key published under `kid`
    ///
    /// Only keys published with `use` of `sig` are considered. If the
    /// provider publishes the same identifier twice, the first record wins.
    #[must_use]
    pub fn find_signing_key(&self, kid: &KeyIdRef) -> Option<&PublishedKey> {
        self.keys
            .iter()
            .find(|k| &*k.kid == kid && k.is_signing_key())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MaybeKey {
    Key(PublishedKey),
    Unknown(UnknownKey),
}

#[derive(Deserialize)]
struct UnknownKey {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    kty: Option<String>,
}

fn deserialize_keys<'de, D>(deserializer: D) -> Result<Vec<PublishedKey>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct MaybeKeysVisitor;

    impl<'de> serde::de::Visitor<'de> for MaybeKeysVisitor {
        type Value = Vec<PublishedKey>;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a list of published key objects")
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: serde::de::SeqAccess<'de>,
        {
            let mut values = Vec::with_capacity(seq.size_hint().unwrap_or_default());
            let mut index = 0_usize;

            while let Some(value) = seq.next_element()? {
                match value {
                    MaybeKey::Key(key) => values.push(key),
                    MaybeKey::Unknown(key) => {
                        tracing::warn!(
                            jwks.idx = index,
                            jwk.kid = ?key.kid,
                            jwk.kty = ?key.kty,
                            "ignoring unusable key record"
                        );
                    }
                }
                index += 1;
            }

            Ok(values)
        }
    }

    deserializer.deserialize_seq(MaybeKeysVisitor)
}

/// An RSA public key ready to verify signatures
///
/// Owns its components; it does not borrow from the record it was built from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationKey {
    modulus: Vec<u8>,
    exponent: i64,
}

impl VerificationKey {
    /// The big-endian modulus with leading zero bytes removed
    #[must_use]
    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    /// The public exponent
    #[must_use]
    pub fn exponent(&self) -> i64 {
        self.exponent
    }

    /// Verifies `signature` over `message` using the given algorithm
    ///
    /// # Errors
    ///
    /// Returns an error if the signature does not match. A key that `ring`
    /// refuses to use (too small, exponent out of range) never matches.
    pub fn verify(
        &self,
        alg: jwa::Algorithm,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), error::SignatureMismatch> {
        let exponent = self.exponent.to_be_bytes();
        let first = exponent
            .iter()
            .position(|&b| b != 0)
            .unwrap_or(exponent.len() - 1);

        let pk = ring::signature::RsaPublicKeyComponents {
            n: self.modulus.as_slice(),
            e: &exponent[first..],
        };

        pk.verify(alg.verification_params(), message, signature)
            .map_err(|_| error::signature_mismatch())
    }
}

impl TryFrom<&PublishedKey> for VerificationKey {
    type Error = error::KeyRejected;

    fn try_from(key: &PublishedKey) -> Result<Self, Self::Error> {
        if key.kty != RSA_KEY_TYPE {
            return Err(error::KeyRejected::UnsupportedKeyType {
                kty: key.kty.clone(),
            });
        }

        let modulus = decode_component(&key.n, "modulus is not valid base64url")?;
        let modulus = strip_leading_zeros(&modulus);
        if modulus.is_empty() {
            return Err(error::KeyRejected::MalformedKey("modulus is zero"));
        }

        let exponent = decode_component(&key.e, "exponent is not valid base64url")?;
        let exponent = strip_leading_zeros(&exponent);
        if exponent.is_empty() {
            return Err(error::KeyRejected::MalformedKey("exponent is zero"));
        }

        let exponent = exponent_value(exponent)?;

        Ok(Self {
            modulus: modulus.to_vec(),
            exponent,
        })
    }
}

impl TryFrom<PublishedKey> for VerificationKey {
    type Error = error::KeyRejected;

    #[inline]
    fn try_from(key: PublishedKey) -> Result<Self, Self::Error> {
        Self::try_from(&key)
    }
}

fn decode_component(
    encoded: &str,
    reason: &'static str,
) -> Result<Vec<u8>, error::KeyRejected> {
    URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| error::KeyRejected::MalformedKey(reason))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

fn exponent_value(bytes: &[u8]) -> Result<i64, error::KeyRejected> {
    const TOO_LARGE: error::KeyRejected =
        error::KeyRejected::MalformedKey("exponent does not fit in a signed 64-bit integer");

    if bytes.len() > size_of::<i64>() {
        return Err(TOO_LARGE);
    }

    let value = bytes
        .iter()
        .fold(0_u64, |acc, &b| (acc << 8) | u64::from(b));

    i64::try_from(value).map_err(|_| TOO_LARGE)
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use tracing_test::traced_test;

    use super::*;
    use crate::testing;

    const KEYS_WITH_GARBAGE: &str = r#"
        {
            "keys": [
                { "kid": "enc-1", "use": "enc" },
                {},
                { "kty": "RSA", "use": "sig", "kid": "a", "n": "AQAB", "e": "AQAB" }
            ]
        }
    "#;

    fn rsa_key(n: &str, e: &str) -> PublishedKey {
        PublishedKey {
            kid: KeyId::from_static("k"),
            kty: "RSA".into(),
            n: n.into(),
            e: e.into(),
            usage: Some("sig".into()),
        }
    }

    #[test]
    #[traced_test]
    fn decodes_fixture_key_set() -> Result<()> {
        let keys: KeySet = serde_json::from_str(testing::JWKS)?;
        assert_eq!(keys.len(), 1);

        let key = keys
            .find_signing_key(KeyIdRef::from_str(testing::KEY_ID))
            .expect("fixture key is published");
        let verification = key.to_verification_key()?;
        assert_eq!(verification.exponent(), 65537);
        assert_eq!(verification.modulus().len(), 256);
        Ok(())
    }

    #[test]
    #[traced_test]
    fn skips_unusable_records() -> Result<()> {
        let keys: KeySet = serde_json::from_str(KEYS_WITH_GARBAGE)?;
        assert_eq!(keys.len(), 1);
        assert!(logs_contain("ignoring unusable key record"));
        Ok(())
    }

    #[test]
    fn first_matching_signing_key_wins() {
        let mut first = rsa_key("AQAB", "AQAB");
        first.kid = KeyId::from_static("dup");
        let mut second = rsa_key("AQAC", "AQAB");
        second.kid = KeyId::from_static("dup");
        let mut encryption = rsa_key("AQAD", "AQAB");
        encryption.kid = KeyId::from_static("enc");
        encryption.usage = Some("enc".into());

        let keys = KeySet::from_keys(vec![first.clone(), second, encryption]);

        assert_eq!(keys.find_signing_key(KeyIdRef::from_str("dup")), Some(&first));
        assert_eq!(keys.find_signing_key(KeyIdRef::from_str("enc")), None);
        assert_eq!(keys.find_signing_key(KeyIdRef::from_str("missing")), None);
    }

    #[test]
    fn rejects_non_rsa_key_type() {
        let mut key = rsa_key("AQAB", "AQAB");
        key.kty = "EC".into();

        assert_eq!(
            VerificationKey::try_from(&key),
            Err(error::KeyRejected::UnsupportedKeyType { kty: "EC".into() })
        );
    }

    #[test]
    fn rejects_undecodable_components() {
        assert!(matches!(
            VerificationKey::try_from(&rsa_key("not base64!", "AQAB")),
            Err(error::KeyRejected::MalformedKey(_))
        ));
        assert!(matches!(
            VerificationKey::try_from(&rsa_key("AQAB", "AQAB=")),
            Err(error::KeyRejected::MalformedKey(_))
        ));
    }

    #[test]
    fn strips_leading_zero_bytes() -> Result<()> {
        // 0x00 0x00 0x01 0x00 0x01
        let key = VerificationKey::try_from(&rsa_key("AAABAAE", "AAABAAE"))?;
        assert_eq!(key.modulus(), &[0x01, 0x00, 0x01]);
        assert_eq!(key.exponent(), 65537);
        Ok(())
    }

    #[test]
    fn rejects_exponent_wider_than_i64() {
        // nine bytes of 0x01
        let wide = URL_SAFE_NO_PAD.encode([1_u8; 9]);
        assert!(matches!(
            VerificationKey::try_from(&rsa_key("AQAB", &wide)),
            Err(error::KeyRejected::MalformedKey(_))
        ));

        // eight bytes with the top bit set overflows i64
        let high = URL_SAFE_NO_PAD.encode([0x80, 0, 0, 0, 0, 0, 0, 1]);
        assert!(matches!(
            VerificationKey::try_from(&rsa_key("AQAB", &high)),
            Err(error::KeyRejected::MalformedKey(_))
        ));
    }

    #[test]
    fn rejects_zero_exponent() {
        assert_eq!(
            VerificationKey::try_from(&rsa_key("AQAB", "AAAA")),
            Err(error::KeyRejected::MalformedKey("exponent is zero"))
        );
    }
}
