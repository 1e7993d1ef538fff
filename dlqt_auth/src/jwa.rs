//! Accepted JSON Web Algorithms
//!
//! Only the RSA family is accepted. Every other name that may appear in a
//! token header (`none`, `HS256`, `ES256`, …) is rejected while parsing, which
//! keeps symmetric or unsigned tokens from ever reaching key selection.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error;

/// RSA public/private key signing algorithms
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[allow(clippy::upper_case_acronyms)]
pub enum Algorithm {
    /// RSASSA-PKCS1-v1_5 using SHA-256
    RS256,
    /// RSASSA-PKCS1-v1_5 using SHA-384
    RS384,
    /// RSASSA-PKCS1-v1_5 using SHA-512
    RS512,
    /// RSASSA-PSS using SHA-256 and MGF1 with SHA-256
    PS256,
    /// RSASSA-PSS using SHA-384 and MGF1 with SHA-384
    PS384,
    /// RSASSA-PSS using SHA-512 and MGF1 with SHA-512
    PS512,
}

impl Algorithm {
    /// Every accepted algorithm
    pub const ALL: [Algorithm; 6] = [
        Algorithm::RS256,
        Algorithm::RS384,
        Algorithm::RS512,
        Algorithm::PS256,
        Algorithm::PS384,
        Algorithm::PS512,
    ];

    /// The registered name of the algorithm, as it appears in a token header
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Algorithm::RS256 => "RS256",
            Algorithm::RS384 => "RS384",
            Algorithm::RS512 => "RS512",
            Algorithm::PS256 => "PS256",
            Algorithm::PS384 => "PS384",
            Algorithm::PS512 => "PS512",
        }
    }

    pub(crate) fn verification_params(self) -> &'static ring::signature::RsaParameters {
        match self {
            Algorithm::RS256 => &ring::signature::RSA_PKCS1_2048_8192_SHA256,
            Algorithm::RS384 => &ring::signature::RSA_PKCS1_2048_8192_SHA384,
            Algorithm::RS512 => &ring::signature::RSA_PKCS1_2048_8192_SHA512,
            Algorithm::PS256 => &ring::signature::RSA_PSS_2048_8192_SHA256,
            Algorithm::PS384 => &ring::signature::RSA_PSS_2048_8192_SHA384,
            Algorithm::PS512 => &ring::signature::RSA_PSS_2048_8192_SHA512,
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn signing_params(self) -> &'static dyn ring::signature::RsaEncoding {
        match self {
            Algorithm::RS256 => &ring::signature::RSA_PKCS1_SHA256,
            Algorithm::RS384 => &ring::signature::RSA_PKCS1_SHA384,
            Algorithm::RS512 => &ring::signature::RSA_PKCS1_SHA512,
            Algorithm::PS256 => &ring::signature::RSA_PSS_SHA256,
            Algorithm::PS384 => &ring::signature::RSA_PSS_SHA384,
            Algorithm::PS512 => &ring::signature::RSA_PSS_SHA512,
        }
    }
}

impl FromStr for Algorithm {
    type Err = error::UnsupportedAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Header values are case-sensitive; `rs256` is not `RS256`.
        Self::ALL
            .iter()
            .copied()
            .find(|alg| alg.as_str() == s)
            .ok_or_else(|| error::unsupported_algorithm(s))
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;

    #[test]
    fn parses_every_rsa_algorithm() -> Result<()> {
        for alg in Algorithm::ALL {
            assert_eq!(alg.as_str().parse::<Algorithm>()?, alg);
        }
        Ok(())
    }

    #[test]
    fn rejects_symmetric_and_unsigned_algorithms() {
        for name in ["none", "HS256", "HS512", "ES256", "EdDSA", "rs256", ""] {
            let err = name.parse::<Algorithm>().unwrap_err();
            assert_eq!(err.alg(), name);
        }
    }
}
