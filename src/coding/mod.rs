//! Coding Configuration
//!
//! The immutable recipe a tier applies to every chunk it stores: which
//! digests identify content and fragments, how chunk bytes are compressed and
//! encrypted, and how the ciphertext is split into data, parity and local
//! reconstruction (LRC) fragments.
//!
//! The parity layout is a tagged variant so that LRC fields only exist when
//! the scheme actually uses them:
//!
//! ```text
//! Mirror                      data frags only, redundancy from replicas
//! Erasure { parity }          k data + m global parity
//! ErasureWithLrc { .. }       k data + m global parity + local parity per group
//! ```
//!
//! Configurations are validated when built and when deserialized; an invalid
//! combination never reaches the encoder.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};

/// Largest shard set the GF(2^8) Reed-Solomon coder supports.
pub const MAX_TOTAL_FRAGS: u32 = 256;

// =============================================================================
// Algorithm Selectors
// =============================================================================

/// Digest algorithm for chunk content and fragment integrity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestType {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestType {
    /// Compute the digest of `data`.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestType::Sha256 => Sha256::digest(data).to_vec(),
            DigestType::Sha384 => Sha384::digest(data).to_vec(),
            DigestType::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// Digest output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            DigestType::Sha256 => 32,
            DigestType::Sha384 => 48,
            DigestType::Sha512 => 64,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DigestType::Sha256 => "sha256",
            DigestType::Sha384 => "sha384",
            DigestType::Sha512 => "sha512",
        }
    }
}

impl std::fmt::Display for DigestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Compression applied to chunk bytes before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressType {
    Lz4,
    Zlib,
}

impl CompressType {
    pub fn name(&self) -> &'static str {
        match self {
            CompressType::Lz4 => "lz4",
            CompressType::Zlib => "zlib",
        }
    }
}

/// Cipher applied to the compressed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherType {
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl CipherType {
    pub fn name(&self) -> &'static str {
        match self {
            CipherType::Aes256Gcm => "aes-256-gcm",
        }
    }
}

/// Parity computation used for global or local parity fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParityType {
    /// Reed-Solomon over GF(2^8), any number of parity frags
    #[default]
    ReedSolomon,
    /// Plain XOR, exactly one parity frag
    Xor,
}

/// Parity layout of a coding configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum ParityScheme {
    /// No parity, redundancy comes from replicas only
    Mirror,
    /// Global parity only
    Erasure {
        parity_frags: u32,
        #[serde(default)]
        parity_type: ParityType,
    },
    /// Global parity plus local parity per group of `lrc_group` data frags
    ErasureWithLrc {
        parity_frags: u32,
        #[serde(default)]
        parity_type: ParityType,
        lrc_group: u32,
        lrc_frags: u32,
        #[serde(default)]
        lrc_type: ParityType,
    },
}

// =============================================================================
// Coding Configuration
// =============================================================================

/// Stable identity of a coding configuration (hex SHA-256 of its canonical form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodingConfigId(pub String);

impl std::fmt::Display for CodingConfigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable, validated coding configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCodingConfig", into = "RawCodingConfig")]
pub struct CodingConfig {
    replicas: u32,
    digest_type: DigestType,
    frag_digest_type: DigestType,
    compress_type: Option<CompressType>,
    cipher_type: Option<CipherType>,
    data_frags: u32,
    parity: ParityScheme,
}

/// Unvalidated shape used for (de)serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCodingConfig {
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub digest_type: DigestType,
    #[serde(default)]
    pub frag_digest_type: DigestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress_type: Option<CompressType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_type: Option<CipherType>,
    pub data_frags: u32,
    pub parity: ParityScheme,
}

fn default_replicas() -> u32 {
    1
}

impl TryFrom<RawCodingConfig> for CodingConfig {
    type Error = Error;

    fn try_from(raw: RawCodingConfig) -> Result<Self> {
        let config = CodingConfig {
            replicas: raw.replicas,
            digest_type: raw.digest_type,
            frag_digest_type: raw.frag_digest_type,
            compress_type: raw.compress_type,
            cipher_type: raw.cipher_type,
            data_frags: raw.data_frags,
            parity: raw.parity,
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<CodingConfig> for RawCodingConfig {
    fn from(c: CodingConfig) -> Self {
        RawCodingConfig {
            replicas: c.replicas,
            digest_type: c.digest_type,
            frag_digest_type: c.frag_digest_type,
            compress_type: c.compress_type,
            cipher_type: c.cipher_type,
            data_frags: c.data_frags,
            parity: c.parity,
        }
    }
}

impl CodingConfig {
    /// Start building a replicated (no parity) configuration.
    pub fn mirror(replicas: u32) -> CodingConfigBuilder {
        CodingConfigBuilder::new(1, ParityScheme::Mirror).replicas(replicas)
    }

    /// Start building a k+m erasure configuration.
    pub fn erasure(data_frags: u32, parity_frags: u32) -> CodingConfigBuilder {
        CodingConfigBuilder::new(
            data_frags,
            ParityScheme::Erasure {
                parity_frags,
                parity_type: ParityType::ReedSolomon,
            },
        )
    }

    /// Start building a k+m erasure configuration with local reconstruction groups.
    pub fn erasure_with_lrc(
        data_frags: u32,
        parity_frags: u32,
        lrc_group: u32,
        lrc_frags: u32,
    ) -> CodingConfigBuilder {
        let lrc_type = if lrc_frags == 1 {
            ParityType::Xor
        } else {
            ParityType::ReedSolomon
        };
        CodingConfigBuilder::new(
            data_frags,
            ParityScheme::ErasureWithLrc {
                parity_frags,
                parity_type: ParityType::ReedSolomon,
                lrc_group,
                lrc_frags,
                lrc_type,
            },
        )
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidCodingConfig(msg));

        if self.data_frags == 0 {
            return invalid("data_frags must be at least 1".to_string());
        }
        if self.replicas == 0 {
            return invalid("replicas must be at least 1".to_string());
        }

        let check_parity = |count: u32, ptype: ParityType, what: &str| -> Result<()> {
            if count == 0 {
                return Err(Error::InvalidCodingConfig(format!(
                    "{} must be at least 1 for an erasure scheme",
                    what
                )));
            }
            if ptype == ParityType::Xor && count != 1 {
                return Err(Error::InvalidCodingConfig(format!(
                    "xor parity supports exactly one frag, got {} {}",
                    count, what
                )));
            }
            Ok(())
        };

        match &self.parity {
            ParityScheme::Mirror => {}
            ParityScheme::Erasure {
                parity_frags,
                parity_type,
            } => check_parity(*parity_frags, *parity_type, "parity_frags")?,
            ParityScheme::ErasureWithLrc {
                parity_frags,
                parity_type,
                lrc_group,
                lrc_frags,
                lrc_type,
            } => {
                check_parity(*parity_frags, *parity_type, "parity_frags")?;
                check_parity(*lrc_frags, *lrc_type, "lrc_frags")?;
                if *lrc_group == 0 || self.data_frags % lrc_group != 0 {
                    return invalid(format!(
                        "lrc_group {} must evenly divide data_frags {}",
                        lrc_group, self.data_frags
                    ));
                }
                if *lrc_group + lrc_frags > MAX_TOTAL_FRAGS {
                    return invalid(format!(
                        "lrc group of {} + {} exceeds {} frags",
                        lrc_group, lrc_frags, MAX_TOTAL_FRAGS
                    ));
                }
            }
        }

        if self.data_frags + self.parity_frags() > MAX_TOTAL_FRAGS {
            return invalid(format!(
                "data_frags + parity_frags = {} exceeds {}",
                self.data_frags + self.parity_frags(),
                MAX_TOTAL_FRAGS
            ));
        }

        Ok(())
    }

    pub fn replicas(&self) -> u32 {
        self.replicas
    }

    pub fn digest_type(&self) -> DigestType {
        self.digest_type
    }

    pub fn frag_digest_type(&self) -> DigestType {
        self.frag_digest_type
    }

    pub fn compress_type(&self) -> Option<CompressType> {
        self.compress_type
    }

    pub fn cipher_type(&self) -> Option<CipherType> {
        self.cipher_type
    }

    pub fn data_frags(&self) -> u32 {
        self.data_frags
    }

    pub fn parity(&self) -> &ParityScheme {
        &self.parity
    }

    /// Number of global parity frags (0 for mirror schemes).
    pub fn parity_frags(&self) -> u32 {
        match &self.parity {
            ParityScheme::Mirror => 0,
            ParityScheme::Erasure { parity_frags, .. }
            | ParityScheme::ErasureWithLrc { parity_frags, .. } => *parity_frags,
        }
    }

    pub fn parity_type(&self) -> Option<ParityType> {
        match &self.parity {
            ParityScheme::Mirror => None,
            ParityScheme::Erasure { parity_type, .. }
            | ParityScheme::ErasureWithLrc { parity_type, .. } => Some(*parity_type),
        }
    }

    /// LRC layout as `(group size, local parity frags per group, parity type)`.
    pub fn lrc(&self) -> Option<(u32, u32, ParityType)> {
        match &self.parity {
            ParityScheme::ErasureWithLrc {
                lrc_group,
                lrc_frags,
                lrc_type,
                ..
            } => Some((*lrc_group, *lrc_frags, *lrc_type)),
            _ => None,
        }
    }

    /// Number of LRC groups (0 without LRC).
    pub fn lrc_groups(&self) -> u32 {
        self.lrc()
            .map(|(group, _, _)| self.data_frags / group)
            .unwrap_or(0)
    }

    /// Total local parity frags across all groups.
    pub fn lrc_frags_total(&self) -> u32 {
        self.lrc()
            .map(|(_, frags, _)| self.lrc_groups() * frags)
            .unwrap_or(0)
    }

    /// Total frags a chunk coded with this configuration owns.
    pub fn total_frags(&self) -> u32 {
        self.data_frags + self.parity_frags() + self.lrc_frags_total()
    }

    /// Stable content-derived identity of this configuration.
    pub fn id(&self) -> CodingConfigId {
        let raw: RawCodingConfig = self.clone().into();
        // Field order is fixed by the struct definition, so the JSON is canonical.
        let canonical = serde_json::to_vec(&raw).unwrap_or_default();
        CodingConfigId(hex::encode(Sha256::digest(&canonical)))
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`CodingConfig`]; `build()` validates.
#[derive(Debug, Clone)]
pub struct CodingConfigBuilder {
    raw: RawCodingConfig,
}

impl CodingConfigBuilder {
    fn new(data_frags: u32, parity: ParityScheme) -> Self {
        Self {
            raw: RawCodingConfig {
                replicas: 1,
                digest_type: DigestType::Sha256,
                frag_digest_type: DigestType::Sha256,
                compress_type: None,
                cipher_type: None,
                data_frags,
                parity,
            },
        }
    }

    pub fn replicas(mut self, replicas: u32) -> Self {
        self.raw.replicas = replicas;
        self
    }

    pub fn data_frags(mut self, data_frags: u32) -> Self {
        self.raw.data_frags = data_frags;
        self
    }

    pub fn digest_type(mut self, digest_type: DigestType) -> Self {
        self.raw.digest_type = digest_type;
        self
    }

    pub fn frag_digest_type(mut self, digest_type: DigestType) -> Self {
        self.raw.frag_digest_type = digest_type;
        self
    }

    pub fn compress(mut self, compress_type: CompressType) -> Self {
        self.raw.compress_type = Some(compress_type);
        self
    }

    pub fn cipher(mut self, cipher_type: CipherType) -> Self {
        self.raw.cipher_type = Some(cipher_type);
        self
    }

    /// Use XOR instead of Reed-Solomon for the global parity.
    pub fn xor_parity(mut self) -> Self {
        match &mut self.raw.parity {
            ParityScheme::Erasure { parity_type, .. }
            | ParityScheme::ErasureWithLrc { parity_type, .. } => *parity_type = ParityType::Xor,
            ParityScheme::Mirror => {}
        }
        self
    }

    pub fn build(self) -> Result<CodingConfig> {
        CodingConfig::try_from(self.raw)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_erasure_config_counts() {
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        assert_eq!(config.data_frags(), 4);
        assert_eq!(config.parity_frags(), 2);
        assert_eq!(config.lrc_frags_total(), 0);
        assert_eq!(config.total_frags(), 6);
        assert_eq!(config.replicas(), 1);
    }

    #[test]
    fn test_lrc_config_counts() {
        let config = CodingConfig::erasure_with_lrc(6, 2, 3, 1).build().unwrap();
        assert_eq!(config.lrc_groups(), 2);
        assert_eq!(config.lrc_frags_total(), 2);
        assert_eq!(config.total_frags(), 10);
        assert_eq!(config.lrc(), Some((3, 1, ParityType::Xor)));
    }

    #[test]
    fn test_mirror_config() {
        let config = CodingConfig::mirror(3).build().unwrap();
        assert_eq!(config.total_frags(), 1);
        assert_eq!(config.parity_type(), None);
        assert_eq!(config.replicas(), 3);
    }

    #[test]
    fn test_rejects_zero_data_frags() {
        let err = CodingConfig::erasure(0, 2).build().unwrap_err();
        assert_matches!(err, Error::InvalidCodingConfig(_));
    }

    #[test]
    fn test_rejects_zero_replicas() {
        assert_matches!(
            CodingConfig::mirror(0).build(),
            Err(Error::InvalidCodingConfig(_))
        );
    }

    #[test]
    fn test_rejects_erasure_without_parity() {
        assert_matches!(
            CodingConfig::erasure(4, 0).build(),
            Err(Error::InvalidCodingConfig(_))
        );
    }

    #[test]
    fn test_rejects_uneven_lrc_group() {
        assert_matches!(
            CodingConfig::erasure_with_lrc(6, 2, 4, 1).build(),
            Err(Error::InvalidCodingConfig(_))
        );
    }

    #[test]
    fn test_rejects_multi_frag_xor() {
        assert_matches!(
            CodingConfig::erasure(4, 2).xor_parity().build(),
            Err(Error::InvalidCodingConfig(_))
        );
        assert!(CodingConfig::erasure(4, 1).xor_parity().build().is_ok());
    }

    #[test]
    fn test_rejects_oversized_shard_set() {
        assert_matches!(
            CodingConfig::erasure(250, 10).build(),
            Err(Error::InvalidCodingConfig(_))
        );
    }

    #[test]
    fn test_id_is_stable_and_distinguishes_configs() {
        let a = CodingConfig::erasure(4, 2).build().unwrap();
        let b = CodingConfig::erasure(4, 2).build().unwrap();
        let c = CodingConfig::erasure(4, 2)
            .compress(CompressType::Lz4)
            .build()
            .unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().0.len(), 64);
    }

    #[test]
    fn test_deserialize_validates() {
        let yaml = "data_frags: 4\nparity:\n  scheme: erasure\n  parity_frags: 0\n";
        let parsed: std::result::Result<CodingConfig, _> = serde_yaml::from_str(yaml);
        assert!(parsed.is_err());

        let yaml = "data_frags: 4\ncompress_type: lz4\ncipher_type: aes-256-gcm\nparity:\n  scheme: erasure\n  parity_frags: 2\n";
        let parsed: CodingConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.total_frags(), 6);
        assert_eq!(parsed.compress_type(), Some(CompressType::Lz4));
        assert_eq!(parsed.cipher_type(), Some(CipherType::Aes256Gcm));
    }

    #[test]
    fn test_digest_lengths() {
        for dt in [DigestType::Sha256, DigestType::Sha384, DigestType::Sha512] {
            assert_eq!(dt.digest(b"abc").len(), dt.output_len());
        }
    }
}
