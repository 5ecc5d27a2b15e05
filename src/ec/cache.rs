//! Encoder cache
//!
//! Building a Reed-Solomon matrix is not free; encoders are built once per
//! coding configuration and shared.

use std::sync::Arc;

use dashmap::DashMap;

use super::fragment::FragmentEncoder;
use crate::coding::{CodingConfig, CodingConfigId};
use crate::error::Result;

#[derive(Default)]
pub struct EncoderCache {
    encoders: DashMap<CodingConfigId, Arc<FragmentEncoder>>,
}

impl EncoderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared encoder for `config`, built on first use.
    pub fn get(&self, config: &CodingConfig) -> Result<Arc<FragmentEncoder>> {
        let id = config.id();
        if let Some(encoder) = self.encoders.get(&id) {
            return Ok(encoder.clone());
        }
        let encoder = Arc::new(FragmentEncoder::new(config)?);
        Ok(self.encoders.entry(id).or_insert(encoder).clone())
    }

    pub fn len(&self) -> usize {
        self.encoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_shared_per_config() {
        let cache = EncoderCache::new();
        let a = CodingConfig::erasure(4, 2).build().unwrap();
        let b = CodingConfig::mirror(3).build().unwrap();

        let first = cache.get(&a).unwrap();
        let again = cache.get(&a).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        cache.get(&b).unwrap();
        assert_eq!(cache.len(), 2);
    }
}
