//! Property-Based Tests for Erasure Coding
//!
//! # Test Properties
//!
//! 1. **Roundtrip Correctness**: encode(data) → decode(shards) = data
//! 2. **Fault Tolerance**: any m lost shards are recoverable
//! 3. **Determinism**: without a cipher, same input gives the same frags
//! 4. **Local Repair**: one lost data frag per LRC group needs no global parity

#![cfg(test)]

use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;

use super::encoder::{calculate_shard_size, EcDecoder, EcEncoder};
use super::fragment::FragmentEncoder;
use crate::coding::{CipherType, CodingConfig, CompressType, ParityType};
use crate::model::{BucketId, Chunk, ChunkId, FragIndex, SystemId, TierId};

// =============================================================================
// Property Strategies
// =============================================================================

/// k: 2-4 data shards, m: 1-2 parity shards
fn small_ec_config_strategy() -> impl Strategy<Value = (usize, usize)> {
    (2usize..=4, 1usize..=2)
}

fn small_data_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..2000)
}

fn erasure_strategy(total_shards: usize, max_erasures: usize) -> impl Strategy<Value = Vec<usize>> {
    let max = std::cmp::min(max_erasures, total_shards);
    prop::collection::vec(0..total_shards, 0..=max).prop_map(|mut v| {
        v.sort();
        v.dedup();
        v
    })
}

fn blank_chunk(config: &CodingConfig) -> Chunk {
    Chunk {
        id: ChunkId::new(),
        system_id: SystemId::new("sys"),
        bucket_id: BucketId::new("bucket"),
        tier_id: TierId::new("tier"),
        coding: config.clone(),
        size: 0,
        compress_size: 0,
        frag_size: 0,
        digest: Vec::new(),
        cipher: None,
        dup_chunk_id: None,
        deleted: None,
        frags: Vec::new(),
        is_building_blocks: false,
        is_building_frags: true,
    }
}

// =============================================================================
// Shard Coder Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: any set of at most m erasures is recoverable.
    #[test]
    fn prop_recovers_any_m_erasures(
        ((k, m), erasures) in small_ec_config_strategy()
            .prop_flat_map(|(k, m)| (Just((k, m)), erasure_strategy(k + m, m))),
        data in small_data_strategy(),
    ) {
        let encoder = EcEncoder::new(k, m, ParityType::ReedSolomon)?;
        let decoder = EcDecoder::new(k, m, ParityType::ReedSolomon)?;

        let shards = encoder.encode(&data)?;
        prop_assert_eq!(shards.len(), k + m);
        prop_assert_eq!(shards[0].len(), calculate_shard_size(data.len(), k));

        let mut optional: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        for &i in &erasures {
            optional[i] = None;
        }

        let recovered = decoder.decode(&mut optional, data.len())?;
        prop_assert_eq!(recovered, data, "k={}, m={}, erasures={:?}", k, m, erasures);
    }

    /// Property: XOR parity restores any single lost shard.
    #[test]
    fn prop_xor_single_loss(
        k in 2usize..=6,
        lost in 0usize..7,
        data in small_data_strategy(),
    ) {
        let lost = lost % (k + 1);
        let encoder = EcEncoder::new(k, 1, ParityType::Xor)?;
        let decoder = EcDecoder::new(k, 1, ParityType::Xor)?;

        let shards = encoder.encode(&data)?;
        let mut optional: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
        optional[lost] = None;
        decoder.reconstruct(&mut optional)?;
        prop_assert_eq!(optional[lost].as_ref(), Some(&shards[lost]));
    }
}

// =============================================================================
// Fragment Pipeline Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: compress → encrypt → encode → decode returns the input
    /// after losing up to m frags.
    #[test]
    fn prop_pipeline_roundtrip(
        data in small_data_strategy(),
        erasures in erasure_strategy(6, 2),
        zlib in any::<bool>(),
    ) {
        let compress = if zlib { CompressType::Zlib } else { CompressType::Lz4 };
        let config = CodingConfig::erasure(4, 2)
            .compress(compress)
            .cipher(CipherType::Aes256Gcm)
            .build()?;
        let enc = FragmentEncoder::new(&config)?;
        let chunk = enc.encode(blank_chunk(&config), &data)?;

        let mut frags: BTreeMap<FragIndex, Bytes> = chunk
            .frags
            .iter()
            .filter_map(|f| f.data.clone().map(|d| (f.index, d)))
            .collect();
        let layout = FragIndex::layout(&config);
        for &i in &erasures {
            frags.remove(&layout[i]);
        }

        let plain = enc.decode(&chunk, &frags)?;
        prop_assert_eq!(plain.as_ref(), data.as_slice());
    }

    /// Property: without encryption the frag digests depend only on content.
    #[test]
    fn prop_unencrypted_encoding_is_deterministic(data in small_data_strategy()) {
        let config = CodingConfig::erasure(3, 2).compress(CompressType::Lz4).build()?;
        let enc = FragmentEncoder::new(&config)?;
        let a = enc.encode(blank_chunk(&config), &data)?;
        let b = enc.encode(blank_chunk(&config), &data)?;

        let digests = |c: &Chunk| c.frags.iter().map(|f| f.digest.clone()).collect::<Vec<_>>();
        prop_assert_eq!(digests(&a), digests(&b));
        prop_assert_eq!(a.digest, b.digest);
    }

    /// Property: losing one data frag in every LRC group, plus all global
    /// parity, still decodes.
    #[test]
    fn prop_lrc_one_loss_per_group(
        data in prop::collection::vec(any::<u8>(), 1..4000),
        picks in prop::collection::vec(0usize..3, 2),
    ) {
        let config = CodingConfig::erasure_with_lrc(6, 2, 3, 1).build()?;
        let enc = FragmentEncoder::new(&config)?;
        let chunk = enc.encode(blank_chunk(&config), &data)?;

        let mut frags: BTreeMap<FragIndex, Bytes> = chunk
            .frags
            .iter()
            .filter_map(|f| f.data.clone().map(|d| (f.index, d)))
            .collect();
        frags.remove(&FragIndex::Parity(0));
        frags.remove(&FragIndex::Parity(1));
        for (group, pick) in picks.iter().enumerate() {
            frags.remove(&FragIndex::Data((group * 3 + pick) as u32));
        }

        let plain = enc.decode(&chunk, &frags)?;
        prop_assert_eq!(plain.as_ref(), data.as_slice());
    }
}
