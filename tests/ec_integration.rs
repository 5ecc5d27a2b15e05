//! EC Integration Tests
//!
//! End-to-end tests for the fragment pipeline: compression, encryption,
//! global parity and local reconstruction groups.

use std::collections::BTreeMap;

use assert_matches::assert_matches;
use bytes::Bytes;
use stratastor::coding::{CipherType, CodingConfig, CompressType};
use stratastor::ec::FragmentEncoder;
use stratastor::error::Error;
use stratastor::model::{BucketId, Chunk, ChunkId, FragIndex, SystemId, TierId};

fn skeleton(config: &CodingConfig) -> Chunk {
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

fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31) % 251) as u8).collect()
}

fn frag_bytes(chunk: &Chunk) -> BTreeMap<FragIndex, Bytes> {
    chunk
        .frags
        .iter()
        .map(|f| (f.index, f.data.clone().expect("encoded frag carries bytes")))
        .collect()
}

// =============================================================================
// Full Pipeline
// =============================================================================

#[test]
fn test_encode_decode_full_pipeline() {
    let config = CodingConfig::erasure(4, 2)
        .compress(CompressType::Lz4)
        .cipher(CipherType::Aes256Gcm)
        .build()
        .expect("valid config");
    let encoder = FragmentEncoder::new(&config).expect("encoder");

    let data = sample_data(64 * 1024);
    let chunk = encoder.encode(skeleton(&config), &data).expect("encode");

    assert_eq!(chunk.frags.len(), 6);
    assert_eq!(chunk.size, data.len() as u64);
    assert!(chunk.compress_size < chunk.size, "repetitive data should compress");
    assert!(chunk.cipher.is_some());
    assert!(!chunk.is_building_frags);
    for frag in &chunk.frags {
        let len = frag.data.as_ref().map(|d| d.len() as u64);
        assert_eq!(len, Some(chunk.frag_size), "frag {}", frag.index);
    }

    let decoded = encoder.decode(&chunk, &frag_bytes(&chunk)).expect("decode");
    assert_eq!(&decoded[..], &data[..]);
}

#[test]
fn test_decode_with_two_lost_frags() {
    let config = CodingConfig::erasure(4, 2)
        .compress(CompressType::Zlib)
        .build()
        .expect("valid config");
    let encoder = FragmentEncoder::new(&config).expect("encoder");
    let data = sample_data(10_000);
    let chunk = encoder.encode(skeleton(&config), &data).expect("encode");

    let mut available = frag_bytes(&chunk);
    available.remove(&FragIndex::Data(0));
    available.remove(&FragIndex::Data(3));

    let decoded = encoder.decode(&chunk, &available).expect("degraded decode");
    assert_eq!(&decoded[..], &data[..]);
}

#[test]
fn test_too_many_losses_fail() {
    let config = CodingConfig::erasure(4, 2).build().expect("valid config");
    let encoder = FragmentEncoder::new(&config).expect("encoder");
    let chunk = encoder
        .encode(skeleton(&config), &sample_data(4096))
        .expect("encode");

    let mut available = frag_bytes(&chunk);
    for i in 0..3 {
        available.remove(&FragIndex::Data(i));
    }
    assert_matches!(
        encoder.decode(&chunk, &available),
        Err(Error::InsufficientShards { .. })
    );
}

#[test]
fn test_corrupt_frag_is_ignored() {
    let config = CodingConfig::erasure(4, 2).build().expect("valid config");
    let encoder = FragmentEncoder::new(&config).expect("encoder");
    let data = sample_data(8192);
    let chunk = encoder.encode(skeleton(&config), &data).expect("encode");

    let mut available = frag_bytes(&chunk);
    let mut bad = available[&FragIndex::Data(1)].to_vec();
    bad[0] ^= 0xFF;
    available.insert(FragIndex::Data(1), Bytes::from(bad));

    let decoded = encoder.decode(&chunk, &available).expect("decode around corruption");
    assert_eq!(&decoded[..], &data[..]);
}

// =============================================================================
// XOR and Mirror
// =============================================================================

#[test]
fn test_xor_parity_recovers_single_loss() {
    let config = CodingConfig::erasure(3, 1)
        .xor_parity()
        .build()
        .expect("valid config");
    let encoder = FragmentEncoder::new(&config).expect("encoder");
    let data = sample_data(3000);
    let chunk = encoder.encode(skeleton(&config), &data).expect("encode");

    let mut available = frag_bytes(&chunk);
    available.remove(&FragIndex::Data(2));
    let decoded = encoder.decode(&chunk, &available).expect("decode");
    assert_eq!(&decoded[..], &data[..]);
}

#[test]
fn test_mirror_config_has_one_frag() {
    let config = CodingConfig::mirror(3).build().expect("valid config");
    let encoder = FragmentEncoder::new(&config).expect("encoder");
    let data = sample_data(1000);
    let chunk = encoder.encode(skeleton(&config), &data).expect("encode");

    assert_eq!(chunk.frags.len(), 1);
    assert_eq!(chunk.frags[0].index, FragIndex::Data(0));
    let decoded = encoder.decode(&chunk, &frag_bytes(&chunk)).expect("decode");
    assert_eq!(&decoded[..], &data[..]);
}

// =============================================================================
// Local Reconstruction
// =============================================================================

#[test]
fn test_lrc_repairs_without_global_parity() {
    let config = CodingConfig::erasure_with_lrc(6, 2, 3, 1)
        .build()
        .expect("valid config");
    let encoder = FragmentEncoder::new(&config).expect("encoder");
    let data = sample_data(12_000);
    let chunk = encoder.encode(skeleton(&config), &data).expect("encode");
    assert_eq!(chunk.frags.len(), 10);

    // one data frag per group plus both global parities gone
    let mut available = frag_bytes(&chunk);
    for index in [
        FragIndex::Data(1),
        FragIndex::Data(4),
        FragIndex::Parity(0),
        FragIndex::Parity(1),
    ] {
        available.remove(&index);
    }

    let decoded = encoder.decode(&chunk, &available).expect("local repair");
    assert_eq!(&decoded[..], &data[..]);
}

#[test]
fn test_reconstruct_frags_matches_original() {
    let config = CodingConfig::erasure_with_lrc(4, 2, 2, 1)
        .build()
        .expect("valid config");
    let encoder = FragmentEncoder::new(&config).expect("encoder");
    let chunk = encoder
        .encode(skeleton(&config), &sample_data(5000))
        .expect("encode");
    let original = frag_bytes(&chunk);

    let wanted = [FragIndex::Data(0), FragIndex::Parity(1), FragIndex::Lrc(1)];
    let mut available = original.clone();
    for index in &wanted {
        available.remove(index);
    }

    let rebuilt = encoder
        .reconstruct_frags(&chunk, &available, &wanted)
        .expect("reconstruct");
    assert_eq!(rebuilt.len(), 3);
    for index in &wanted {
        assert_eq!(rebuilt[index], original[index], "frag {}", index);
    }
}
