//! Schema Mapper
//!
//! Three representations of the same entities:
//!
//! ```text
//!  in-memory entity  ◀──────▶  wire (JSON, base64 binaries)
//!        ▲
//!        └───────────────────▶  persisted record (raw bytes, id references)
//! ```
//!
//! - **record** (`record.rs`) - at-rest shape used by the metadata store
//! - **wire** (`wire.rs`) - shape exchanged with the object façade and block stores
//!
//! Both directions validate; malformed input fails with `SchemaValidation`.

pub mod record;
pub mod wire;

pub use record::{BlockRecord, ChunkRecord, ChunkRecordSet, CodingConfigRecord, FragRecord, PartRecord};
pub use wire::{BlockInfo, BlockMd, ChunkInfo, FragInfo, PartInfo};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::coding::CodingConfig;
    use crate::ec::cipher;
    use crate::model::{
        Block, BlockId, BlockState, BucketId, Chunk, ChunkId, Frag, FragIndex, NodeId, PoolId,
        SystemId, TierId,
    };

    /// A structurally valid chunk with `replicas` committed blocks per frag.
    ///
    /// Digests are computed over fake content so their lengths match the
    /// coding config; block r of frag i lives on node `n{i}-{r}`.
    pub(crate) fn sample_chunk(config: &CodingConfig, replicas: usize) -> Chunk {
        let cipher = config.cipher_type().map(|ct| {
            let mut buf = b"sample".to_vec();
            cipher::encrypt(ct, &mut buf).unwrap()
        });

        let mut chunk = Chunk {
            id: ChunkId::new(),
            system_id: SystemId::new("sys"),
            bucket_id: BucketId::new("bucket"),
            tier_id: TierId::new("tier"),
            coding: config.clone(),
            size: 4096,
            compress_size: 4096,
            frag_size: 1024,
            digest: config.digest_type().digest(b"sample chunk"),
            cipher,
            dup_chunk_id: None,
            deleted: None,
            frags: Vec::new(),
            is_building_blocks: false,
            is_building_frags: false,
        };

        for (i, index) in FragIndex::layout(config).into_iter().enumerate() {
            let digest = config
                .frag_digest_type()
                .digest(format!("frag {}", index).as_bytes());
            let mut frag = Frag::new(index, digest);
            for r in 0..replicas {
                frag.blocks.push(Block {
                    id: BlockId::new(),
                    system_id: chunk.system_id.clone(),
                    bucket_id: chunk.bucket_id.clone(),
                    chunk_id: chunk.id,
                    frag_id: frag.id,
                    node_id: NodeId::new(format!("n{}-{}", i, r)),
                    pool_id: PoolId::new(format!("pool-{}", r)),
                    size: 1024,
                    address: None,
                    state: BlockState::Committed,
                    deleted: None,
                    reclaimed: None,
                });
            }
            chunk.frags.push(frag);
        }
        chunk
    }
}

#[cfg(test)]
mod proptests {
    use super::test_support::sample_chunk;
    use super::*;
    use crate::coding::{CipherType, CodingConfig, CompressType, DigestType};
    use crate::model::{BlockState, Chunk};
    use proptest::prelude::*;

    fn state_strategy() -> impl Strategy<Value = BlockState> {
        prop_oneof![
            Just(BlockState::Allocating),
            Just(BlockState::Preallocated),
            Just(BlockState::Committed),
            Just(BlockState::Deleting),
            Just(BlockState::FutureDeleting),
        ]
    }

    /// Shape of a coding config: mirror, plain erasure or erasure with
    /// local groups, with or without xor global parity.
    #[derive(Debug, Clone)]
    enum Scheme {
        Mirror { replicas: u32 },
        Erasure { data: u32, parity: u32, xor: bool },
        Lrc { groups: u32, group: u32, parity: u32, lrc_frags: u32 },
    }

    fn scheme_strategy() -> impl Strategy<Value = Scheme> {
        prop_oneof![
            (1u32..4).prop_map(|replicas| Scheme::Mirror { replicas }),
            (1u32..6, 1u32..3, any::<bool>())
                .prop_map(|(data, parity, xor)| Scheme::Erasure { data, parity, xor }),
            (1u32..4, 1u32..4, 1u32..3, 1u32..3).prop_map(|(groups, group, parity, lrc_frags)| {
                Scheme::Lrc {
                    groups,
                    group,
                    parity,
                    lrc_frags,
                }
            }),
        ]
    }

    fn config_strategy() -> impl Strategy<Value = CodingConfig> {
        (
            scheme_strategy(),
            prop::option::of(prop_oneof![Just(CompressType::Lz4), Just(CompressType::Zlib)]),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(scheme, compress, encrypted, sha512)| {
                let mut builder = match scheme {
                    Scheme::Mirror { replicas } => CodingConfig::mirror(replicas),
                    Scheme::Erasure { data, parity, xor: false } => CodingConfig::erasure(data, parity),
                    Scheme::Erasure { data, xor: true, .. } => CodingConfig::erasure(data, 1).xor_parity(),
                    Scheme::Lrc {
                        groups,
                        group,
                        parity,
                        lrc_frags,
                    } => CodingConfig::erasure_with_lrc(groups * group, parity, group, lrc_frags),
                };
                if let Some(compress) = compress {
                    builder = builder.compress(compress);
                }
                if encrypted {
                    builder = builder.cipher(CipherType::Aes256Gcm);
                }
                if sha512 {
                    builder = builder.frag_digest_type(DigestType::Sha512);
                }
                builder.build().unwrap()
            })
    }

    fn assert_roundtrips(chunk: &Chunk, config: &CodingConfig) -> Result<(), TestCaseError> {
        let via_wire = ChunkInfo::from_chunk(chunk, None).into_chunk().unwrap();
        prop_assert_eq!(&via_wire, chunk);

        let via_record = ChunkRecordSet::from_chunk(chunk)
            .unwrap()
            .into_chunk(config)
            .unwrap();
        prop_assert_eq!(&via_record, chunk);
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_wire_and_record_agree(
            config in config_strategy(),
            replicas in 0usize..3,
            states in proptest::collection::vec(state_strategy(), 24),
        ) {
            let mut chunk = sample_chunk(&config, replicas);
            let mut i = 0;
            for frag in &mut chunk.frags {
                for block in &mut frag.blocks {
                    block.state = states[i % states.len()];
                    i += 1;
                }
            }
            assert_roundtrips(&chunk, &config)?;
        }

        #[test]
        fn prop_dedup_reference_roundtrips(config in config_strategy()) {
            let existing = sample_chunk(&config, 1);
            let reference = Chunk::dedup_of(&existing);
            prop_assert!(reference.frags.is_empty());
            prop_assert_eq!(reference.dup_chunk_id, Some(existing.id));
            assert_roundtrips(&reference, &config)?;
        }
    }

    #[test]
    fn test_lrc_chunk_keeps_local_frag_indexes() {
        let config = CodingConfig::erasure_with_lrc(6, 2, 3, 1).build().unwrap();
        let chunk = sample_chunk(&config, 2);

        let info = ChunkInfo::from_chunk(&chunk, None);
        let lrc: Vec<_> = info.frags.iter().filter_map(|f| f.lrc_index).collect();
        assert_eq!(lrc, vec![0, 1]);

        let set = ChunkRecordSet::from_chunk(&chunk).unwrap();
        let lrc: Vec<_> = set.chunk.frags.iter().filter_map(|f| f.lrc_index).collect();
        assert_eq!(lrc, vec![0, 1]);
        assert_eq!(set.into_chunk(&config).unwrap(), chunk);
    }
}
