//! Fragment Encoder
//!
//! Turns the plain bytes of a chunk into frags and back:
//!
//! ```text
//!  plain ──▶ compress ──▶ encrypt ──▶ split into k data shards (zero padded)
//!                                        │
//!                        ┌───────────────┼────────────────┐
//!                        ▼               ▼                ▼
//!                   D0 .. Dk-1     P0 .. Pm-1       L0 .. (per group)
//! ```
//!
//! Decoding verifies every frag digest, repairs what it can from local
//! parity, falls back to global reconstruction, then undoes encryption and
//! compression and checks the chunk digest.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use super::cipher;
use super::compression::compressor_for;
use super::encoder::{calculate_shard_size, EcDecoder, EcEncoder};
use super::lrc::LrcCoder;
use crate::coding::{CodingConfig, ParityType};
use crate::error::{Error, Result};
use crate::model::{Chunk, Frag, FragIndex};

/// Encoder/decoder bound to one coding configuration.
#[derive(Clone)]
pub struct FragmentEncoder {
    config: CodingConfig,
    encoder: EcEncoder,
    decoder: EcDecoder,
    lrc: Option<LrcCoder>,
}

impl FragmentEncoder {
    pub fn new(config: &CodingConfig) -> Result<Self> {
        let k = config.data_frags() as usize;
        let m = config.parity_frags() as usize;
        let parity_type = config.parity_type().unwrap_or(ParityType::ReedSolomon);
        Ok(Self {
            config: config.clone(),
            encoder: EcEncoder::new(k, m, parity_type)?,
            decoder: EcDecoder::new(k, m, parity_type)?,
            lrc: LrcCoder::from_config(config)?,
        })
    }

    pub fn config(&self) -> &CodingConfig {
        &self.config
    }

    // =========================================================================
    // Encode
    // =========================================================================

    /// Encode `plain` into the frags of `chunk`.
    ///
    /// `chunk` carries identity and placement context; this fills in the
    /// sizes, cipher parameters, digest (when empty) and every frag with its
    /// shard bytes attached. Blocks are left empty.
    #[instrument(skip(self, chunk, plain), fields(chunk_id = %chunk.id, size = plain.len()))]
    pub fn encode(&self, mut chunk: Chunk, plain: &[u8]) -> Result<Chunk> {
        if chunk.coding != self.config {
            return Err(Error::EncodingFailure(format!(
                "chunk {} was not built for this coding configuration",
                chunk.id
            )));
        }

        let digest_type = self.config.digest_type();
        if chunk.digest.is_empty() {
            chunk.digest = digest_type.digest(plain);
        }

        let mut payload = match self.config.compress_type() {
            Some(algorithm) => compressor_for(algorithm).compress(plain)?,
            None => plain.to_vec(),
        };
        chunk.cipher = match self.config.cipher_type() {
            Some(cipher_type) => Some(cipher::encrypt(cipher_type, &mut payload)?),
            None => None,
        };

        let shards = self.encoder.encode(&payload)?;
        let frag_size = shards.first().map(|s| s.len()).unwrap_or(0);
        let k = self.config.data_frags() as usize;

        let local = match &self.lrc {
            Some(lrc) => lrc.encode(&shards[..k])?,
            None => Vec::new(),
        };

        let frag_digest_type = self.config.frag_digest_type();
        let layout = FragIndex::layout(&self.config);
        chunk.frags = layout
            .into_iter()
            .zip(shards.into_iter().chain(local))
            .map(|(index, shard)| {
                let mut frag = Frag::new(index, frag_digest_type.digest(&shard));
                frag.data = Some(Bytes::from(shard));
                frag
            })
            .collect();

        chunk.size = plain.len() as u64;
        chunk.compress_size = payload.len() as u64;
        chunk.frag_size = frag_size as u64;
        chunk.is_building_frags = false;

        debug!(
            frags = chunk.frags.len(),
            frag_size,
            compress_size = chunk.compress_size,
            "Encoded chunk"
        );
        Ok(chunk)
    }

    // =========================================================================
    // Decode
    // =========================================================================

    /// Recover the plain bytes of `chunk` from whichever frags are available.
    #[instrument(skip(self, chunk, available), fields(chunk_id = %chunk.id, available = available.len()))]
    pub fn decode(&self, chunk: &Chunk, available: &BTreeMap<FragIndex, Bytes>) -> Result<Bytes> {
        let data_shards = self.recover_data_shards(chunk, available)?;

        let mut payload: Vec<u8> = data_shards.concat();
        payload.truncate(chunk.compress_size as usize);

        if let Some(params) = &chunk.cipher {
            cipher::decrypt(params, &mut payload)?;
        }
        let plain = match self.config.compress_type() {
            Some(algorithm) => compressor_for(algorithm).decompress(&payload)?,
            None => payload,
        };

        if plain.len() as u64 != chunk.size
            || self.config.digest_type().digest(&plain) != chunk.digest
        {
            return Err(Error::DigestMismatch {
                what: format!("chunk {}", chunk.id),
            });
        }
        Ok(Bytes::from(plain))
    }

    /// Regenerate the shard bytes of `wanted` frags from the available ones.
    ///
    /// Used by rebuilds. Each regenerated shard is checked against the digest
    /// recorded on its frag.
    #[instrument(skip(self, chunk, available, wanted), fields(chunk_id = %chunk.id))]
    pub fn reconstruct_frags(
        &self,
        chunk: &Chunk,
        available: &BTreeMap<FragIndex, Bytes>,
        wanted: &[FragIndex],
    ) -> Result<BTreeMap<FragIndex, Bytes>> {
        let k = self.config.data_frags() as usize;
        let data_shards = self.recover_data_shards(chunk, available)?;
        let shard_size = data_shards.first().map(|s| s.len()).unwrap_or(0);

        let mut all: Vec<Vec<u8>> = data_shards;
        all.extend((0..self.config.parity_frags()).map(|_| vec![0u8; shard_size]));
        self.encoder.encode_shards(&mut all)?;
        if let Some(lrc) = &self.lrc {
            let local = lrc.encode(&all[..k])?;
            all.extend(local);
        }

        let layout = FragIndex::layout(&self.config);
        let mut out = BTreeMap::new();
        for index in wanted {
            let pos = layout
                .iter()
                .position(|i| i == index)
                .ok_or_else(|| Error::schema("frag", format!("{} not in layout", index)))?;
            let shard = Bytes::from(std::mem::take(&mut all[pos]));
            if let Some(frag) = chunk.frag(*index) {
                if self.config.frag_digest_type().digest(&shard) != frag.digest {
                    return Err(Error::DigestMismatch {
                        what: format!("rebuilt frag {} of chunk {}", index, chunk.id),
                    });
                }
            }
            out.insert(*index, shard);
        }
        Ok(out)
    }

    /// Verified data shards, repaired locally first and globally second.
    fn recover_data_shards(
        &self,
        chunk: &Chunk,
        available: &BTreeMap<FragIndex, Bytes>,
    ) -> Result<Vec<Vec<u8>>> {
        let k = self.config.data_frags() as usize;
        let m = self.config.parity_frags() as usize;
        let expected_size = if chunk.frag_size > 0 {
            chunk.frag_size as usize
        } else {
            calculate_shard_size(chunk.compress_size as usize, k)
        };

        let mut data: Vec<Option<Vec<u8>>> = vec![None; k];
        let mut parity: Vec<Option<Vec<u8>>> = vec![None; m];
        let mut local: Vec<Option<Vec<u8>>> =
            vec![None; self.lrc.as_ref().map(|l| l.total_frags()).unwrap_or(0)];

        let frag_digest_type = self.config.frag_digest_type();
        for (index, bytes) in available {
            if bytes.len() != expected_size {
                warn!(frag = %index, "Discarding frag with unexpected size");
                continue;
            }
            if let Some(frag) = chunk.frag(*index) {
                if frag_digest_type.digest(bytes) != frag.digest {
                    warn!(frag = %index, "Discarding frag with bad digest");
                    continue;
                }
            }
            let slot = match *index {
                FragIndex::Data(i) => data.get_mut(i as usize),
                FragIndex::Parity(i) => parity.get_mut(i as usize),
                FragIndex::Lrc(i) => local.get_mut(i as usize),
            };
            if let Some(slot) = slot {
                *slot = Some(bytes.to_vec());
            }
        }

        if let Some(lrc) = &self.lrc {
            let repaired = lrc.repair(&mut data, &mut local)?;
            if repaired > 0 {
                debug!(repaired, "Repaired data frags from local parity");
            }
        }

        if data.iter().any(|d| d.is_none()) {
            let mut shards: Vec<Option<Vec<u8>>> = data.into_iter().chain(parity).collect();
            self.decoder.reconstruct_data(&mut shards)?;
            data = shards.into_iter().take(k).collect();
        }

        data.into_iter()
            .map(|d| {
                d.ok_or(Error::InsufficientShards {
                    available: available.len(),
                    required: k,
                })
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::{CipherType, CompressType};
    use crate::model::{BucketId, ChunkId, SystemId, TierId};
    use assert_matches::assert_matches;

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

    fn frag_map(chunk: &Chunk) -> BTreeMap<FragIndex, Bytes> {
        chunk
            .frags
            .iter()
            .map(|f| (f.index, f.data.clone().unwrap()))
            .collect()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_encode_layout_and_sizes() {
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        let enc = FragmentEncoder::new(&config).unwrap();
        let chunk = enc.encode(blank_chunk(&config), &sample(1001)).unwrap();

        assert_eq!(chunk.frags.len(), 6);
        assert_eq!(chunk.frag_size, 251);
        assert!(chunk.frags.iter().all(|f| f.blocks.is_empty()));
        assert!(chunk.check_layout().is_ok());
    }

    #[test]
    fn test_empty_chunk_has_one_byte_frags() {
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        let enc = FragmentEncoder::new(&config).unwrap();
        let chunk = enc.encode(blank_chunk(&config), &[]).unwrap();
        assert_eq!(chunk.frag_size, 1);
        assert!(enc.decode(&chunk, &frag_map(&chunk)).unwrap().is_empty());
    }

    #[test]
    fn test_full_pipeline_roundtrip_with_losses() {
        let config = CodingConfig::erasure(4, 2)
            .compress(CompressType::Zlib)
            .cipher(CipherType::Aes256Gcm)
            .build()
            .unwrap();
        let enc = FragmentEncoder::new(&config).unwrap();
        let plain = sample(64 * 1024);
        let chunk = enc.encode(blank_chunk(&config), &plain).unwrap();
        assert!(chunk.cipher.is_some());
        assert!(chunk.compress_size < chunk.size);

        let mut frags = frag_map(&chunk);
        frags.remove(&FragIndex::Data(0));
        frags.remove(&FragIndex::Parity(1));
        assert_eq!(enc.decode(&chunk, &frags).unwrap().as_ref(), plain.as_slice());

        frags.remove(&FragIndex::Data(2));
        assert_matches!(
            enc.decode(&chunk, &frags),
            Err(Error::InsufficientShards { .. })
        );
    }

    #[test]
    fn test_corrupt_frag_is_treated_as_missing() {
        let config = CodingConfig::erasure(4, 2).build().unwrap();
        let enc = FragmentEncoder::new(&config).unwrap();
        let plain = sample(4096);
        let chunk = enc.encode(blank_chunk(&config), &plain).unwrap();

        let mut frags = frag_map(&chunk);
        let mut bad = frags[&FragIndex::Data(1)].to_vec();
        bad[0] ^= 1;
        frags.insert(FragIndex::Data(1), Bytes::from(bad));
        assert_eq!(enc.decode(&chunk, &frags).unwrap().as_ref(), plain.as_slice());
    }

    #[test]
    fn test_lrc_local_repair_without_global_parity() {
        let config = CodingConfig::erasure_with_lrc(4, 2, 2, 1)
            .compress(CompressType::Lz4)
            .build()
            .unwrap();
        let enc = FragmentEncoder::new(&config).unwrap();
        let plain = sample(10_000);
        let chunk = enc.encode(blank_chunk(&config), &plain).unwrap();
        assert_eq!(chunk.frags.len(), 8);

        let mut frags = frag_map(&chunk);
        frags.remove(&FragIndex::Parity(0));
        frags.remove(&FragIndex::Parity(1));
        frags.remove(&FragIndex::Data(0));
        frags.remove(&FragIndex::Data(3));
        assert_eq!(enc.decode(&chunk, &frags).unwrap().as_ref(), plain.as_slice());
    }

    #[test]
    fn test_reconstruct_frags_matches_original() {
        let config = CodingConfig::erasure_with_lrc(4, 2, 2, 1).build().unwrap();
        let enc = FragmentEncoder::new(&config).unwrap();
        let chunk = enc.encode(blank_chunk(&config), &sample(3000)).unwrap();
        let original = frag_map(&chunk);

        let mut available = original.clone();
        for idx in [FragIndex::Data(1), FragIndex::Parity(0), FragIndex::Lrc(1)] {
            available.remove(&idx);
        }
        let wanted = [FragIndex::Data(1), FragIndex::Parity(0), FragIndex::Lrc(1)];
        let rebuilt = enc.reconstruct_frags(&chunk, &available, &wanted).unwrap();
        for idx in wanted {
            assert_eq!(rebuilt[&idx], original[&idx]);
        }
    }

    #[test]
    fn test_mirror_config_single_frag() {
        let config = CodingConfig::mirror(3).build().unwrap();
        let enc = FragmentEncoder::new(&config).unwrap();
        let plain = sample(777);
        let chunk = enc.encode(blank_chunk(&config), &plain).unwrap();
        assert_eq!(chunk.frags.len(), 1);
        assert_eq!(chunk.frag_size, 777);
        assert_eq!(
            enc.decode(&chunk, &frag_map(&chunk)).unwrap().as_ref(),
            plain.as_slice()
        );
    }

    #[test]
    fn test_rejects_foreign_config() {
        let a = CodingConfig::erasure(4, 2).build().unwrap();
        let b = CodingConfig::erasure(2, 1).build().unwrap();
        let enc = FragmentEncoder::new(&a).unwrap();
        assert_matches!(
            enc.encode(blank_chunk(&b), b"x"),
            Err(Error::EncodingFailure(_))
        );
    }
}
