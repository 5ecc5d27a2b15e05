//! Local Reconstruction Codes
//!
//! Data frags are split into consecutive groups of `lrc_group`. Each group
//! gets `lrc_frags` local parity frags computed over that group only, so a
//! missing data frag can be repaired from its group instead of reading k
//! frags across the whole chunk.
//!
//! ```text
//!   D0 D1 D2 | D3 D4 D5        P0 P1       (global, over all D)
//!   └──L0──┘   └──L1──┘                    (local, one per group)
//! ```
//!
//! Local parity index `L(g * lrc_frags + j)` is the j-th local parity of group g.

use tracing::debug;

use super::encoder::{EcDecoder, EcEncoder};
use crate::coding::{CodingConfig, ParityType};
use crate::error::{Error, Result};

/// Coder for the local parity groups of one coding configuration.
#[derive(Clone)]
pub struct LrcCoder {
    group_size: usize,
    lrc_frags: usize,
    groups: usize,
    encoder: EcEncoder,
    decoder: EcDecoder,
}

impl LrcCoder {
    /// `None` when the configuration has no LRC layout.
    pub fn from_config(config: &CodingConfig) -> Result<Option<Self>> {
        let Some((group, frags, lrc_type)) = config.lrc() else {
            return Ok(None);
        };
        Ok(Some(Self::new(
            config.data_frags() as usize,
            group as usize,
            frags as usize,
            lrc_type,
        )?))
    }

    pub fn new(
        data_frags: usize,
        group_size: usize,
        lrc_frags: usize,
        lrc_type: ParityType,
    ) -> Result<Self> {
        if group_size == 0 || data_frags % group_size != 0 {
            return Err(Error::InvalidCodingConfig(format!(
                "lrc group {} does not divide {} data frags",
                group_size, data_frags
            )));
        }
        Ok(Self {
            group_size,
            lrc_frags,
            groups: data_frags / group_size,
            encoder: EcEncoder::new(group_size, lrc_frags, lrc_type)?,
            decoder: EcDecoder::new(group_size, lrc_frags, lrc_type)?,
        })
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn total_frags(&self) -> usize {
        self.groups * self.lrc_frags
    }

    /// Group a data frag belongs to.
    pub fn group_of_data(&self, data_index: usize) -> usize {
        data_index / self.group_size
    }

    /// Group a local parity frag belongs to.
    pub fn group_of_lrc(&self, lrc_index: usize) -> usize {
        lrc_index / self.lrc_frags
    }

    /// Data frag indices of group `g`.
    pub fn data_in_group(&self, g: usize) -> std::ops::Range<usize> {
        g * self.group_size..(g + 1) * self.group_size
    }

    /// Local parity indices of group `g`.
    pub fn lrc_in_group(&self, g: usize) -> std::ops::Range<usize> {
        g * self.lrc_frags..(g + 1) * self.lrc_frags
    }

    /// Compute all local parity frags from the full set of data frags.
    pub fn encode(&self, data: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        if data.len() != self.groups * self.group_size {
            return Err(Error::EncodingFailure(format!(
                "expected {} data frags for LRC, got {}",
                self.groups * self.group_size,
                data.len()
            )));
        }
        let shard_size = data.first().map(|d| d.len()).unwrap_or(0);
        let mut out = Vec::with_capacity(self.total_frags());

        for g in 0..self.groups {
            let mut shards: Vec<Vec<u8>> = data[self.data_in_group(g)].to_vec();
            shards.extend((0..self.lrc_frags).map(|_| vec![0u8; shard_size]));
            self.encoder.encode_shards(&mut shards)?;
            out.extend(shards.drain(self.group_size..));
        }
        Ok(out)
    }

    /// Repair missing data frags group by group from local parity.
    ///
    /// Groups with more missing frags than surviving local parity are left
    /// alone. Repaired local parity slots are filled in as well. Returns the
    /// number of data frags repaired.
    pub fn repair(
        &self,
        data: &mut [Option<Vec<u8>>],
        lrc: &mut [Option<Vec<u8>>],
    ) -> Result<usize> {
        let mut repaired = 0;

        for g in 0..self.groups {
            let data_range = self.data_in_group(g);
            let lrc_range = self.lrc_in_group(g);
            let missing = data[data_range.clone()].iter().filter(|d| d.is_none()).count();
            if missing == 0 {
                continue;
            }
            let local_available = lrc[lrc_range.clone()].iter().filter(|l| l.is_some()).count();
            if missing > local_available {
                continue;
            }

            let mut shards: Vec<Option<Vec<u8>>> = data[data_range.clone()]
                .iter()
                .chain(lrc[lrc_range.clone()].iter())
                .cloned()
                .collect();
            self.decoder.reconstruct(&mut shards)?;

            let mut shards = shards.into_iter();
            for slot in data[data_range].iter_mut().chain(lrc[lrc_range].iter_mut()) {
                let shard = shards.next().flatten();
                if slot.is_none() {
                    *slot = shard;
                }
            }
            debug!(group = g, missing, "Repaired LRC group");
            repaired += missing;
        }

        Ok(repaired)
    }

    /// Number of missing data frags local parity can restore, given which
    /// data and local parity frags are present.
    pub fn locally_repairable(&self, data_present: &[bool], lrc_present: &[bool]) -> usize {
        (0..self.groups)
            .map(|g| {
                let missing = data_present[self.data_in_group(g)]
                    .iter()
                    .filter(|p| !**p)
                    .count();
                let local = lrc_present[self.lrc_in_group(g)]
                    .iter()
                    .filter(|p| **p)
                    .count();
                if missing <= local {
                    missing
                } else {
                    0
                }
            })
            .sum()
    }
}
