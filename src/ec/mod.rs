//! Fragment Encoder
//!
//! Everything between a chunk's plain bytes and its frags.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        FragmentEncoder                               │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────────┐ │
//! │  │ Compression  │──▶│   Cipher     │──▶│  EcEncoder (RS / XOR)    │ │
//! │  │ (lz4 / zlib) │   │ (AES-GCM)    │   │  + LrcCoder per group    │ │
//! │  └──────────────┘   └──────────────┘   └──────────────────────────┘ │
//! │                                                                      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Encoder/Decoder** (`encoder.rs`): global parity over equal shards.
//!   Reed-Solomon through `reed-solomon-erasure`, single-frag XOR, or none.
//! - **LRC** (`lrc.rs`): local parity per group of data frags and
//!   group-local repair.
//! - **Compression** (`compression.rs`): LZ4 and zlib.
//! - **Cipher** (`cipher.rs`): AES-256-GCM with a per-chunk key and a
//!   detached tag.
//! - **Fragment Encoder** (`fragment.rs`): the full pipeline, its inverse,
//!   and targeted frag regeneration for rebuilds.
//! - **Cache** (`cache.rs`): one shared encoder per coding configuration.
//!
//! # Usage
//!
//! ```rust,ignore
//! use stratastor::coding::CodingConfig;
//! use stratastor::ec::FragmentEncoder;
//!
//! let config = CodingConfig::erasure(4, 2).build()?;
//! let encoder = FragmentEncoder::new(&config)?;
//! let chunk = encoder.encode(chunk, b"Hello, World!")?;
//! assert_eq!(chunk.frags.len(), 6);
//! ```

pub mod cache;
pub mod cipher;
pub mod compression;
pub mod encoder;
pub mod fragment;
pub mod lrc;

#[cfg(test)]
mod proptest;

pub use cache::EncoderCache;
pub use encoder::{EcDecoder, EcEncoder};
pub use fragment::FragmentEncoder;
pub use lrc::LrcCoder;
