//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  MetadataStore │ NodeRegistry │ BlockStore │ EventPublisher│ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryMetadataStore │ StaticNodeRegistry                 │ │
//! │  │ InMemoryBlockStore    │ LoggingEventPublisher              │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use stratastor::adapters::{InMemoryBlockStore, InMemoryMetadataStore, StaticNodeRegistry};
//! use stratastor::domain::ports::MetadataStore;
//!
//! let store = InMemoryMetadataStore::new();
//! let live = store.list_live_chunk_ids().await?;
//! ```

mod block_store;
mod event_publisher;
mod memory_store;
mod node_registry;

pub use block_store::InMemoryBlockStore;
pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use memory_store::InMemoryMetadataStore;
pub use node_registry::StaticNodeRegistry;
