//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - traits for the engine's collaborators
//! - **Events** (`events.rs`) - domain events for audit and decoupling
//!
//! # Usage
//!
//! ```ignore
//! use stratastor::domain::ports::{MetadataStore, NodeRegistry};
//!
//! async fn live_chunks<S: MetadataStore>(store: &S) -> Result<usize> {
//!     Ok(store.list_live_chunk_ids().await?.len())
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::DomainEvent;
pub use ports::{BlockStore, EventPublisher, MetadataStore, NodeRegistry};
