//! Content store abstraction and in-memory backend.

pub mod memory;
pub mod traits;

pub use memory::{InMemoryContentStore, MemorySession};
pub use traits::{
    ChangeEvent, ContentNode, ContentStore, EventSink, EventTypes, NodeId, Session, SubscriptionFilter,
    SubscriptionId,
};
