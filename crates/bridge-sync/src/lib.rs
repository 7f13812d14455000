pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod part_tree;
pub mod reconciler;
pub mod reconnect;
pub mod refetch;
pub mod sse;
pub mod store;
pub mod subscription;

#[cfg(test)]
mod testing;

pub use client::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use event::*;
pub use reconciler::*;
pub use reconnect::*;
pub use refetch::*;
pub use sse::*;
pub use store::*;
pub use subscription::*;
