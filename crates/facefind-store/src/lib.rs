//! facefind-store — SQLite persistence for photos and their face embeddings.

mod schema;
mod store;

pub use store::{FaceStore, MigrationReport, PhotoRecord, StoreError};
