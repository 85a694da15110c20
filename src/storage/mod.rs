pub mod collection;

pub use collection::CollectionStore;
