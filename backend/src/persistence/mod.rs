// 持久化模块

pub mod journal;
pub mod store;

pub use journal::{QueueJournal, PROCESSED_LIST_CAPACITY, PROCESSED_LIST_KEY, WAITING_LIST_KEY};
pub use store::{JsonFileStore, MemoryStore, StateStore};
