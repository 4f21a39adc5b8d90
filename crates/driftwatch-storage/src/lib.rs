pub mod manager;

pub use manager::{
    NoopCipher, SaveReceipt, SnapshotCipher, StorageManagerPool, StorageStatsSnapshot,
};
