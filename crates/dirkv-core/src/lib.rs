pub mod error;
pub mod fs;
pub mod store;

pub use store::{
    CanonicalPath, CaseSensitivity, ChangeKind, ChangeNotification, Store, StoreBuilder,
    StoreError, StoreOptions, WatchEventKind,
};
