pub mod layout;

pub use layout::{ensure_directory, is_usable_artifact, remove_quietly, StorageLayout};
