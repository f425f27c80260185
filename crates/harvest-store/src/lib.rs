pub mod config;
mod fs;
pub mod layout;
pub mod store;

pub use config::StoreConfig;
pub use layout::Layout;
pub use store::FsStore;
