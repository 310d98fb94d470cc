pub mod backend;
pub mod transactional;

pub use backend::{CacheBackend, InMemoryCache};
pub use transactional::TransactionCache;
