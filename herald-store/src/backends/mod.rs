mod memory;
mod redis;

pub use self::{memory::MemoryStore, redis::RedisStore};
