#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod gateway;
pub mod message;
pub mod path;
pub mod pool;
pub mod server;
pub mod session;
pub mod storage;
pub mod support;
pub mod tree;
pub mod wire;

pub mod prelude;
