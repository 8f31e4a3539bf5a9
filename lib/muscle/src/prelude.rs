pub use crate::gateway::{Gateway, GatewayPolicy, MessageGateway, RawGateway};
pub use crate::message::{Field, Message, MessageRef, Point, Rect};
pub use crate::path::PathPattern;
pub use crate::pool::{ObjectPool, PoolRef};
pub use crate::server::{ReflectServer, ServerCtx};
pub use crate::session::{Session, SessionBehavior, SessionFactory, SessionParams};
pub use crate::storage::{StorageFactory, StorageSession};
pub use crate::support::{Error, Result, SessionId};
pub use crate::tree::{DataNode, NodeId, NodeTree};
pub use crate::wire::{flatten, flattened_size, unflatten};
