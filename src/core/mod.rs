// 核心数据结构、时钟、队列与配置

pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod queue;
pub mod state;
pub mod types;

pub use clock::*;
pub use config::*;
pub use control::*;
pub use error::*;
pub use queue::{BoundedQueue, PushError};
pub use state::PlayerState;
pub use types::*;
