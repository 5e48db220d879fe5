pub mod common;
pub mod config;
pub mod error;
pub mod outbound;
pub mod relay;
pub mod resolver;
pub mod utils;

pub use common::{Address, BoxTcpStream};
pub use error::{ErrorCode, TunnelError};
pub use outbound::{ConnectionContext, Dispatcher, RelayDescriptor, Route};
pub use resolver::{HostResolver, ResolverConfig};
