//! Protocol stacks: layers connected by pipes, from a transport at the bottom to the
//!  application at the top.
//!
//! ```text
//!   AppStub
//!     | pipe
//!   TlsClientLayer / MiddleLayer
//!     | pipe
//!   TcpStub
//! ```

pub mod app;
pub mod base;
pub mod middle;
pub mod tcp;
pub mod tls;

pub use app::AppStub;
pub use base::StackBase;
pub use middle::{LayerTransform, MiddleLayer};
pub use tcp::{TcpListenerStub, TcpStub};
pub use tls::{TlsClientLayer, TlsServerLayer};
