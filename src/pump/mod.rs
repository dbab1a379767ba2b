pub mod bulk_receiver;
pub mod byte_stream;
pub mod duplex;
pub mod object_wrapper;
pub mod socket;

pub use bulk_receiver::BulkReceiver;
pub use byte_stream::ByteStreamWrapper;
pub use duplex::{DuplexChannel, DuplexTransport, DuplexTransportWrapper};
pub use object_wrapper::{ObjectWrapper, WrappedObject};
pub use socket::{SocketWrapper, Transport, TransportKind, MAX_DATAGRAM_SIZE};
