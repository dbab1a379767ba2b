pub mod attach;
pub mod byte_stream;
pub mod pipe;
pub mod stream;

pub use attach::AttachHandle;
pub use byte_stream::PipeByteStream;
pub use pipe::{Pipe, PipeEnd, PipeSide, WeakPipe};
pub use stream::PipeEndStream;
