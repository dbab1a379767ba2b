//! Virtual wires: in-process pipes with segmented, back-pressured buffers, pump loops that move
//!  data between pipes and sockets or byte streams, and protocol stacks composed of layers
//!  connected by pipes.

pub mod buffer;
pub mod config;
pub mod error;
pub mod layer_info;
pub mod pipe;
pub mod pump;
pub mod stack;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
