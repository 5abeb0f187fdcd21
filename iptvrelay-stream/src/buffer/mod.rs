mod ring;

pub use ring::{BufferClosed, RingBuffer};
