/// Maximum number of peripherals a hub can register.
pub const MAX_PERIPHERALS: usize = 8;

/// Channels per peripheral: data-in, data-out, control, irq.
pub const PERIPHERAL_CHANNEL_COUNT: usize = 4;

/// Number of distinct intertile stream ids (callback ids).
pub const STREAM_ID_COUNT: usize = 8;

/// Pipe slots per stream id.
pub const MAX_PIPES_PER_STREAM: usize = 8;

/// Size in bytes of every receive buffer handed to the intertile peripheral.
pub const INTERTILE_BUFSIZE: usize = 512;

/// Routing footer length: peer address word plus stream id byte.
pub const FOOTER_LEN: usize = 5;

/// Number of buffer descriptors in a pipe manager's pool.
pub const NUM_BUFFER_DESCRIPTORS: usize = 16;

/// Receive buffers kept posted to the hub at all times.
pub const NUM_RX_BUFFERS: usize = 4;

/// Default transmit ring depth. Each frame uses two slots.
pub const TX_RING_DEPTH: usize = 8;

/// Deferred-work queue length.
pub const WORK_QUEUE_LEN: usize = 16;

/// Depth of each hardware channel FIFO. The hub may have a `Ready` token and
/// the previous transfer's data outstanding towards one device at once.
pub const CHANNEL_FIFO_DEPTH: usize = 2;

/// Interrupt status bit: a receive transfer completed.
pub const DMA_RX_DONE_BM: u32 = 1 << 0;

/// Interrupt status bit: a transmit transfer completed.
pub const DMA_TX_DONE_BM: u32 = 1 << 1;

/// First interrupt status bit available to device-defined events.
pub const DEVICE_IRQ_SHIFT: u32 = 8;
