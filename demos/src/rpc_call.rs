//! Remote I2C register access.
//!
//! Tile 1 owns a simulated codec on its I2C bus and serves it over a pipe.
//! Tile 0 configures the codec through [`RemoteI2c`], which implements
//! `embedded_hal::i2c::I2c`, exactly as it would a local bus.

use std::error::Error;
use std::thread;

use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};
use log::info;
use soc_hub::buffer::BufferPool;
use soc_hub::constants::{INTERTILE_BUFSIZE, NUM_BUFFER_DESCRIPTORS};
use soc_hub::hub::{CooperativeDispatcher, PeripheralHub};
use soc_hub::i2c_rpc::{serve_i2c, RemoteI2c};
use soc_hub::intertile::{channels_for_tile, IntertileLink};
use soc_hub::osal::Timeout;
use soc_hub::pipe::{PipeManager, PipeManagerConfig};

const CODEC_ADDR: u8 = 0x0a;
const I2C_STREAM: u8 = 2;
const I2C_PIPE_ADDR: u32 = 0;

#[derive(Debug)]
struct Nack;

impl embedded_hal::i2c::Error for Nack {
    fn kind(&self) -> ErrorKind {
        ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)
    }
}

/// Codec with 64 8-bit registers behind an auto-incrementing pointer.
struct SimCodec {
    regs: [u8; 64],
    pointer: usize,
}

impl ErrorType for SimCodec {
    type Error = Nack;
}

impl I2c for SimCodec {
    fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Nack> {
        if address != CODEC_ADDR {
            return Err(Nack);
        }
        for op in operations {
            match op {
                Operation::Write(bytes) => {
                    if let Some((&reg, values)) = bytes.split_first() {
                        self.pointer = reg as usize % self.regs.len();
                        for &v in values {
                            self.regs[self.pointer] = v;
                            self.pointer = (self.pointer + 1) % self.regs.len();
                        }
                    }
                }
                Operation::Read(buf) => {
                    for b in buf.iter_mut() {
                        *b = self.regs[self.pointer];
                        self.pointer = (self.pointer + 1) % self.regs.len();
                    }
                }
            }
        }
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = PipeManagerConfig::default();
    let (chans_0, dev_0) = channels_for_tile();
    let (chans_1, dev_1) = channels_for_tile();
    let _link = IntertileLink::connect(dev_0, dev_1, INTERTILE_BUFSIZE)?;

    let hub_0 = PeripheralHub::new();
    let hub_1 = PeripheralHub::new();
    let id_0 = hub_0.register(chans_0);
    let id_1 = hub_1.register(chans_1);
    let tile_0 = PipeManager::start(hub_0.clone(), id_0, BufferPool::new(NUM_BUFFER_DESCRIPTORS), cfg)?;
    let tile_1 = PipeManager::start(hub_1.clone(), id_1, BufferPool::new(NUM_BUFFER_DESCRIPTORS), cfg)?;
    let _dispatch_0 = CooperativeDispatcher::new(hub_0).spawn()?;
    let _dispatch_1 = CooperativeDispatcher::new(hub_1).spawn()?;

    let mut server_pipe = tile_1.open(I2C_STREAM, I2C_PIPE_ADDR)?;
    // The server hands the bus back after half a second without requests.
    server_pipe.set_timeouts(Timeout::millis(1000), Timeout::millis(500));
    let server = thread::spawn(move || {
        serve_i2c(
            &server_pipe,
            SimCodec {
                regs: [0; 64],
                pointer: 0,
            },
        )
    });

    let client_pipe = tile_0.open(I2C_STREAM, I2C_PIPE_ADDR)?;
    let mut i2c = RemoteI2c::new(&client_pipe);

    // Power up, select line input, set a volume.
    i2c.write(CODEC_ADDR, &[0x30, 0x01, 0x00, 0x3c])?;
    i2c.reg_write(CODEC_ADDR, 0x24, 0x20)?;
    let mut block = [0u8; 4];
    i2c.write_read(CODEC_ADDR, &[0x30], &mut block)?;
    info!("codec power/input/volume block: {:02x?}", block);
    info!("codec reg 0x24 = {:#04x}", i2c.reg_read(CODEC_ADDR, 0x24)?);

    match i2c.write(0x55, &[0]) {
        Err(e) => info!("write to absent device failed as expected: {}", e),
        Ok(()) => info!("write to absent device unexpectedly succeeded"),
    }

    let codec = server.join().map_err(|_| "i2c server panicked")??;
    info!("server stopped; codec reg 0x33 = {:#04x}", codec.regs[0x33]);
    Ok(())
}
