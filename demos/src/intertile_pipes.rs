//! Two tiles exchanging frames over intertile pipes.
//!
//! ```text
//!   tile 0                                      tile 1
//!   PipeManager ── hub ── relay ──► hub ── PipeManager
//!      pipe (0, 1)  ◄──── relay ───────        pipe (0, 1)
//! ```
//!
//! Tile 0 sends a handful of frames of increasing size; tile 1 echoes each
//! one back reversed. Run with `RUST_LOG=debug` to watch the pipe manager
//! route frames.

use std::error::Error;
use std::thread;

use log::info;
use soc_hub::buffer::BufferPool;
use soc_hub::constants::{INTERTILE_BUFSIZE, NUM_BUFFER_DESCRIPTORS};
use soc_hub::hub::{CooperativeDispatcher, PeripheralHub};
use soc_hub::intertile::{channels_for_tile, IntertileLink};
use soc_hub::osal::Timeout;
use soc_hub::pipe::{PipeManager, PipeManagerConfig};

const ROUNDS: usize = 8;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = PipeManagerConfig {
        recv_timeout: Timeout::millis(1000),
        ..Default::default()
    };

    let (chans_0, dev_0) = channels_for_tile();
    let (chans_1, dev_1) = channels_for_tile();
    let _link = IntertileLink::connect(dev_0, dev_1, INTERTILE_BUFSIZE)?;

    let hub_0 = PeripheralHub::new();
    let hub_1 = PeripheralHub::new();
    let id_0 = hub_0.register(chans_0);
    let id_1 = hub_1.register(chans_1);
    let tile_0 = PipeManager::start(hub_0.clone(), id_0, BufferPool::new(NUM_BUFFER_DESCRIPTORS), cfg)?;
    let tile_1 = PipeManager::start(hub_1.clone(), id_1, BufferPool::new(NUM_BUFFER_DESCRIPTORS), cfg)?;
    let dispatch_0 = CooperativeDispatcher::new(hub_0).spawn()?;
    let dispatch_1 = CooperativeDispatcher::new(hub_1).spawn()?;

    let ping = tile_0.open(0, 1)?;
    let pong = tile_1.open(0, 1)?;

    let echo = thread::spawn(move || -> Result<usize, soc_hub::error::PipeError> {
        let mut echoed = 0;
        for _ in 0..ROUNDS {
            let frame = pong.recv()?;
            let mut reply = frame.to_vec();
            reply.reverse();
            // Release the receive buffer before sending.
            drop(frame);
            pong.send(&reply)?;
            echoed += 1;
        }
        Ok(echoed)
    });

    for round in 0..ROUNDS {
        let len = (round + 1) * cfg.max_payload() / ROUNDS;
        let msg: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        ping.send(&msg)?;
        let reply = ping.recv()?;
        let ok = reply.iter().rev().eq(msg.iter());
        info!("round {}: {} bytes, echo {}", round, len, if ok { "ok" } else { "MISMATCH" });
    }

    let echoed = echo.join().map_err(|_| "echo thread panicked")??;
    info!(
        "echoed {} frames; tile 1 pool {:?}",
        echoed,
        tile_1.pool().stats()
    );

    dispatch_0.shutdown();
    dispatch_1.shutdown();
    Ok(())
}
