//! Public-API scenarios across two simulated tiles.

use std::thread;
use std::time::{Duration, Instant};

use soc_hub::buffer::BufferPool;
use soc_hub::control::{function_code_rx, function_code_tx, varlist_rx, varlist_tx};
use soc_hub::error::{PipeError, RpcError};
use soc_hub::hub::{chan_pair, CooperativeDispatcher, HubHandle, PeripheralChannels, PeripheralHub};
use soc_hub::intertile::{channels_for_tile, IntertileLink};
use soc_hub::osal::Timeout;
use soc_hub::pipe::{PipeManager, PipeManagerConfig};
use soc_hub::rpc::{ParamDesc, RpcClient, RpcRequest, RpcServer};

const FCODE_ADD: i32 = 7;
const ADD_PARAMS: [ParamDesc; 3] = [ParamDesc::value(4), ParamDesc::value(4), ParamDesc::ret(4)];

struct Tiles {
    a: PipeManager,
    b: PipeManager,
    _hubs: (HubHandle, HubHandle),
    _link: IntertileLink,
}

fn tiles() -> Tiles {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = PipeManagerConfig {
        recv_timeout: Timeout::millis(2000),
        send_timeout: Timeout::millis(2000),
        ..Default::default()
    };
    let (chans_a, dev_a) = channels_for_tile();
    let (chans_b, dev_b) = channels_for_tile();
    let link = IntertileLink::connect(dev_a, dev_b, cfg.frame_size).unwrap();

    let hub_a = PeripheralHub::new();
    let hub_b = PeripheralHub::new();
    let id_a = hub_a.register(chans_a);
    let id_b = hub_b.register(chans_b);
    let a = PipeManager::start(hub_a.clone(), id_a, BufferPool::new(16), cfg).unwrap();
    let b = PipeManager::start(hub_b.clone(), id_b, BufferPool::new(16), cfg).unwrap();
    Tiles {
        a,
        b,
        _hubs: (
            CooperativeDispatcher::new(hub_a).spawn().unwrap(),
            CooperativeDispatcher::new(hub_b).spawn().unwrap(),
        ),
        _link: link,
    }
}

fn add(req: &RpcRequest<'_>) -> Result<Vec<Vec<u8>>, RpcError> {
    if req.fcode != FCODE_ADD {
        return Err(RpcError::UnknownFunction(req.fcode));
    }
    let arg = |i: usize| -> Result<i32, RpcError> {
        let bytes = req.input(i).ok_or(RpcError::ArgCount { expected: 2, got: i })?;
        let word: [u8; 4] = bytes.try_into().map_err(|_| RpcError::ArgLength {
            index: i,
            expected: 4,
            got: bytes.len(),
        })?;
        Ok(i32::from_le_bytes(word))
    };
    let sum = arg(0)?.wrapping_add(arg(1)?);
    Ok(vec![sum.to_le_bytes().to_vec()])
}

#[test]
fn rpc_call_across_tiles() {
    let t = tiles();
    let client_pipe = t.a.open(3, 100).unwrap();
    let server_pipe = t.b.open(3, 100).unwrap();

    let server = thread::spawn(move || {
        let server = RpcServer::new(&server_pipe);
        for _ in 0..3 {
            assert_eq!(server.serve_one(add), Ok(FCODE_ADD));
        }
    });

    let client = RpcClient::new(&client_pipe);
    for (x, y) in [(1, 2), (-40, 2), (i32::MAX, 1)] {
        let out = client
            .call(FCODE_ADD, &ADD_PARAMS, &[&i32::to_le_bytes(x), &i32::to_le_bytes(y)])
            .unwrap();
        assert_eq!(out, vec![x.wrapping_add(y).to_le_bytes().to_vec()]);
    }
    server.join().unwrap();
}

#[test]
fn unknown_function_is_answered() {
    let t = tiles();
    let client_pipe = t.a.open(3, 101).unwrap();
    let server_pipe = t.b.open(3, 101).unwrap();

    let server = thread::spawn(move || {
        let server = RpcServer::new(&server_pipe);
        let first = server.serve_one(add);
        let second = server.serve_one(add);
        (first, second)
    });

    let client = RpcClient::new(&client_pipe);
    let started = Instant::now();
    assert_eq!(
        client.call(42, &ADD_PARAMS, &[&[0; 4], &[0; 4]]),
        Err(RpcError::UnknownFunction(42))
    );
    // Answered, not left to the two second receive timeout.
    assert!(started.elapsed() < Duration::from_millis(1000));

    // The next call sees its own reply.
    let out = client
        .call(FCODE_ADD, &ADD_PARAMS, &[&2i32.to_le_bytes(), &3i32.to_le_bytes()])
        .unwrap();
    assert_eq!(out, vec![5i32.to_le_bytes().to_vec()]);

    let (first, second) = server.join().unwrap();
    assert_eq!(first, Err(RpcError::UnknownFunction(42)));
    assert_eq!(second, Ok(FCODE_ADD));
}

#[test]
fn pipes_are_exclusive_per_address() {
    let t = tiles();
    let _first = t.a.open(0, 9).unwrap();
    assert_eq!(
        t.a.open(0, 9).err(),
        Some(PipeError::AddressInUse { stream: 0, addr: 9 })
    );
    // The peer tile keeps its own table.
    assert!(t.b.open(0, 9).is_ok());
}

#[test]
fn buffers_return_to_the_pool() {
    let t = tiles();
    let tx = t.a.open(1, 1).unwrap();
    let rx = t.b.open(1, 1).unwrap();
    let idle_b = t.b.pool().in_use();

    for i in 0..20u8 {
        tx.send(&[i; 32]).unwrap();
        let got = rx.recv().unwrap();
        assert_eq!(&got[..], &[i; 32][..]);
        assert!(t.b.pool().owns(&got));
    }
    assert_eq!(t.b.pool().in_use(), idle_b);
    let stats = t.b.pool().stats();
    assert_eq!(stats.available + stats.in_use, stats.capacity);
}

#[test]
fn control_channel_reaches_the_device() {
    let hub = PeripheralHub::new();
    let (driver_end, device_end) = chan_pair();
    let id = hub.register(PeripheralChannels {
        control: Some(driver_end),
        ..Default::default()
    });

    let device = thread::spawn(move || {
        let code = function_code_rx(&device_end).unwrap();
        let mut gain = [0u8; 2];
        varlist_rx(&device_end, &mut [&mut gain]).unwrap();
        varlist_tx(&device_end, &[&[1]]).unwrap();
        (code, u16::from_le_bytes(gain))
    });

    let p = hub.peripheral(id);
    let ctrl = p.control().unwrap();
    function_code_tx(ctrl, 0x10).unwrap();
    varlist_tx(ctrl, &[&300u16.to_le_bytes()]).unwrap();
    let mut ok = [0u8];
    varlist_rx(ctrl, &mut [&mut ok]).unwrap();
    assert_eq!(ok, [1]);
    assert_eq!(device.join().unwrap(), (0x10, 300));
}
