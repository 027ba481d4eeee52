//! Helpers shared by the unit tests

use crate::config::Role;
use crate::connection::ConnectionEstablisher;
use crate::endpoint::RemoteMemoryEndpoint;
use crate::rendezvous::RendezvousChannel;
use crate::transport::{AccessFlags, Backend, LoopbackFabric, TransportConfig};
use std::net::TcpListener;
use std::thread;

pub(crate) fn channel_pair() -> (RendezvousChannel, RendezvousChannel) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let accept = thread::spawn(move || RendezvousChannel::accept(&listener).unwrap());
    let client = RendezvousChannel::connect("127.0.0.1", port).unwrap();
    (accept.join().unwrap(), client)
}

pub(crate) fn loopback_config(fabric: &LoopbackFabric) -> TransportConfig {
    TransportConfig {
        backend: Backend::Loopback(fabric.clone()),
        ..Default::default()
    }
}

pub(crate) fn open_endpoint(
    fabric: &LoopbackFabric,
    role: Role,
    channel: RendezvousChannel,
) -> RemoteMemoryEndpoint {
    let config = loopback_config(fabric);
    RemoteMemoryEndpoint::open(role, Box::new(fabric.transport()), &config, channel).unwrap()
}

fn access() -> AccessFlags {
    AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE
}

/// A server with a `rows x columns` grid and a client with one cell,
/// both connected and at RTS.
pub(crate) fn connected_pair(
    fabric: &LoopbackFabric,
    msg_size: usize,
    rows: usize,
    columns: usize,
) -> (RemoteMemoryEndpoint, RemoteMemoryEndpoint) {
    let (server_channel, client_channel) = channel_pair();

    let server_fabric = fabric.clone();
    let server = thread::spawn(move || {
        let mut server = open_endpoint(&server_fabric, Role::Server, server_channel);
        server
            .allocate_and_register(rows * columns * msg_size, msg_size, access())
            .unwrap();
        ConnectionEstablisher::for_endpoint(&server)
            .establish(&mut server, msg_size)
            .unwrap();
        server
    });

    let mut client = open_endpoint(fabric, Role::Client, client_channel);
    client
        .allocate_and_register(msg_size, msg_size, access())
        .unwrap();
    ConnectionEstablisher::for_endpoint(&client)
        .establish(&mut client, msg_size)
        .unwrap();

    (server.join().unwrap(), client)
}
