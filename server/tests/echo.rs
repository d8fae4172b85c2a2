// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end tests against the raw TCP surface.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use virvel::server::ConnCounter;
use virvel::{LoopHandle, TcpServer};

fn connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(Duration::from_secs(10)))
                    .unwrap();
                return stream;
            }
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Err(err) => panic!("connect failed: {err}"),
        }
    }
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(20));
    }
}

fn start_echo(threads: usize) -> (u16, LoopHandle, ConnCounter) {
    let server = TcpServer::new(0).unwrap();
    server.set_thread_count(threads);
    server.set_message_callback(|conn, buf| {
        let msg = buf.take(buf.remaining());
        conn.send(&msg);
    });
    let port = server.port();
    let handle = server.handle();
    let counter = server.counter();
    let mut server = server;
    thread::spawn(move || server.start());
    (port, handle, counter)
}

#[test]
fn echo_roundtrip_then_count_returns_to_zero() {
    let (port, handle, counter) = start_echo(2);

    let mut client = connect(port);
    client.write_all(b"ping\n").unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(b"ping\n", &reply);
    assert_eq!(1, counter.get());

    drop(client);
    wait_until("connection count to drop to zero", || counter.get() == 0);

    handle.quit();
}

#[test]
fn concurrent_clients_each_get_their_own_echo() {
    let (port, handle, counter) = start_echo(2);

    let mut clients: Vec<TcpStream> = (0..3).map(|_| connect(port)).collect();
    for (at, client) in clients.iter_mut().enumerate() {
        let msg = format!("client-{at}\n");
        client.write_all(msg.as_bytes()).unwrap();
        let mut reply = vec![0u8; msg.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(msg.as_bytes(), &reply[..]);
    }
    assert_eq!(3, counter.get());

    drop(clients);
    wait_until("all connections to release", || counter.get() == 0);
    handle.quit();
}

#[test]
fn idle_connection_is_evicted_after_its_timeout() {
    let server = TcpServer::new(0).unwrap();
    server.set_connected_callback(|conn| conn.enable_inactive_release(2));
    let port = server.port();
    let handle = server.handle();
    let mut server = server;
    thread::spawn(move || server.start());

    let mut client = connect(port);
    // No traffic: after ~2 ticks the server releases the connection and the
    // client observes a clean EOF.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(0, n);

    handle.quit();
}

#[test]
fn active_connection_outlives_its_idle_timeout() {
    let server = TcpServer::new(0).unwrap();
    server.set_connected_callback(|conn| conn.enable_inactive_release(2));
    server.set_message_callback(|conn, buf| {
        let msg = buf.take(buf.remaining());
        conn.send(&msg);
    });
    let port = server.port();
    let handle = server.handle();
    let mut server = server;
    thread::spawn(move || server.start());

    let mut client = connect(port);
    // Keep the connection busy well past the 2s deadline: every event
    // refreshes the idle timer.
    for _ in 0..4 {
        thread::sleep(Duration::from_millis(900));
        client.write_all(b"hi\n").unwrap();
        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(b"hi\n", &reply);
    }

    handle.quit();
}
