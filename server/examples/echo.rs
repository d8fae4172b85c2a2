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

//! Echo server demo: `echo [port]`

use std::io::Result;

use log::info;
use virvel::TcpServer;

fn main() -> Result<()> {
    env_logger::init();

    let port = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(8080);

    let mut server = TcpServer::new(port)?;
    server.set_thread_count(2);

    server.set_connected_callback(|conn| {
        info!("client connected, id={}", conn.id());
    });

    server.set_message_callback(|conn, buf| {
        let msg = buf.take(buf.remaining());
        conn.send(&msg);
    });

    server.set_closed_callback(|conn| {
        info!("client closed, id={}", conn.id());
    });

    let count = server.counter();
    server.run_every(10, move || {
        info!("connections={}", count.get());
    });

    info!("echo server listening on {}", server.port());
    server.start();
    Ok(())
}
