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

//! HTTP server demo: `http_server [port] [basedir]`

use std::io::Result;

use log::info;
use virvel::HttpServer;

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let port = args.next().and_then(|arg| arg.parse().ok()).unwrap_or(8888);
    let basedir = args.next();

    let mut server = HttpServer::new(port)?;
    server.set_thread_count(4);
    if let Some(basedir) = basedir {
        server.set_basedir(basedir);
    }

    server.get("/login", |_req, resp| {
        resp.set_content(&b"{\"msg\":\"login ok\"}"[..], "application/json");
    });

    info!("http server listening on {}", server.port());
    server.start();
    Ok(())
}
