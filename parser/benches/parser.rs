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

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parser::h1::request::Request;
use parser::h1::{parse_header_line, parse_request_line};

const REQUEST_LINES: &[&str] = &[
    "GET / HTTP/1.1\r\n",
    "GET /index.html HTTP/1.1\r\n",
    "POST /api/v1/widgets?page=2&lang=en+us HTTP/1.1\r\n",
    "DELETE /api/v1/widgets/42 HTTP/1.0\r\n",
    "HEAD /a%20deeply/nested/path/with/many/segments/file.tar.gz HTTP/1.1\r\n",
];

const HEADER_LINES: &[&str] = &[
    "Host: example.com\r\n",
    "Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n",
    "User-Agent: Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0\r\n",
    "Content-Length: 348\r\n",
];

fn bench_request_line(c: &mut Criterion) {
    c.bench_function("parse_request_line", |b| {
        b.iter(|| {
            for line in REQUEST_LINES {
                let mut req = Request::new();
                parse_request_line(black_box(line), &mut req).unwrap();
                black_box(&req);
            }
        })
    });
}

fn bench_header_line(c: &mut Criterion) {
    c.bench_function("parse_header_line", |b| {
        b.iter(|| {
            for line in HEADER_LINES {
                black_box(parse_header_line(black_box(line)).unwrap());
            }
        })
    });
}

criterion_group!(benches, bench_request_line, bench_header_line);
criterion_main!(benches);
