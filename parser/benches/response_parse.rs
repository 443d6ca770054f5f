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
use gale_parser::{ResponseCallbacks, ResponseParser, Version};

struct NullCallbacks;

impl ResponseCallbacks for NullCallbacks {
    fn on_status(&mut self, _version: Version, _status: u16) {}
    fn on_header_field(&mut self, _data: &[u8]) {}
    fn on_header_value(&mut self, _data: &[u8]) {}
    fn on_body(&mut self, _data: &[u8]) {}
    fn on_message_complete(&mut self) {}
}

fn bench_small_response(c: &mut Criterion) {
    let input = b"HTTP/1.1 200 OK\r\nServer: nginx\r\nContent-Type: text/plain\r\nContent-Length: 13\r\n\r\nHello, world!";

    c.bench_function("parse small response", |b| {
        b.iter(|| {
            let mut parser = ResponseParser::new();
            let mut cb = NullCallbacks;
            parser.execute(black_box(input), &mut cb).unwrap();
        })
    });
}

fn bench_chunked_response(c: &mut Criterion) {
    let input: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
        1a\r\nabcdefghijklmnopqrstuvwxyz\r\n\
        1a\r\nabcdefghijklmnopqrstuvwxyz\r\n\
        0\r\n\r\n";

    c.bench_function("parse chunked response", |b| {
        b.iter(|| {
            let mut parser = ResponseParser::new();
            let mut cb = NullCallbacks;
            parser.execute(black_box(input), &mut cb).unwrap();
        })
    });
}

fn bench_many_headers(c: &mut Criterion) {
    let mut input = String::from("HTTP/1.1 200 OK\r\n");
    for i in 0..32 {
        input.push_str(&format!("X-Custom-Header-{i}: some-value-{i}\r\n"));
    }
    input.push_str("Content-Length: 0\r\n\r\n");
    let input = input.into_bytes();

    c.bench_function("parse response with many headers", |b| {
        b.iter(|| {
            let mut parser = ResponseParser::new();
            let mut cb = NullCallbacks;
            parser.execute(black_box(&input), &mut cb).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_small_response,
    bench_chunked_response,
    bench_many_headers
);
criterion_main!(benches);
