#![no_main]

use libfuzzer_sys::fuzz_target;

use gale_parser::{ResponseCallbacks, ResponseParser, Version};

struct NullCallbacks;

impl ResponseCallbacks for NullCallbacks {
    fn on_status(&mut self, _version: Version, _status: u16) {}
    fn on_header_field(&mut self, _data: &[u8]) {}
    fn on_header_value(&mut self, _data: &[u8]) {}
    fn on_body(&mut self, _data: &[u8]) {}
    fn on_message_complete(&mut self) {}
}

fuzz_target!(|data: &[u8]| {
    let mut parser = ResponseParser::new();
    let mut callbacks = NullCallbacks;
    let _ = parser.execute(data, &mut callbacks);
});
