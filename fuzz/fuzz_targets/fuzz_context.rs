#![no_main]

use libfuzzer_sys::fuzz_target;
use virvel::http::context::HttpContext;
use virvel::Buffer;

// Feed arbitrary bytes through the incremental context in chunks sized by
// the first byte, so the same input exercises many split points.
fuzz_target!(|data: &[u8]| {
    let Some((&step, rest)) = data.split_first() else {
        return;
    };
    let step = usize::from(step).max(1);

    let mut ctx = HttpContext::new();
    let mut buf = Buffer::new();
    for chunk in rest.chunks(step) {
        buf.extend(chunk);
        ctx.recv(&mut buf);
    }
});
