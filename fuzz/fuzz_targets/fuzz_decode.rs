#![no_main]
use libfuzzer_sys::fuzz_target;
use rasterstack::{Reference, translate};

fuzz_target!(|data: &[u8]| {
    // Auto-detect decode of arbitrary bytes must return an error, never
    // panic.
    let source = Reference::from_slice(data).with_format(".ANYF");
    let mut raw = Reference::new_owned().with_format("R8G8B8A8*REPA255");
    let _ = translate(&source, &mut raw, false);

    // Explicit containers too, including the headerless DIB path.
    for format in [".BMP", ".DIB", ".PNG", ".JPG"] {
        let source = Reference::from_slice(data).with_format(format);
        let mut raw = Reference::new_owned().with_format("R8G8B8A8*REPA255");
        let _ = translate(&source, &mut raw, false);
    }
});
