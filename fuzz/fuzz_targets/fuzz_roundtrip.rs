#![no_main]
use libfuzzer_sys::fuzz_target;
use rasterstack::{Reference, translate};

fuzz_target!(|data: &[u8]| {
    // Interpret the input as small RGBA pixel data; encoding it to PNG
    // and decoding again must reproduce it exactly.
    if data.len() < 4 {
        return;
    }
    let w = (usize::from(data[0]) % 16) + 1;
    let h = (usize::from(data[1]) % 16) + 1;
    let pixels = &data[2..];
    if pixels.len() < w * h * 4 {
        return;
    }
    let pixels = &pixels[..w * h * 4];

    let source = Reference::from_slice(pixels)
        .with_format("R8G8B8A8")
        .with_size(w as i32, h as i32);
    let mut png = Reference::new_owned().with_format(".PNG");
    translate(&source, &mut png, false).expect("raw RGBA must encode");

    let encoded = Reference::from_slice(png.data()).with_format(".PNG");
    let mut decoded = Reference::new_owned().with_format("R8G8B8A8");
    translate(&encoded, &mut decoded, false).expect("own output must decode");

    assert_eq!(decoded.data(), pixels, "roundtrip pixel mismatch");
    assert_eq!((decoded.w, decoded.h), (w as i32, h as i32));
});
