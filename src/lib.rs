//! # rasterstack
//!
//! BMP, PNG, and baseline/progressive JPEG codec built as a stack of
//! reversible pipeline stages over a common pixel model.
//!
//! Every on-disk representation is described by a [`Format`]: an ordered
//! channel layout plus a stack of compression stages (palette expansion,
//! run-length coding, zlib, PNG filtering and Adam7 interlacing, JPEG
//! entropy/DCT/upsampling/color stages). Decoding peels stages off the
//! front of the stack; encoding pushes them back on. Between the two,
//! pixels are converted channel-by-channel through a normalized `f64`
//! space, with optional area-weighted scaling.
//!
//! ## Format strings
//!
//! A [`Reference`] describes its bytes with a free-form format string:
//!
//! - Channel specs: `<TAG><bits>` repeated, e.g. `R8G8B8A8` or `R3G3B2`.
//!   Tags are `A`..`Z`; `_` is reserved/unused (read as nothing, written
//!   as zero).
//! - `*PAD<n>` sets row padding to `n` bytes (0 = none).
//! - `*SAME` (destination only) inherits the source's parsed format.
//! - `*REP<X><Y>` (destination only) fills destination channel `X` from
//!   source channel `Y`, or from a constant when `Y` is a number.
//! - `*ALPHA<X>` selects the alpha tag for alpha-weighted scaling
//!   (default `A`; `_` disables it).
//! - Container tags: `.BMP`, `.DIB` (BMP without the file header),
//!   `.PNG`, `.JPG`, `.ANYF` (auto-detect on read, PNG on write).
//!
//! ## Example
//!
//! ```no_run
//! use rasterstack::{Reference, translate};
//!
//! # fn demo(bmp_bytes: &[u8]) -> Result<(), rasterstack::CodecError> {
//! let source = Reference::from_slice(bmp_bytes).with_format(".ANYF");
//! let mut destination = Reference::new_owned().with_format(".PNG");
//! translate(&source, &mut destination, false)?;
//! // destination.data() now holds a PNG.
//! # Ok(())
//! # }
//! ```
//!
//! Output containers are fixed: BMP writes a `BITMAPV4HEADER` with 32-bit
//! BGRA bitfields, PNG writes truecolor-alpha 8-bit Adam7. JPEG encoding,
//! JPEG arithmetic decoding, and BMP RLE/palette encoding are not
//! implemented and surface as [`CodecError::UnsupportedVariant`].

#![forbid(unsafe_code)]

mod bitio;
mod bmp;
mod error;
mod format;
mod jpeg;
mod limits;
mod pixel;
mod pixelio;
mod png;
mod reference;
mod stage;
mod translate;

pub use bitio::{BitList, BitOrder, BitReader, BitWriter};
pub use error::CodecError;
pub use format::Format;
pub use limits::Limits;
pub use pixel::{Channel, Color, ImageFormat, Pixel, PixelFormat, Replacement};
pub use reference::{Reference, Storage};
pub use stage::Stage;
pub use translate::{detect_format, translate, translate_with_limits};
