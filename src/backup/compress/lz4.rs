use lz4_flex::frame::FrameEncoder;
use std::io::Write;

/// LZ4 frame format; the level setting does not apply.
pub fn build_compressor<W: Write>(writer: W) -> FrameEncoder<W> {
    FrameEncoder::new(writer)
}
