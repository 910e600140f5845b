use flate2::write::GzEncoder;
use std::io::Write;

static DEFAULT_GZIP_LEVEL: u32 = 6;
static MAX_GZIP_LEVEL: u32 = 9;

pub fn build_compressor<W: Write>(level: Option<u32>, writer: W) -> GzEncoder<W> {
    let level = level.unwrap_or(DEFAULT_GZIP_LEVEL).min(MAX_GZIP_LEVEL);
    GzEncoder::new(writer, flate2::Compression::new(level))
}
