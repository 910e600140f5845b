use crate::backup::result_error::result::Result;
use liblzma::stream::{Check, MtStreamBuilder};
use liblzma::write::XzEncoder;
use std::io::Write;
use std::num::NonZero;

/// Default compression level (balance of speed vs size)
static DEFAULT_COMPRESSION_LEVEL: u32 = 3;
static MAX_COMPRESSION_LEVEL: u32 = 9;
/// Maximum threads to prevent resource exhaustion
static DEFAULT_MAX_PARALLELIZATION: usize = 32;

/// Creates an XZ compressor, multithreaded when more than one core is available.
///
/// Uses half of the available cores, capped at `DEFAULT_MAX_PARALLELIZATION`.
pub fn build_compressor<W: Write>(level: Option<u32>, writer: W) -> Result<XzEncoder<W>> {
    let level = level
        .unwrap_or(DEFAULT_COMPRESSION_LEVEL)
        .min(MAX_COMPRESSION_LEVEL);

    let thread = std::thread::available_parallelism()
        .map(NonZero::get)
        .map(|core| core / 2)
        .map(|t| t.max(1))
        .map(|t| t.min(DEFAULT_MAX_PARALLELIZATION) as u32)
        .unwrap_or(1);

    tracing::debug!("Creating XZ compressor with level={}, threads={}", level, thread);

    if thread == 1 {
        Ok(XzEncoder::new(writer, level))
    } else {
        let stream = MtStreamBuilder::new()
            .preset(level)
            .check(Check::Crc64)
            .threads(thread)
            .encoder()?;
        Ok(XzEncoder::new_stream(writer, stream))
    }
}
