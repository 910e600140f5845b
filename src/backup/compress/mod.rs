pub mod gzip;
pub mod lz4;
pub mod xz;

use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddDebugObjectAndFnName;
use derive_more::{Display, From};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use io_enum::{Read, Write};
use liblzma::read::XzDecoder;
use liblzma::write::XzEncoder;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};
use std::io;
use std::io::{Read, Write};

/// Compression algorithm of an archive; recorded in the manifest so restore
/// can pick the inverse regardless of the current job configuration.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Lz4,
    Xz,
}

#[derive(Write, From)]
pub enum Compressor<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
    Lz4(FrameEncoder<W>),
    Xz(XzEncoder<W>),
}

#[derive(Read, From)]
pub enum Decompressor<R: Read> {
    None(R),
    Gzip(MultiGzDecoder<R>),
    Lz4(FrameDecoder<R>),
    Xz(XzDecoder<R>),
}

pub trait CompressorBuilder<W: Write> {
    fn build_compressor(&self, level: Option<u32>, writer: W) -> Result<Compressor<W>>;
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::Gzip(w) => Finish::finish(w),
            Compressor::Lz4(w) => Finish::finish(w),
            Compressor::Xz(w) => Finish::finish(w),
        }
    }
}

impl<W: Write> CompressorBuilder<W> for Compression {
    fn build_compressor(&self, level: Option<u32>, writer: W) -> Result<Compressor<W>> {
        tracing::debug!("Creating {} compressor with level {:?}", self, level);
        match self {
            Compression::None => Ok(Compressor::None(writer)),
            Compression::Gzip => Ok(gzip::build_compressor(level, writer).into()),
            Compression::Lz4 => Ok(lz4::build_compressor(writer).into()),
            Compression::Xz => xz::build_compressor(level, writer).map(Compressor::from),
        }
        .add_debug_object_and_fn_name(*self, "build_compressor")
    }
}

impl Compression {
    pub fn build_decompressor<R: Read>(&self, reader: R) -> Decompressor<R> {
        match self {
            Compression::None => Decompressor::None(reader),
            Compression::Gzip => MultiGzDecoder::new(reader).into(),
            Compression::Lz4 => FrameDecoder::new(reader).into(),
            Compression::Xz => XzDecoder::new(reader).into(),
        }
    }

    pub fn from_file_ext(ext: &str) -> Option<Self> {
        match ext {
            "gz" => Some(Compression::Gzip),
            "lz4" => Some(Compression::Lz4),
            "xz" => Some(Compression::Xz),
            _ => None,
        }
    }
}

impl FileExtProvider for Compression {
    fn file_ext(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("gz"),
            Compression::Lz4 => Some("lz4"),
            Compression::Xz => Some("xz"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(compression: Compression, data: &[u8]) -> Vec<u8> {
        let mut compressor = compression.build_compressor(None, Vec::new()).unwrap();
        compressor.write_all(data).unwrap();
        let compressed = compressor.finish().unwrap();

        let mut out = Vec::new();
        compression
            .build_decompressor(compressed.as_slice())
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_every_algorithm_inverts() {
        let data = b"The quick brown fox jumps over the lazy dog. ".repeat(500);
        for compression in [
            Compression::None,
            Compression::Gzip,
            Compression::Lz4,
            Compression::Xz,
        ] {
            assert_eq!(round_trip(compression, &data), data, "{compression}");
        }
    }

    #[test]
    fn test_compression_serde_names() {
        let c: Compression = serde_yml::from_str("lz4").unwrap();
        assert_eq!(c, Compression::Lz4);
        assert_eq!(serde_json::to_string(&Compression::Gzip).unwrap(), "\"gzip\"");
        assert_eq!(Compression::default(), Compression::Gzip);
    }

    #[test]
    fn test_file_ext_round_trip() {
        for compression in [Compression::Gzip, Compression::Lz4, Compression::Xz] {
            let ext = compression.file_ext().unwrap();
            assert_eq!(Compression::from_file_ext(ext), Some(compression));
        }
        assert!(Compression::None.file_ext().is_none());
    }
}
