//! Payload compression (RFC 4253 Section 6.2).
//!
//! `zlib` compresses from the first NEWKEYS onward. `zlib@openssh.com` is
//! the delayed variant: it is negotiated the same way but only switched on
//! once user authentication has succeeded, which the pipeline exposes via
//! [`Compression::is_delayed`].
//!
//! Each direction keeps a single zlib stream for the life of the keys and
//! ends every packet with a sync flush, so the peer can decompress packets
//! one at a time.

use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};
use fynx_platform::{FynxError, FynxResult};

/// Compression algorithms known to the default provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// zlib from the first NEWKEYS
    Zlib,
    /// zlib enabled after authentication
    ZlibOpenssh,
}

impl CompressionAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::ZlibOpenssh => "zlib@openssh.com",
        }
    }

    /// Parses a compression algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "zlib@openssh.com" => Some(CompressionAlgorithm::ZlibOpenssh),
            _ => None,
        }
    }
}

/// Stateful payload compressor for one direction.
pub trait Compression: Send {
    /// Negotiated algorithm name.
    fn name(&self) -> &'static str;

    /// Returns true if compression only starts after authentication.
    fn is_delayed(&self) -> bool {
        false
    }

    /// Compresses one payload.
    fn compress(&mut self, data: &[u8]) -> FynxResult<Vec<u8>>;

    /// Decompresses one payload.
    fn decompress(&mut self, data: &[u8]) -> FynxResult<Vec<u8>>;
}

/// zlib stream pair.
pub struct ZlibCompression {
    name: &'static str,
    delayed: bool,
    max_output: usize,
    compress: Compress,
    decompress: Decompress,
}

impl std::fmt::Debug for ZlibCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibCompression")
            .field("name", &self.name)
            .field("delayed", &self.delayed)
            .field("total_in", &self.compress.total_in())
            .finish()
    }
}

impl ZlibCompression {
    /// Creates a zlib stream pair.
    ///
    /// `max_output` bounds the size of a single decompressed payload.
    pub fn new(delayed: bool, max_output: usize) -> Self {
        Self {
            name: if delayed { "zlib@openssh.com" } else { "zlib" },
            delayed,
            max_output,
            compress: Compress::new(flate2::Compression::default(), true),
            decompress: Decompress::new(true),
        }
    }
}

impl Compression for ZlibCompression {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_delayed(&self) -> bool {
        self.delayed
    }

    fn compress(&mut self, data: &[u8]) -> FynxResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 64);
        let mut input = data;

        loop {
            let before = self.compress.total_in();
            self.compress
                .compress_vec(input, &mut out, FlushCompress::Sync)
                .map_err(|e| FynxError::Protocol(format!("zlib compression failed: {}", e)))?;
            let consumed = (self.compress.total_in() - before) as usize;
            input = &input[consumed..];

            // Sync flush is complete once all input is taken and zlib left
            // spare room in the output buffer.
            if input.is_empty() && out.len() < out.capacity() {
                return Ok(out);
            }
            out.reserve(out.capacity().max(256));
        }
    }

    fn decompress(&mut self, data: &[u8]) -> FynxResult<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(data.len() * 4);
        let mut input = data;

        loop {
            let before = self.decompress.total_in();
            let status = self
                .decompress
                .decompress_vec(input, &mut out, FlushDecompress::Sync)
                .map_err(|e| FynxError::Protocol(format!("zlib decompression failed: {}", e)))?;
            let consumed = (self.decompress.total_in() - before) as usize;
            input = &input[consumed..];

            if out.len() > self.max_output {
                return Err(FynxError::Protocol(format!(
                    "Decompressed payload exceeds {} bytes",
                    self.max_output
                )));
            }
            if status == Status::StreamEnd
                || (input.is_empty() && out.len() < out.capacity())
            {
                return Ok(out);
            }
            if status == Status::BufError && consumed == 0 && out.len() < out.capacity() {
                return Err(FynxError::Protocol(
                    "zlib stream made no progress".to_string(),
                ));
            }
            out.reserve(out.capacity().max(256));
        }
    }
}
