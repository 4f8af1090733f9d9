//! Decoding turns fetched bytes into a cacheable [`ImageContainer`].

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::cache::{DecodeConstraints, ImageContainer};
use crate::error::{Error, Result};

/// Decoder output
#[derive(Debug)]
pub struct Decoded<C> {
    pub image: C,
    /// The decode wrote into the offered reuse candidate's allocation
    pub reused_allocation: bool,
}

impl<C> Decoded<C> {
    pub fn fresh(image: C) -> Self {
        Self {
            image,
            reused_allocation: false,
        }
    }
}

/// Platform decoder
///
/// Runs on the blocking pool. `reuse` is a cached image whose allocation
/// fits `constraints`; a decoder that writes into it must report
/// `reused_allocation` so the old entry is not disposed afterwards.
pub trait ImageDecoder: Send + Sync + 'static {
    type Image: ImageContainer;

    fn decode(
        &self,
        data: Bytes,
        constraints: Option<&DecodeConstraints>,
        reuse: Option<&Self::Image>,
    ) -> Result<Decoded<Self::Image>>;
}

/// Undecoded bytes held as an image
#[derive(Debug)]
pub struct EncodedImage {
    data: Bytes,
    disposed: AtomicBool,
}

impl EncodedImage {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl ImageContainer for EncodedImage {
    fn size_in_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_valid(&self) -> bool {
        !self.disposed.load(Ordering::Acquire)
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

/// Wraps the fetched bytes without decoding them
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughDecoder;

impl ImageDecoder for PassthroughDecoder {
    type Image = EncodedImage;

    fn decode(
        &self,
        data: Bytes,
        _constraints: Option<&DecodeConstraints>,
        _reuse: Option<&EncodedImage>,
    ) -> Result<Decoded<EncodedImage>> {
        if data.is_empty() {
            return Err(Error::Decode("no image data".to_string()));
        }
        Ok(Decoded::fresh(EncodedImage::new(data)))
    }
}
