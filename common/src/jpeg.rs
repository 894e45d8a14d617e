//! Splits a concatenated MJPEG byte stream (as written by
//! `ffmpeg -f image2pipe -c:v mjpeg`) into individual JPEG images.

use bytes::{Bytes, BytesMut};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Images larger than this are assumed to be garbage and dropped.
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 16 * 1024 * 1024;

/// Incremental SOI/EOI splitter.  Feed arbitrary chunks with [`push`],
/// complete images come out in order.
///
/// [`push`]: JpegSplitter::push
#[derive(Debug)]
pub struct JpegSplitter {
    buf: BytesMut,
    /// Offset up to which `buf` has been searched for EOI.
    scanned: usize,
    max_image: usize,
}

impl Default for JpegSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IMAGE_BYTES)
    }
}

impl JpegSplitter {
    pub fn new(max_image: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            scanned: 0,
            max_image,
        }
    }

    /// Append `chunk` and return every image completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut images = Vec::new();

        loop {
            if self.scanned == 0 && !self.align_to_soi() {
                break;
            }
            // Search past the SOI marker itself.
            let from = self.scanned.max(SOI.len());
            match find(&self.buf[from..], &EOI) {
                Some(pos) => {
                    let end = from + pos + EOI.len();
                    images.push(self.buf.split_to(end).freeze());
                    self.scanned = 0;
                }
                None => {
                    if self.buf.len() > self.max_image {
                        tracing::warn!(
                            "Dropping {} bytes without JPEG end marker",
                            self.buf.len()
                        );
                        self.buf.clear();
                        self.scanned = 0;
                    } else {
                        // Keep one byte: it may be the 0xFF of a split marker.
                        self.scanned = self.buf.len().saturating_sub(1).max(SOI.len());
                    }
                    break;
                }
            }
        }
        images
    }

    /// Bytes held back waiting for an end marker.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Discard everything before the next SOI.  Returns false when no SOI
    /// is buffered yet.
    fn align_to_soi(&mut self) -> bool {
        match find(&self.buf, &SOI) {
            Some(0) => true,
            Some(pos) => {
                let _ = self.buf.split_to(pos);
                true
            }
            None => {
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let drop = self.buf.len() - keep;
                let _ = self.buf.split_to(drop);
                false
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(fill: u8, len: usize) -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8];
        v.extend(std::iter::repeat(fill).take(len));
        v.extend([0xFF, 0xD9]);
        v
    }

    #[test]
    fn test_split_whole_stream() {
        let mut stream = image(1, 10);
        stream.extend(image(2, 20));
        stream.extend(image(3, 5));

        let mut splitter = JpegSplitter::default();
        let images = splitter.push(&stream);
        assert_eq!(images.len(), 3);
        assert_eq!(images[0].as_ref(), image(1, 10).as_slice());
        assert_eq!(images[1].len(), 24);
        assert_eq!(images[2].as_ref(), image(3, 5).as_slice());
        assert_eq!(splitter.pending(), 0);
    }

    #[test]
    fn test_split_byte_by_byte() {
        let mut stream = vec![0x00, 0x17];
        stream.extend(image(7, 3));
        stream.extend(image(8, 4));

        let mut splitter = JpegSplitter::default();
        let mut images = Vec::new();
        for b in &stream {
            images.extend(splitter.push(std::slice::from_ref(b)));
        }
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].as_ref(), image(7, 3).as_slice());
        assert_eq!(images[1].as_ref(), image(8, 4).as_slice());
    }

    #[test]
    fn test_oversized_image_dropped() {
        let mut splitter = JpegSplitter::new(8);
        assert!(splitter.push(&[0xFF, 0xD8, 0, 0, 0, 0, 0, 0, 0, 0]).is_empty());
        assert_eq!(splitter.pending(), 0);
        let images = splitter.push(&image(5, 2));
        assert_eq!(images.len(), 1);
    }

    #[test]
    fn test_garbage_without_soi() {
        let mut splitter = JpegSplitter::default();
        assert!(splitter.push(&[1, 2, 3, 0xFF]).is_empty());
        assert_eq!(splitter.pending(), 1);
        let images = splitter.push(&[0xD8, 9, 0xFF, 0xD9]);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].as_ref(), &[0xFF, 0xD8, 9, 0xFF, 0xD9]);
    }
}
