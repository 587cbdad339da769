//! Byte-stream source capability

use std::io;

/// Anything that can fill a buffer with image bytes.
///
/// `fill` returns the number of bytes placed at the start of `buf`; `0` means
/// end of data. Every [`std::io::Read`] is a source.
pub trait StreamSource {
    /// Fill `buf` and return how many bytes were placed.
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<R: io::Read + ?Sized> StreamSource for R {
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_is_a_source() -> io::Result<()> {
        let mut source = io::Cursor::new(vec![7u8; 10]);
        let mut buf = [0u8; 4];
        assert_eq!(source.fill(&mut buf)?, 4);
        assert_eq!(source.fill(&mut buf)?, 4);
        assert_eq!(source.fill(&mut buf)?, 2);
        assert_eq!(source.fill(&mut buf)?, 0);
        Ok(())
    }
}
