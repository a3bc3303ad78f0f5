//! Reading firmware images from files and other streams.

use std::io::{self, ErrorKind, Read};

const CHUNK_SIZE: usize = 65536;

pub trait ReadExt {
    /// Append up to `read_len` bytes to `vec`, stopping short only at EOF.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()>;

    /// Read the rest of the stream as one image, which may not exceed `limit` bytes.
    fn read_image(&mut self, limit: usize) -> io::Result<Vec<u8>>;
}

impl<T: Read> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()> {
        let end = vec.len().saturating_add(read_len);
        let mut cursor = vec.len();

        while cursor < end {
            vec.resize(std::cmp::min(end, cursor + CHUNK_SIZE), 0u8);

            match self.read(&mut vec[cursor..]) {
                Ok(0) => break,
                Ok(n) => cursor += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => {
                    vec.truncate(cursor);
                    return Err(e);
                }
            }
        }

        vec.truncate(cursor);
        Ok(())
    }

    fn read_image(&mut self, limit: usize) -> io::Result<Vec<u8>> {
        let mut image = Vec::new();
        self.read_to_vec(&mut image, limit.saturating_add(1))?;

        if image.len() > limit {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("image exceeds 0x{limit:x} bytes"),
            ));
        }

        Ok(image)
    }
}

#[test]
fn test_read_to_vec() -> io::Result<()> {
    let mut vec = Vec::new();
    io::repeat(0xAA).read_to_vec(&mut vec, 4)?;
    assert_eq!(vec, [0xAA; 4]);
    (&[1, 2, 3][..]).read_to_vec(&mut vec, 8)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_read_image() -> io::Result<()> {
    let data = vec![0x5Au8; 3 * CHUNK_SIZE + 17];

    assert_eq!((&data[..]).read_image(data.len())?, data);
    assert_eq!((&data[..0]).read_image(16)?, []);

    let err = (&data[..]).read_image(data.len() - 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);

    Ok(())
}
