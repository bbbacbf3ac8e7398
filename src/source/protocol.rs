//! Wire framing for the remote brick protocol (ยง6.2), shared between the
//! client (`remote`) and server (`server`) halves.
//!
//! Text commands are ASCII, `\n`-terminated, one request at a time per
//! connection. `OPEN` and `GETBRICK` responses are binary-framed:
//! `u32_le size | size bytes`.

use std::io::{Read, Write};

use crate::core::error::{Error, Result};

pub const LIST: &str = "LIST";
pub const OPEN: &str = "OPEN";
pub const GETBRICK: &str = "GETBRICK";

/// Read one `\n`-terminated line, not including the newline.
pub fn read_line(stream: &mut impl Read) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream
            .read(&mut byte)
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        if n == 0 {
            if line.is_empty() {
                return Err(Error::ConnectionFailed("connection closed".into()));
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).map_err(|e| Error::InvalidResponse(e.to_string()))
}

pub fn write_line(stream: &mut impl Write, line: &str) -> Result<()> {
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")?;
    Ok(())
}

/// Read a `u32_le size | size bytes` binary frame.
pub fn read_frame(stream: &mut impl Read) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
    Ok(buf)
}

pub fn write_frame(stream: &mut impl Write, data: &[u8]) -> Result<()> {
    stream.write_all(&(data.len() as u32).to_le_bytes())?;
    stream.write_all(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn line_round_trips() {
        let mut buf = Vec::new();
        write_line(&mut buf, "GETBRICK 7").unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_line(&mut cursor).unwrap(), "GETBRICK 7");
    }

    #[test]
    fn frame_round_trips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        assert_eq!(buf.len(), 4 + 5);
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"hello");
    }

    #[test]
    fn empty_line_reads_as_empty_string() {
        let mut cursor = Cursor::new(b"\nrest".to_vec());
        assert_eq!(read_line(&mut cursor).unwrap(), "");
    }
}
