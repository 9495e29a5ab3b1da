//! Worker wire protocol framing.
//!
//! Integers are unsigned 64-bit little-endian. A string is its length
//! followed by the bytes, zero-padded up to the next 8-byte boundary. A
//! string list is a length followed by that many strings. The greeting
//! magics and command tags follow the worker convention of the surrounding
//! system.

use std::io::{self, Read, Write};

pub const WORKER_MAGIC_1: u64 = 0x390c_9deb;
pub const WORKER_MAGIC_2: u64 = 0x5452_eecb;
/// Major version in the high byte, minor in the low byte.
pub const PROTOCOL_VERSION: u64 = 0x202;

/// Query which of the given paths the worker already has.
pub const CMD_QUERY_VALID_PATHS: u64 = 1;
/// Import an export stream into the worker's store.
pub const CMD_IMPORT_PATHS: u64 = 4;
/// Export the given paths as a stream.
pub const CMD_EXPORT_PATHS: u64 = 5;
/// Build the given derivations.
pub const CMD_BUILD_PATHS: u64 = 6;

/// Strings longer than this are treated as a corrupt stream.
const MAX_STRING_LEN: u64 = 64 * 1024 * 1024;

pub fn major_version(version: u64) -> u64 {
    version >> 8
}

pub fn write_u64<W: Write>(w: &mut W, n: u64) -> io::Result<()> {
    w.write_all(&n.to_le_bytes())
}

pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    write_u64(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    w.write_all(&padding(bytes.len() as u64))
}

pub fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let len = read_u64(r)?;
    if len > MAX_STRING_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("string of {len} bytes exceeds the protocol limit"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    let mut pad = [0u8; 8];
    r.read_exact(&mut pad[..padding(len).len()])?;
    String::from_utf8(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("non-UTF-8 string: {e}")))
}

pub fn write_strings<W: Write, S: AsRef<str>>(w: &mut W, items: &[S]) -> io::Result<()> {
    write_u64(w, items.len() as u64)?;
    for item in items {
        write_string(w, item.as_ref())?;
    }
    Ok(())
}

pub fn read_strings<R: Read>(r: &mut R) -> io::Result<Vec<String>> {
    let count = read_u64(r)?;
    if count > MAX_STRING_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("string list of {count} entries exceeds the protocol limit"),
        ));
    }
    let mut items = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        items.push(read_string(r)?);
    }
    Ok(items)
}

fn padding(len: u64) -> &'static [u8] {
    static ZEROES: [u8; 8] = [0u8; 8];
    &ZEROES[..((8 - len % 8) % 8) as usize]
}
