use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const BLOCK_SIZE: usize = 64 * 1024;

/// SHA-256 of a file's contents, as lowercase hex.
pub fn file_digest(path: &Path) -> io::Result<String> {
    trace!("Hashing {:?}", path);
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0; BLOCK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}
