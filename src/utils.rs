use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use md5::{Digest, Md5};
use sha1::Sha1;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{FsError, FsResult};

/// Formats a timestamp the way every externally visible timestamp in the
/// engine is rendered: RFC3339 with sub-second precision preserved.
pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

pub fn parse_timestamp(raw: &str) -> FsResult<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|_| FsError::InvalidReference(format!("unparseable timestamp {raw:?}")))
}

/// The on-disk modification time of `path` as an [`OffsetDateTime`].
pub fn disk_mtime(path: &Path) -> FsResult<OffsetDateTime> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(OffsetDateTime::from(modified))
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// The three content checksums carried by every file node.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ContentChecksums {
    pub sha1: String,
    pub md5: String,
    pub adler32: String,
}

/// Computes all three checksums in a single streaming pass over the file
/// contents. Call from a blocking context, the read is synchronous.
pub fn checksum_file(path: &Path) -> FsResult<(ContentChecksums, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut sha1 = Sha1::new();
    let mut md5 = Md5::new();
    let mut adler = adler32::RollingAdler32::new();

    let mut total = 0u64;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }

        sha1.update(&buffer[..read]);
        md5.update(&buffer[..read]);
        adler.update_buffer(&buffer[..read]);
        total += read as u64;
    }

    let checksums = ContentChecksums {
        sha1: to_hex(&sha1.finalize()),
        md5: to_hex(&md5.finalize()),
        adler32: format!("{:08x}", adler.hash()),
    };

    Ok((checksums, total))
}

/// Cooperative cancellation handle passed into long-running scans. Honoured
/// at every file boundary; partial writes committed before cancellation are
/// not rolled back.
#[derive(Clone, Debug, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> FsResult<()> {
        if self.is_cancelled() {
            Err(FsError::Cancelled)
        } else {
            Ok(())
        }
    }
}
