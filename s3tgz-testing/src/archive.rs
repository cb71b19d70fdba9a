//! Decoding the gzip-compressed tar archives produced in tests, so the tests can check exactly what
//! went into them.
use crate::Result;
use color_eyre::eyre::eyre;
use std::io::Read;
use std::path::Path;

/// One entry read back out of an archive
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub mode: u32,
    pub entry_type: tar::EntryType,
    pub data: Vec<u8>,
}

/// Decode a complete `.tar.gz` stream into its entries, in archive order.
///
/// This is stricter than most tar tools: after the end of archive marker, the rest of the gzip
/// stream is read as well, so a missing or corrupt gzip trailer is an error rather than going
/// unnoticed.
pub fn read_tar_gz(reader: impl Read) -> Result<Vec<ArchiveEntry>> {
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(reader));
    let mut entries = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;

        let path = entry.path()?.to_string_lossy().to_string();
        let mode = entry.header().mode()?;
        let entry_type = entry.header().entry_type();

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;

        entries.push(ArchiveEntry {
            path,
            mode,
            entry_type,
            data,
        });
    }

    // Drain the decoder so the gzip CRC and length are verified
    let mut rest = Vec::new();
    archive.into_inner().read_to_end(&mut rest)?;

    if rest.iter().any(|byte| *byte != 0) {
        return Err(eyre!(
            "Archive contains {} bytes of non-zero data after the end of archive marker",
            rest.len()
        ));
    }

    Ok(entries)
}

/// Decode a `.tar.gz` held in memory
pub fn read_tar_gz_bytes(data: &[u8]) -> Result<Vec<ArchiveEntry>> {
    if !is_gzip(data) {
        return Err(eyre!("Archive doesn't start with the gzip magic number"));
    }

    read_tar_gz(data)
}

/// Decode a `.tar.gz` file on the local filesystem
pub async fn read_tar_gz_file(path: &Path) -> Result<Vec<ArchiveEntry>> {
    let data = tokio::fs::read(path).await?;

    read_tar_gz_bytes(&data)
}

/// `true` if `data` begins with the gzip magic number
pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&[0x1f, 0x8b])
}
