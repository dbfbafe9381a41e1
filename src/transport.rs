//! Transport archive packaging.
//!
//! The three boot artifacts cross the builder-invocation boundary as a tar
//! archive with exactly three entries, fixed names and fixed order. This is
//! the one wire format external builders depend on, so entry names, modes and
//! declared sizes are bit-exact here.

use tar::{EntryType, Header};

use crate::error::PackagingError;
use crate::initrd::ImageArtifact;

/// Entry names of the transport archive, in the order they are written.
pub const TRANSPORT_ENTRIES: [&str; 3] = ["kernel", "initrd.img", "cmdline"];

/// All transport entries are private to the builder, nothing else reads them.
const TRANSPORT_MODE: u32 = 0o600;

/// Wrap kernel, initrd and cmdline into the transport archive.
///
/// Each entry declares exactly the byte count that follows it; the declared
/// size is taken from the slice being written, so a header/body mismatch
/// cannot be emitted. Header or body write failures name the entry.
pub fn package(artifact: &ImageArtifact) -> Result<Vec<u8>, PackagingError> {
    let mut builder = tar::Builder::new(Vec::new());

    append(&mut builder, TRANSPORT_ENTRIES[0], &artifact.kernel)?;
    append(&mut builder, TRANSPORT_ENTRIES[1], &artifact.initrd)?;
    append(&mut builder, TRANSPORT_ENTRIES[2], artifact.cmdline.as_bytes())?;

    builder.into_inner().map_err(|source| PackagingError {
        name: "archive trailer",
        source,
    })
}

fn append(
    builder: &mut tar::Builder<Vec<u8>>,
    name: &'static str,
    data: &[u8],
) -> Result<(), PackagingError> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(TRANSPORT_MODE);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .map_err(|source| PackagingError { name, source })
}
