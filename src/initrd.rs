//! Tar→initrd conversion.
//!
//! Splits a built system image (a tar stream of the root filesystem) into the
//! three boot artifacts: the kernel binary, the boot command line, and the
//! remaining filesystem re-encoded as a cpio newc archive that a boot loader
//! can load as the initial ramdisk.
//!
//! The conversion is deterministic: entries keep their original order, and
//! running it twice over identical bytes produces identical output.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::Path;

use tar::EntryType;

use crate::error::ConversionError;

/// Name of the source entry holding the kernel binary.
pub const KERNEL_ENTRY: &str = "kernel";

/// Name of the source entry holding the boot command line.
pub const CMDLINE_ENTRY: &str = "cmdline";

const NEWC_MAGIC: &[u8] = b"070701";
const NEWC_TRAILER: &str = "TRAILER!!!";

// File type bits in the cpio mode field.
const C_ISDIR: u32 = 0o040000;
const C_ISREG: u32 = 0o100000;
const C_ISLNK: u32 = 0o120000;
const C_ISCHR: u32 = 0o020000;
const C_ISBLK: u32 = 0o060000;
const C_ISFIFO: u32 = 0o010000;

/// The atomic result of one conversion: kernel, initrd and command line are
/// always produced (and consumed) together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    pub kernel: Vec<u8>,
    /// cpio newc encoded ramdisk contents.
    pub initrd: Vec<u8>,
    pub cmdline: String,
}

/// Split a system image tar into kernel, initrd and command line.
///
/// The first entry named `kernel` becomes the kernel binary and the first
/// entry named `cmdline` becomes the command line; later occurrences of
/// either marker are dropped. Every other entry is re-encoded into the
/// initrd preserving mode, ownership, timestamps, link targets, device
/// numbers and original order.
///
/// Fails if the archive cannot be parsed, if no kernel entry exists, or if
/// a write into the initrd writer fails.
pub fn convert(image: &[u8]) -> Result<ImageArtifact, ConversionError> {
    // Pre-pass so hardlink sets get correct nlink counts up front; the
    // image is in memory, so a second walk over the headers is cheap.
    let link_counts = count_hardlinks(image)?;

    let mut kernel: Option<Vec<u8>> = None;
    let mut cmdline: Option<String> = None;
    let mut writer = InitrdWriter::new(Vec::new());

    let mut archive = tar::Archive::new(image);
    for entry in archive.entries().map_err(ConversionError::Archive)? {
        let mut entry = entry.map_err(ConversionError::Archive)?;
        let name = {
            let path = entry.path().map_err(ConversionError::Archive)?;
            normalize_name(&path)
        };
        if name.is_empty() {
            continue;
        }
        match name.as_str() {
            KERNEL_ENTRY if kernel.is_none() => {
                kernel = Some(read_body(&mut entry)?);
            }
            CMDLINE_ENTRY if cmdline.is_none() => {
                let body = read_body(&mut entry)?;
                cmdline = Some(String::from_utf8_lossy(&body).into_owned());
            }
            // First occurrence wins; duplicate markers are dropped.
            KERNEL_ENTRY | CMDLINE_ENTRY => {}
            _ => writer.append_tar_entry(&name, &mut entry, &link_counts)?,
        }
    }

    let kernel = kernel.ok_or(ConversionError::MissingKernel)?;
    let initrd = writer.finish().map_err(|source| ConversionError::InitrdWrite {
        name: NEWC_TRAILER.to_string(),
        source,
    })?;

    Ok(ImageArtifact {
        kernel,
        initrd,
        cmdline: cmdline.unwrap_or_default(),
    })
}

/// cpio newc archive writer.
///
/// Writes the binary contract the boot loader expects: 110-byte ASCII-hex
/// headers, NUL-terminated names, 4-byte alignment after both name and body,
/// and a `TRAILER!!!` record on [`finish`](Self::finish).
pub struct InitrdWriter<W: Write> {
    out: W,
    written: u64,
    next_ino: u32,
    // emitted name -> assigned inode, for hardlink back-references
    inodes: HashMap<String, u32>,
}

struct EntryMeta {
    ino: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    mtime: u32,
    rdevmajor: u32,
    rdevminor: u32,
}

impl<W: Write> InitrdWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            written: 0,
            next_ino: 1,
            inodes: HashMap::new(),
        }
    }

    /// Re-encode one tar entry into the archive.
    ///
    /// `link_counts` maps hardlink target names to the number of link
    /// entries referencing them, so the target itself can carry the full
    /// nlink count (the kernel loader needs it to reconstruct the set).
    fn append_tar_entry<R: Read>(
        &mut self,
        name: &str,
        entry: &mut tar::Entry<'_, R>,
        link_counts: &HashMap<String, u32>,
    ) -> Result<(), ConversionError> {
        let header = entry.header().clone();
        let perm = header.mode().map_err(ConversionError::Archive)? & 0o7777;
        let uid = header.uid().map_err(ConversionError::Archive)? as u32;
        let gid = header.gid().map_err(ConversionError::Archive)? as u32;
        let mtime = header.mtime().map_err(ConversionError::Archive)? as u32;

        let mut meta = EntryMeta {
            ino: self.next_ino,
            mode: perm,
            uid,
            gid,
            nlink: 1,
            mtime,
            rdevmajor: 0,
            rdevminor: 0,
        };

        match header.entry_type() {
            EntryType::Directory => {
                meta.mode |= C_ISDIR;
                meta.nlink = 2;
                self.write_entry(name, &meta, &[])
            }
            EntryType::Symlink => {
                let target = link_target(entry)?;
                meta.mode |= C_ISLNK;
                self.write_entry(name, &meta, target.as_bytes())
            }
            EntryType::Link => {
                // Share the inode assigned to the target; the data already
                // travelled with the first member of the set.
                let target = link_target(entry)?;
                let ino = *self.inodes.get(target.as_str()).ok_or_else(|| {
                    ConversionError::DanglingHardlink {
                        name: name.to_string(),
                        target: target.clone(),
                    }
                })?;
                meta.ino = ino;
                meta.mode |= C_ISREG;
                meta.nlink = 1 + link_counts.get(target.as_str()).copied().unwrap_or(0);
                self.write_linked(name, &meta, &[])
            }
            EntryType::Char => {
                meta.mode |= C_ISCHR;
                let (major, minor) = device_numbers(&header)?;
                meta.rdevmajor = major;
                meta.rdevminor = minor;
                self.write_entry(name, &meta, &[])
            }
            EntryType::Block => {
                meta.mode |= C_ISBLK;
                let (major, minor) = device_numbers(&header)?;
                meta.rdevmajor = major;
                meta.rdevminor = minor;
                self.write_entry(name, &meta, &[])
            }
            EntryType::Fifo => {
                meta.mode |= C_ISFIFO;
                self.write_entry(name, &meta, &[])
            }
            // Long-name/pax metadata entries were already folded into the
            // entry by the tar reader.
            EntryType::XHeader | EntryType::XGlobalHeader => Ok(()),
            EntryType::GNULongName | EntryType::GNULongLink => Ok(()),
            // Regular files, plus unknown typeflags (the tar convention is
            // to treat those as regular files rather than drop them).
            _ => {
                let body = read_body(entry)?;
                meta.mode |= C_ISREG;
                meta.nlink = 1 + link_counts.get(name).copied().unwrap_or(0);
                self.write_entry(name, &meta, &body)
            }
        }
    }

    fn write_entry(
        &mut self,
        name: &str,
        meta: &EntryMeta,
        data: &[u8],
    ) -> Result<(), ConversionError> {
        self.next_ino += 1;
        self.inodes.insert(name.to_string(), meta.ino);
        self.emit(name, meta, data)
            .map_err(|source| ConversionError::InitrdWrite {
                name: name.to_string(),
                source,
            })
    }

    // Like write_entry but reuses an existing inode (hardlinks).
    fn write_linked(
        &mut self,
        name: &str,
        meta: &EntryMeta,
        data: &[u8],
    ) -> Result<(), ConversionError> {
        self.inodes.insert(name.to_string(), meta.ino);
        self.emit(name, meta, data)
            .map_err(|source| ConversionError::InitrdWrite {
                name: name.to_string(),
                source,
            })
    }

    fn emit(&mut self, name: &str, meta: &EntryMeta, data: &[u8]) -> io::Result<()> {
        if data.len() > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry '{name}' exceeds the 4 GiB cpio size limit"),
            ));
        }
        self.write_header(name, meta, data.len() as u32)?;
        self.out.write_all(data)?;
        self.written += data.len() as u64;
        self.pad4()
    }

    fn write_header(&mut self, name: &str, meta: &EntryMeta, filesize: u32) -> io::Result<()> {
        self.out.write_all(NEWC_MAGIC)?;
        let fields = [
            meta.ino,
            meta.mode,
            meta.uid,
            meta.gid,
            meta.nlink,
            meta.mtime,
            filesize,
            0, // devmajor
            0, // devminor
            meta.rdevmajor,
            meta.rdevminor,
            name.len() as u32 + 1,
            0, // check, always zero in newc
        ];
        for field in fields {
            write!(self.out, "{field:08x}")?;
        }
        self.out.write_all(name.as_bytes())?;
        self.out.write_all(&[0])?;
        self.written += 110 + name.len() as u64 + 1;
        self.pad4()
    }

    fn pad4(&mut self) -> io::Result<()> {
        let rem = (self.written % 4) as usize;
        if rem != 0 {
            self.out.write_all(&[0u8; 4][..4 - rem])?;
            self.written += (4 - rem) as u64;
        }
        Ok(())
    }

    /// Write the trailer record and return the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        let trailer = EntryMeta {
            ino: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            nlink: 1,
            mtime: 0,
            rdevmajor: 0,
            rdevminor: 0,
        };
        self.write_header(NEWC_TRAILER, &trailer, 0)?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Count, per target name, how many hardlink entries reference it.
fn count_hardlinks(image: &[u8]) -> Result<HashMap<String, u32>, ConversionError> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    let mut archive = tar::Archive::new(image);
    for entry in archive.entries().map_err(ConversionError::Archive)? {
        let mut entry = entry.map_err(ConversionError::Archive)?;
        if entry.header().entry_type() != EntryType::Link {
            continue;
        }
        let target = link_target(&mut entry)?;
        *counts.entry(target).or_insert(0) += 1;
    }
    Ok(counts)
}

fn link_target<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<String, ConversionError> {
    let target = entry
        .link_name()
        .map_err(ConversionError::Archive)?
        .ok_or_else(|| {
            ConversionError::Archive(io::Error::new(
                io::ErrorKind::InvalidData,
                "link entry without a target",
            ))
        })?;
    Ok(normalize_name(&target))
}

fn device_numbers(header: &tar::Header) -> Result<(u32, u32), ConversionError> {
    let major = header
        .device_major()
        .map_err(ConversionError::Archive)?
        .unwrap_or(0);
    let minor = header
        .device_minor()
        .map_err(ConversionError::Archive)?
        .unwrap_or(0);
    Ok((major, minor))
}

fn read_body<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Vec<u8>, ConversionError> {
    let mut buf = Vec::new();
    entry
        .read_to_end(&mut buf)
        .map_err(ConversionError::Archive)?;
    Ok(buf)
}

// Tar names come in as `./kernel`, `etc/`, `.` and similar; cpio entries use
// plain relative names without the leading `./` or trailing slash.
fn normalize_name(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let trimmed = raw.strip_prefix("./").unwrap_or(&raw);
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed == "." {
        return String::new();
    }
    trimmed.to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Decoded newc entry, for asserting on writer output.
    pub(crate) struct NewcEntry {
        pub name: String,
        pub ino: u32,
        pub mode: u32,
        pub uid: u32,
        pub gid: u32,
        pub nlink: u32,
        pub rdev: (u32, u32),
        pub data: Vec<u8>,
    }

    fn hex_field(header: &[u8], index: usize) -> u32 {
        let start = 6 + index * 8;
        let text = std::str::from_utf8(&header[start..start + 8]).unwrap();
        u32::from_str_radix(text, 16).unwrap()
    }

    fn align4(n: usize) -> usize {
        n.div_ceil(4) * 4
    }

    /// Minimal newc reader used only by tests.
    pub(crate) fn read_newc(bytes: &[u8]) -> Vec<NewcEntry> {
        let mut entries = Vec::new();
        let mut pos = 0;
        loop {
            let header = &bytes[pos..pos + 110];
            assert_eq!(&header[..6], NEWC_MAGIC, "bad magic at offset {pos}");
            let filesize = hex_field(header, 6) as usize;
            let namesize = hex_field(header, 11) as usize;
            let name =
                String::from_utf8(bytes[pos + 110..pos + 110 + namesize - 1].to_vec()).unwrap();
            pos += align4(110 + namesize);
            if name == NEWC_TRAILER {
                assert_eq!(pos, bytes.len(), "bytes after trailer");
                return entries;
            }
            let data = bytes[pos..pos + filesize].to_vec();
            pos += align4(filesize);
            entries.push(NewcEntry {
                name,
                ino: hex_field(header, 0),
                mode: hex_field(header, 1),
                uid: hex_field(header, 2),
                gid: hex_field(header, 3),
                nlink: hex_field(header, 4),
                rdev: (hex_field(header, 9), hex_field(header, 10)),
                data,
            });
        }
    }

    /// Build an in-memory tar of regular files.
    pub(crate) fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for &(name, data) in files {
            append_file(&mut builder, name, data, 0o644);
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn append_file(
        builder: &mut tar::Builder<Vec<u8>>,
        name: &str,
        data: &[u8],
        mode: u32,
    ) {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }

    #[test]
    fn splits_minimal_image() {
        let image = tar_of(&[
            ("kernel", b"KERNELBYTES"),
            ("cmdline", b"console=ttyS0"),
            ("etc/hostname", b"box"),
        ]);

        let artifact = convert(&image).unwrap();
        assert_eq!(artifact.kernel, b"KERNELBYTES");
        assert_eq!(artifact.cmdline, "console=ttyS0");

        let entries = read_newc(&artifact.initrd);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "etc/hostname");
        assert_eq!(entries[0].data, b"box");
        assert_eq!(entries[0].mode, C_ISREG | 0o644);
    }

    #[test]
    fn conversion_is_idempotent() {
        let image = tar_of(&[
            ("kernel", b"vmlinuz"),
            ("cmdline", b"root=/dev/ram0"),
            ("bin/sh", b"#!ELF"),
            ("etc/motd", b"hello"),
        ]);

        let first = convert(&image).unwrap();
        let second = convert(&image).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_kernel_is_an_error() {
        let image = tar_of(&[("cmdline", b"quiet"), ("etc/motd", b"hi")]);
        let err = convert(&image).unwrap_err();
        assert!(matches!(err, ConversionError::MissingKernel));
    }

    #[test]
    fn garbage_input_is_a_parse_error() {
        // Non-zero junk that is not a tar header.
        let junk = vec![0xabu8; 1024];
        let err = convert(&junk).unwrap_err();
        assert!(matches!(err, ConversionError::Archive(_)));
    }

    #[test]
    fn first_cmdline_wins() {
        let image = tar_of(&[
            ("kernel", b"k"),
            ("cmdline", b"first"),
            ("cmdline", b"second"),
            ("etc/one", b"1"),
        ]);

        let artifact = convert(&image).unwrap();
        assert_eq!(artifact.cmdline, "first");
        // The duplicate marker is dropped, not re-emitted into the initrd.
        let entries = read_newc(&artifact.initrd);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "etc/one");
    }

    #[test]
    fn entry_order_is_preserved() {
        let image = tar_of(&[
            ("kernel", b"k"),
            ("z/last", b"z"),
            ("a/first", b"a"),
            ("m/middle", b"m"),
        ]);

        let artifact = convert(&image).unwrap();
        let names: Vec<_> = read_newc(&artifact.initrd)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["z/last", "a/first", "m/middle"]);
    }

    #[test]
    fn preserves_directories_and_symlinks() {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "kernel", b"k", 0o644);

        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_mtime(42);
        dir.set_uid(1000);
        dir.set_gid(1000);
        dir.set_cksum();
        builder
            .append_data(&mut dir, "etc/", std::io::empty())
            .unwrap();

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        link.set_mtime(0);
        link.set_uid(0);
        link.set_gid(0);
        link.set_cksum();
        builder
            .append_link(&mut link, "etc/mtab", "../proc/mounts")
            .unwrap();

        let image = builder.into_inner().unwrap();
        let artifact = convert(&image).unwrap();
        let entries = read_newc(&artifact.initrd);

        assert_eq!(entries[0].name, "etc");
        assert_eq!(entries[0].mode, C_ISDIR | 0o755);
        assert_eq!(entries[0].nlink, 2);
        assert_eq!(entries[0].uid, 1000);
        assert_eq!(entries[0].gid, 1000);
        assert!(entries[0].data.is_empty());

        assert_eq!(entries[1].name, "etc/mtab");
        assert_eq!(entries[1].mode, C_ISLNK | 0o777);
        assert_eq!(entries[1].data, b"../proc/mounts");
    }

    #[test]
    fn hardlinks_share_an_inode() {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "kernel", b"k", 0o644);
        append_file(&mut builder, "bin/busybox", b"BB", 0o755);

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(EntryType::Link);
        link.set_size(0);
        link.set_mode(0o755);
        link.set_mtime(0);
        link.set_uid(0);
        link.set_gid(0);
        link.set_cksum();
        builder
            .append_link(&mut link, "bin/sh", "bin/busybox")
            .unwrap();

        let image = builder.into_inner().unwrap();
        let artifact = convert(&image).unwrap();
        let entries = read_newc(&artifact.initrd);

        let target = &entries[0];
        let alias = &entries[1];
        assert_eq!(target.name, "bin/busybox");
        assert_eq!(alias.name, "bin/sh");
        assert_eq!(target.ino, alias.ino);
        // Both members report the full set size; only the first carries data.
        assert_eq!(target.nlink, 2);
        assert_eq!(alias.nlink, 2);
        assert_eq!(target.data, b"BB");
        assert!(alias.data.is_empty());
    }

    #[test]
    fn dangling_hardlink_is_an_error() {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "kernel", b"k", 0o644);

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(EntryType::Link);
        link.set_size(0);
        link.set_mode(0o755);
        link.set_mtime(0);
        link.set_uid(0);
        link.set_gid(0);
        link.set_cksum();
        builder
            .append_link(&mut link, "bin/sh", "bin/missing")
            .unwrap();

        let image = builder.into_inner().unwrap();
        let err = convert(&image).unwrap_err();
        assert!(matches!(err, ConversionError::DanglingHardlink { .. }));
    }

    #[test]
    fn preserves_device_nodes() {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "kernel", b"k", 0o644);

        let mut dev = tar::Header::new_gnu();
        dev.set_entry_type(EntryType::Char);
        dev.set_size(0);
        dev.set_mode(0o666);
        dev.set_mtime(0);
        dev.set_uid(0);
        dev.set_gid(0);
        dev.set_device_major(1).unwrap();
        dev.set_device_minor(3).unwrap();
        dev.set_cksum();
        builder
            .append_data(&mut dev, "dev/null", std::io::empty())
            .unwrap();

        let image = builder.into_inner().unwrap();
        let artifact = convert(&image).unwrap();
        let entries = read_newc(&artifact.initrd);

        assert_eq!(entries[0].name, "dev/null");
        assert_eq!(entries[0].mode, C_ISCHR | 0o666);
        assert_eq!(entries[0].rdev, (1, 3));
    }

    #[test]
    fn leading_dot_slash_is_stripped() {
        let image = tar_of(&[("./kernel", b"k"), ("./cmdline", b"c"), ("./etc/a", b"a")]);
        let artifact = convert(&image).unwrap();
        assert_eq!(artifact.kernel, b"k");
        assert_eq!(artifact.cmdline, "c");
        let entries = read_newc(&artifact.initrd);
        assert_eq!(entries[0].name, "etc/a");
    }

    #[test]
    fn initrd_bodies_are_aligned() {
        let image = tar_of(&[("kernel", b"k"), ("f", b"abc")]);
        let artifact = convert(&image).unwrap();
        assert_eq!(artifact.initrd.len() % 4, 0);
        // Trailer must terminate the stream; read_newc asserts that.
        read_newc(&artifact.initrd);
    }
}
