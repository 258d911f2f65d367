//! Zip bundles of workload logs.
//!
//! The client packs a phase's loadgen log directory into one zip before
//! uploading it; the server unpacks it next to the phase's `spl.txt`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Zip every file below `src` into `dest`, with paths relative to `src`.
///
/// Returns the number of files written.
pub fn zip_dir(src: &Path, dest: &Path) -> io::Result<usize> {
    let mut files = Vec::new();
    collect_files(src, &mut files)?;
    files.sort();

    let mut zip = ZipWriter::new(File::create(dest)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for path in &files {
        let relative = path
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        zip.start_file(name, options).map_err(zip_error)?;
        zip.write_all(&fs::read(path)?)?;
    }
    zip.finish().map_err(zip_error)?;
    Ok(files.len())
}

/// Unpack `archive` into `dest`, replacing whatever `dest` held before.
///
/// Entries that would land outside `dest` are rejected by the zip reader.
pub fn extract_zip(archive: &Path, dest: &Path) -> io::Result<usize> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)?;
    let mut zip = ZipArchive::new(File::open(archive)?).map_err(zip_error)?;
    let count = zip.len();
    zip.extract(dest).map_err(zip_error)?;
    Ok(count)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn zip_error(err: zip::result::ZipError) -> io::Error {
    match err {
        zip::result::ZipError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}
