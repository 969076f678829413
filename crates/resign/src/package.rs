use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{Error, Result};

/// Extract an IPA into `dest` and return the unique `.app` directory under
/// `Payload/`.
pub(crate) fn extract(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let file = File::open(archive).map_err(|e| Error::ArchiveUnreadable(e.to_string()))?;
    let mut zip = ZipArchive::new(file).map_err(|e| Error::ArchiveUnreadable(e.to_string()))?;
    fs::create_dir_all(dest)?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| Error::ArchiveUnreadable(e.to_string()))?;
        let Some(rel) = entry.enclosed_name() else {
            continue;
        };
        let outpath = dest.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        io::copy(&mut entry, &mut File::create(&outpath)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&outpath, fs::Permissions::from_mode(mode))?;
            }
        }
    }

    find_app_dir(dest)
}

/// The unique `Payload/<Name>.app` directory. Zero or several `.app`
/// children reject the archive.
pub(crate) fn find_app_dir(dest: &Path) -> Result<PathBuf> {
    let payload = dest.join("Payload");
    if !payload.is_dir() {
        return Err(Error::InvalidBundleLayout);
    }

    let mut apps: Vec<PathBuf> = fs::read_dir(&payload)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.extension().and_then(|e| e.to_str()) == Some("app"))
        .collect();

    match apps.len() {
        1 => Ok(apps.remove(0)),
        _ => Err(Error::InvalidBundleLayout),
    }
}

/// Compress `<workdir>/Payload` into `archive`, `Payload/` at the top
/// level, symlinks and unix permissions preserved.
pub(crate) fn compress(workdir: &Path, archive: &Path) -> Result<()> {
    let file = File::create(archive).map_err(|e| Error::RepackFailed(e.to_string()))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let payload = workdir.join("Payload");
    for entry in WalkDir::new(&payload).follow_links(false) {
        let entry = entry.map_err(|e| Error::RepackFailed(e.to_string()))?;
        let path = entry.path();
        let name = path
            .strip_prefix(workdir)
            .map_err(|e| Error::RepackFailed(e.to_string()))?
            .to_string_lossy()
            .into_owned();

        let metadata = fs::symlink_metadata(path)?;
        if metadata.is_dir() {
            zip.add_directory(format!("{name}/"), options)
                .map_err(|e| Error::RepackFailed(e.to_string()))?;
        } else if metadata.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            zip.add_symlink(name.as_str(), target.to_string_lossy(), options)
                .map_err(|e| Error::RepackFailed(e.to_string()))?;
        } else {
            #[cfg(unix)]
            let options = {
                use std::os::unix::fs::PermissionsExt;
                options.unix_permissions(metadata.permissions().mode())
            };
            zip.start_file(name.as_str(), options)
                .map_err(|e| Error::RepackFailed(e.to_string()))?;
            io::copy(&mut File::open(path)?, &mut zip)?;
        }
    }

    zip.finish().map_err(|e| Error::RepackFailed(e.to_string()))?;
    Ok(())
}
