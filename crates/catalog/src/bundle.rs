//! Schedule bundle access: a zip archive or an unpacked directory of the
//! same files.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::CatalogError;

/// An opened schedule bundle. Files are read lazily by name.
pub enum Bundle {
    Dir(PathBuf),
    Zip(Box<zip::ZipArchive<File>>),
}

impl Bundle {
    pub fn open(path: &Path) -> Result<Bundle, CatalogError> {
        if path.is_dir() {
            return Ok(Bundle::Dir(path.to_path_buf()));
        }
        if !path.exists() {
            return Err(CatalogError::Missing(path.display().to_string()));
        }
        let archive = zip::ZipArchive::new(File::open(path)?)?;
        Ok(Bundle::Zip(Box::new(archive)))
    }

    /// Read a member file to a string; `Ok(None)` when absent.
    pub fn read(&mut self, name: &str) -> Result<Option<String>, CatalogError> {
        match self {
            Bundle::Dir(dir) => {
                let path = dir.join(name);
                if !path.is_file() {
                    return Ok(None);
                }
                Ok(Some(std::fs::read_to_string(path)?))
            }
            Bundle::Zip(archive) => {
                let mut entry = match archive.by_name(name) {
                    Ok(e) => e,
                    Err(zip::result::ZipError::FileNotFound) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                let mut data = String::new();
                entry.read_to_string(&mut data)?;
                Ok(Some(data))
            }
        }
    }
}
