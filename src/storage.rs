//! On-disk artifact tree: `<root>/<group>/<pkg>/<version>/` holds up to four
//! files describing one package version. Files are written once at ingest
//! time and never mutated.

use crate::errors::StorageError;
use std::fs;
use std::path::{Path, PathBuf};

type Result<T> = std::result::Result<T, StorageError>;

/// The four artifact filenames a package version may own.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ArtifactFile {
    ElmJson,
    DocsJson,
    Readme,
    EndpointJson,
}

impl ArtifactFile {
    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactFile::ElmJson => "elm.json",
            ArtifactFile::DocsJson => "docs.json",
            ArtifactFile::Readme => "README.md",
            ArtifactFile::EndpointJson => "endpoint.json",
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        match name {
            "elm.json" => Some(ArtifactFile::ElmJson),
            "docs.json" => Some(ArtifactFile::DocsJson),
            "README.md" => Some(ArtifactFile::Readme),
            "endpoint.json" => Some(ArtifactFile::EndpointJson),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// `<root>/<group>/<pkg>/<version>` (the package name contributes two
    /// path segments).
    fn version_dir(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(name).join(version)
    }

    pub fn ensure_dir(&self, name: &str, version: &str) -> Result<()> {
        fs::create_dir_all(self.version_dir(name, version))?;
        Ok(())
    }

    /// Atomically writes one artifact: the bytes land in a temp file next to
    /// the destination and are renamed into place, so readers never observe
    /// a partial write.
    pub fn put_file(
        &self,
        name: &str,
        version: &str,
        file: ArtifactFile,
        bytes: &[u8],
    ) -> Result<()> {
        let dir = self.version_dir(name, version);
        fs::create_dir_all(&dir)?;
        let dest = dir.join(file.file_name());
        let tmp = dir.join(format!(".{}.tmp", file.file_name()));
        fs::write(&tmp, bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o777))?;
        }
        fs::rename(&tmp, &dest)?;
        Ok(())
    }

    pub fn read_file(&self, name: &str, version: &str, file: ArtifactFile) -> Result<Vec<u8>> {
        let path = self.version_dir(name, version).join(file.file_name());
        Ok(fs::read(path)?)
    }
}
