use crate::catalog::Catalog;
use crate::settings::Settings;
use crate::storage::ArtifactStore;
use crate::CoreContext;
use std::path::Path;
use std::sync::Arc;
use tempdir::TempDir;

pub fn data_root() -> TempDir {
    TempDir::new("lagoon_test").unwrap()
}

/// A context rooted in a scratch directory. The upstream client is real but
/// nothing under test performs network calls.
pub fn test_context(root: &Path) -> Arc<CoreContext> {
    let mut settings = Settings::default();
    settings.services.storage.dir = root.to_path_buf();

    let catalog = Catalog::open(settings.database_path()).unwrap();
    let store = ArtifactStore::new(settings.package_root());
    std::fs::create_dir_all(settings.package_root()).unwrap();
    let upstream = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(20))
        .build()
        .unwrap();

    Arc::new(CoreContext {
        settings,
        catalog,
        store,
        upstream,
    })
}

/// Builds a `multipart/form-data` payload the way the Elm tooling submits
/// registrations: one part per artifact, named by filename.
pub fn multipart_body(parts: &[(&str, &[u8])]) -> (String, Vec<u8>) {
    let boundary = "---------------------------lagoon-test";
    let mut body = Vec::new();
    for (name, data) in parts {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    (
        format!("multipart/form-data; boundary={}", boundary),
        body,
    )
}
