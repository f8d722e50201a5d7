//! Private-package ingest: `POST /register?name=<n>&version=<v>` with a
//! multipart body carrying the artifact files.
//!
//! Artifacts are written file-by-file as parts are consumed; the catalog row
//! is appended only after every part has been accepted, making it the commit
//! point. Files orphaned by a failed ingest are tolerated garbage.

use crate::catalog;
use crate::errors::StorageError;
use crate::router::{bad_request, server_error, ResponseSink};
use crate::storage::ArtifactFile;
use crate::CoreContext;
use multipart::server::Multipart;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};

/// Contents of a synthesized `endpoint.json`: where the zipball lives and
/// the sha1 the client should expect.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct PackageEndpoint {
    pub url: String,
    pub hash: String,
}

impl PackageEndpoint {
    pub fn for_package(name: &str, version: &str, hash: String) -> Self {
        Self {
            url: format!("https://github.com/{}/zipball/{}/", name, version),
            hash,
        }
    }
}

#[derive(Deserialize)]
struct RegisterQuery {
    name: Option<String>,
    version: Option<String>,
}

enum IngestError {
    /// Bad payload; the uploader gets a 400 with the message.
    Client(String),
    Storage(StorageError),
}

pub fn register(
    ctx: &CoreContext,
    query: &str,
    content_type: Option<&str>,
    body: &[u8],
    sink: &mut ResponseSink,
) {
    let parsed: RegisterQuery = match serde_urlencoded::from_str(query) {
        Ok(q) => q,
        Err(_) => return sink.status(404),
    };
    let (name, version) = match (parsed.name, parsed.version) {
        (Some(n), Some(v)) => (n, v),
        // Without both params this can't be one of ours; let upstream
        // produce the authoritative error.
        _ => return sink.status(404),
    };

    if !catalog::valid_name(&name) {
        return bad_request(sink, "Invalid package name.");
    }

    // Precondition order matters: the namespace gate decides ours-vs-upstream
    // before the duplicate and content-type checks.
    match ctx.catalog.ns_get(&name) {
        Ok(Some(_)) => {}
        Ok(None) => return sink.status(404),
        Err(e) => return server_error(sink, e),
    }

    if semver::Version::parse(&version).is_err() {
        return bad_request(sink, "Invalid version.");
    }

    match ctx.catalog.get(&name, &version) {
        Ok(None) => {}
        Ok(Some(_)) => return bad_request(sink, "Package has already been published."),
        Err(e) => return server_error(sink, e),
    }

    let boundary = match content_type.and_then(boundary_from) {
        Some(b) => b,
        None => return bad_request(sink, "Expected multipart form data."),
    };

    match consume_parts(ctx, &name, &version, body, &boundary) {
        Ok(()) => {}
        Err(IngestError::Client(msg)) => return bad_request(sink, &msg),
        Err(IngestError::Storage(e)) => return server_error(sink, e),
    }

    // All artifacts are on disk; the append below is what publishes them.
    match ctx.catalog.insert(&name, &version, true) {
        Ok(_) => sink.status(201),
        Err(crate::errors::CatalogError::Duplicate(_)) => {
            bad_request(sink, "Package has already been published.")
        }
        Err(e) => server_error(sink, e),
    }
}

/// Pulls the boundary parameter out of a `multipart/form-data` content type.
fn boundary_from(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    if !params
        .next()?
        .trim()
        .eq_ignore_ascii_case("multipart/form-data")
    {
        return None;
    }
    params.find_map(|param| {
        let value = param.trim().strip_prefix("boundary=")?;
        Some(value.trim_matches('"').to_string())
    })
}

fn consume_parts(
    ctx: &CoreContext,
    name: &str,
    version: &str,
    body: &[u8],
    boundary: &str,
) -> Result<(), IngestError> {
    ctx.store
        .ensure_dir(name, version)
        .map_err(IngestError::Storage)?;

    let mut parts = Multipart::with_body(Cursor::new(body), boundary);
    loop {
        let mut field = match parts.read_entry() {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(_) => return Err(IngestError::Client("Malformed multipart payload.".into())),
        };
        let field_name = field.headers.name.to_string();
        let mut data = Vec::new();
        field
            .data
            .read_to_end(&mut data)
            .map_err(|_| IngestError::Client("Malformed multipart payload.".into()))?;

        match field_name.as_str() {
            "elm.json" => {
                let manifest: serde_json::Value = serde_json::from_slice(&data)
                    .map_err(|_| IngestError::Client("elm.json is not valid JSON.".into()))?;
                if manifest.get("name").and_then(serde_json::Value::as_str) != Some(name) {
                    return Err(IngestError::Client(
                        "Package name in elm.json does not match.".into(),
                    ));
                }
                let canonical = serde_json::to_vec(&manifest)
                    .map_err(|_| IngestError::Client("elm.json is not valid JSON.".into()))?;
                ctx.store
                    .put_file(name, version, ArtifactFile::ElmJson, &canonical)
                    .map_err(IngestError::Storage)?;
            }
            "docs.json" => ctx
                .store
                .put_file(name, version, ArtifactFile::DocsJson, &data)
                .map_err(IngestError::Storage)?,
            "README.md" => ctx
                .store
                .put_file(name, version, ArtifactFile::Readme, &data)
                .map_err(IngestError::Storage)?,
            "github-hash" => {
                let hash = String::from_utf8(data)
                    .map_err(|_| IngestError::Client("github-hash must be utf-8.".into()))?;
                let endpoint = PackageEndpoint::for_package(name, version, hash);
                let bytes = serde_json::to_vec(&endpoint)
                    .map_err(|e| IngestError::Client(e.to_string()))?;
                ctx.store
                    .put_file(name, version, ArtifactFile::EndpointJson, &bytes)
                    .map_err(IngestError::Storage)?;
            }
            other => log::debug!("ignoring unknown form field `{}`", other),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{dispatch, RegistryRequest};
    use crate::test_helpers;

    const ELM_JSON: &str =
        r#"{"name":"acme/widgets","summary":"widgets","version":"1.2.3","license":"MIT"}"#;

    fn post<'a>(
        query: &'a str,
        content_type: &'a str,
        body: &'a [u8],
    ) -> RegistryRequest<'a> {
        RegistryRequest {
            method: "POST",
            path: "/register",
            query,
            content_type: Some(content_type),
            body,
        }
    }

    #[test]
    fn test_boundary_from() {
        assert_eq!(
            Some("xyz".to_string()),
            boundary_from("multipart/form-data; boundary=xyz")
        );
        assert_eq!(
            Some("xyz".to_string()),
            boundary_from(r#"multipart/form-data; charset=utf-8; boundary="xyz""#)
        );
        assert_eq!(None, boundary_from("application/json"));
        assert_eq!(None, boundary_from("multipart/form-data"));
    }

    #[test]
    fn test_register_happy_path() {
        let root = test_helpers::data_root();
        let ctx = test_helpers::test_context(root.path());
        ctx.catalog.ns_create("acme/widgets").unwrap();

        let (content_type, body) = test_helpers::multipart_body(&[
            ("elm.json", ELM_JSON.as_bytes()),
            ("docs.json", b"[]"),
            ("README.md", b"# widgets"),
            ("github-hash", b"deadbeef"),
        ]);

        let mut sink = ResponseSink::new();
        dispatch(
            &ctx,
            &post("name=acme/widgets&version=1.2.3", &content_type, &body),
            &mut sink,
        );
        let resp = sink.synthesize().unwrap();
        assert_eq!(201, resp.status);

        // The catalog row exists and is private.
        let entry = ctx.catalog.get("acme/widgets", "1.2.3").unwrap().unwrap();
        assert!(entry.private);

        // All four artifacts landed on disk.
        let dir = root.path().join("packages/acme/widgets/1.2.3");
        for file in &["elm.json", "docs.json", "README.md", "endpoint.json"] {
            assert!(dir.join(file).exists(), "missing {}", file);
        }

        let endpoint: PackageEndpoint = serde_json::from_slice(
            &ctx.store
                .read_file("acme/widgets", "1.2.3", ArtifactFile::EndpointJson)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(
            PackageEndpoint {
                url: "https://github.com/acme/widgets/zipball/1.2.3/".to_string(),
                hash: "deadbeef".to_string(),
            },
            endpoint
        );

        // The stored elm.json is semantically the uploaded one.
        let stored: serde_json::Value = serde_json::from_slice(
            &ctx.store
                .read_file("acme/widgets", "1.2.3", ArtifactFile::ElmJson)
                .unwrap(),
        )
        .unwrap();
        let uploaded: serde_json::Value = serde_json::from_str(ELM_JSON).unwrap();
        assert_eq!(uploaded, stored);
    }

    #[test]
    fn test_register_unknown_namespace_falls_through() {
        let root = test_helpers::data_root();
        let ctx = test_helpers::test_context(root.path());

        let (content_type, body) =
            test_helpers::multipart_body(&[("elm.json", ELM_JSON.as_bytes())]);
        let mut sink = ResponseSink::new();
        dispatch(
            &ctx,
            &post("name=acme/widgets&version=1.2.3", &content_type, &body),
            &mut sink,
        );
        assert!(sink.synthesize().is_none());
        assert!(ctx.catalog.get("acme/widgets", "1.2.3").unwrap().is_none());
    }

    #[test]
    fn test_register_name_mismatch_is_rejected() {
        let root = test_helpers::data_root();
        let ctx = test_helpers::test_context(root.path());
        ctx.catalog.ns_create("acme/widgets").unwrap();

        let (content_type, body) =
            test_helpers::multipart_body(&[("elm.json", br#"{"name":"acme/other"}"#)]);
        let mut sink = ResponseSink::new();
        dispatch(
            &ctx,
            &post("name=acme/widgets&version=1.2.3", &content_type, &body),
            &mut sink,
        );
        let resp = sink.synthesize().unwrap();
        assert_eq!(400, resp.status);
        // The catalog is untouched.
        assert!(ctx.catalog.get("acme/widgets", "1.2.3").unwrap().is_none());
    }

    #[test]
    fn test_register_twice_is_rejected() {
        let root = test_helpers::data_root();
        let ctx = test_helpers::test_context(root.path());
        ctx.catalog.ns_create("acme/widgets").unwrap();
        ctx.catalog.insert("acme/widgets", "1.2.3", true).unwrap();

        let (content_type, body) =
            test_helpers::multipart_body(&[("elm.json", ELM_JSON.as_bytes())]);
        let mut sink = ResponseSink::new();
        dispatch(
            &ctx,
            &post("name=acme/widgets&version=1.2.3", &content_type, &body),
            &mut sink,
        );
        let resp = sink.synthesize().unwrap();
        assert_eq!(400, resp.status);
        assert_eq!(
            "Package has already been published.",
            String::from_utf8(resp.body).unwrap()
        );
    }

    #[test]
    fn test_register_bad_content_type_is_rejected() {
        let root = test_helpers::data_root();
        let ctx = test_helpers::test_context(root.path());
        ctx.catalog.ns_create("acme/widgets").unwrap();

        let mut sink = ResponseSink::new();
        dispatch(
            &ctx,
            &post("name=acme/widgets&version=1.2.3", "application/json", b"{}"),
            &mut sink,
        );
        assert_eq!(400, sink.synthesize().unwrap().status);
    }

    #[test]
    fn test_register_bad_name_is_rejected() {
        let root = test_helpers::data_root();
        let ctx = test_helpers::test_context(root.path());

        let (content_type, body) =
            test_helpers::multipart_body(&[("elm.json", ELM_JSON.as_bytes())]);
        let mut sink = ResponseSink::new();
        dispatch(
            &ctx,
            &post("name=not-a-package&version=1.2.3", &content_type, &body),
            &mut sink,
        );
        let resp = sink.synthesize().unwrap();
        assert_eq!(400, resp.status);
        assert_eq!(
            "Invalid package name.",
            String::from_utf8(resp.body).unwrap()
        );
    }

    #[test]
    fn test_register_bad_version_is_rejected() {
        let root = test_helpers::data_root();
        let ctx = test_helpers::test_context(root.path());
        ctx.catalog.ns_create("acme/widgets").unwrap();

        let (content_type, body) =
            test_helpers::multipart_body(&[("elm.json", ELM_JSON.as_bytes())]);
        let mut sink = ResponseSink::new();
        dispatch(
            &ctx,
            &post("name=acme/widgets&version=banana", &content_type, &body),
            &mut sink,
        );
        assert_eq!(400, sink.synthesize().unwrap().status);
    }

    #[test]
    fn test_unknown_parts_are_ignored() {
        let root = test_helpers::data_root();
        let ctx = test_helpers::test_context(root.path());
        ctx.catalog.ns_create("acme/widgets").unwrap();

        let (content_type, body) = test_helpers::multipart_body(&[
            ("elm.json", ELM_JSON.as_bytes()),
            ("mystery", b"whatever"),
        ]);
        let mut sink = ResponseSink::new();
        dispatch(
            &ctx,
            &post("name=acme/widgets&version=1.2.3", &content_type, &body),
            &mut sink,
        );
        assert_eq!(201, sink.synthesize().unwrap().status);
        assert!(!root
            .path()
            .join("packages/acme/widgets/1.2.3/mystery")
            .exists());
    }
}
