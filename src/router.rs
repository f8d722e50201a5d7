//! The registry-compatible surface, written as a pure dispatcher so the
//! intercepting proxy can run it in-process against decoded requests and the
//! management listener can feed it through actix.
//!
//! Handlers write into a [`ResponseSink`]; whether anything was written (and
//! with what status) drives the serve-locally-or-forward decision upstream.

use crate::catalog::PackageEntry;
use crate::errors::StorageError;
use crate::storage::ArtifactFile;
use crate::CoreContext;
use serde_json::Value;

/// A request as seen by the router, independent of how it arrived (decrypted
/// proxy stream or the management listener).
pub struct RegistryRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

/// Accumulates a response without committing to sending one.
///
/// Mirrors the minimal surface handlers need: set a header, set the status,
/// write body bytes. Any of those marks the sink as edited. An un-edited
/// sink, or one holding a 404, synthesizes to `None`, which the caller reads
/// as "not ours, forward upstream".
pub struct ResponseSink {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    edited: bool,
}

/// A concrete response captured from the router, ready to deliver.
#[derive(Debug, PartialEq)]
pub struct SynthesizedResponse {
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ResponseSink {
    pub fn new() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
            edited: false,
        }
    }

    pub fn header(&mut self, name: &str, value: &str) {
        self.edited = true;
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn status(&mut self, code: u16) {
        self.edited = true;
        self.status = code;
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.edited = true;
        self.body.extend_from_slice(bytes);
    }

    /// Yields a real response only if a handler actually produced one.
    pub fn synthesize(self) -> Option<SynthesizedResponse> {
        if !self.edited || self.status == 404 {
            return None;
        }
        let mut content_type = None;
        let mut headers = Vec::new();
        for (name, value) in self.headers {
            if name.eq_ignore_ascii_case("content-type") {
                content_type = Some(value);
            } else {
                headers.push((name, value));
            }
        }
        Some(SynthesizedResponse {
            status: self.status,
            content_type: content_type.unwrap_or_else(|| "application/text".to_string()),
            headers,
            body: self.body,
        })
    }
}

impl Default for ResponseSink {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn bad_request(sink: &mut ResponseSink, msg: &str) {
    sink.status(400);
    sink.write(msg.as_bytes());
}

pub(crate) fn server_error(sink: &mut ResponseSink, err: impl std::fmt::Display) {
    log::error!("registry handler failure: {}", err);
    sink.status(500);
    sink.write(b"internal server error");
}

/// Routes one request. A sink left un-edited (or holding a bodiless 404)
/// means the route is not ours and the request belongs upstream.
pub fn dispatch(ctx: &CoreContext, req: &RegistryRequest, sink: &mut ResponseSink) {
    log::debug!("{} {}", req.method, req.path);

    if req.method == "GET" && req.path == "/all-packages" {
        return all_packages(ctx, sink);
    }
    if req.method == "GET" {
        if let Some(raw) = req.path.strip_prefix("/all-packages/since/") {
            // Non-numeric cursors never match the route.
            if let Ok(n) = raw.parse::<i64>() {
                packages_since(ctx, n, sink);
            }
            return;
        }
    }
    if req.method == "POST" && req.path == "/register" {
        return crate::ingest::register(ctx, req.query, req.content_type, req.body, sink);
    }

    let segments: Vec<&str> = req.path.trim_start_matches('/').split('/').collect();
    if let ["packages", group, pkg, version, file] = segments.as_slice() {
        if req.method == "GET" {
            // Only the manifest and the endpoint are served; everything else
            // on this prefix belongs upstream.
            let file = match ArtifactFile::from_file_name(file) {
                Some(file @ ArtifactFile::ElmJson) | Some(file @ ArtifactFile::EndpointJson) => {
                    file
                }
                _ => return,
            };
            return artifact(ctx, &format!("{}/{}", group, pkg), version, file, sink);
        }
    }
}

/// `GET /all-packages`: the full index, grouped by name. Version order
/// within a name is insertion order.
fn all_packages(ctx: &CoreContext, sink: &mut ResponseSink) {
    let entries = match ctx.catalog.list_all() {
        Ok(entries) => entries,
        Err(e) => return server_error(sink, e),
    };
    let mut index = serde_json::Map::new();
    for PackageEntry { name, version, .. } in entries {
        match index.get_mut(&name) {
            Some(Value::Array(versions)) => versions.push(version.into()),
            _ => {
                index.insert(name, serde_json::json!([version]));
            }
        }
    }
    match serde_json::to_vec(&Value::Object(index)) {
        Ok(body) => {
            sink.header("Content-Type", "application/json");
            sink.write(&body);
        }
        Err(e) => server_error(sink, e),
    }
}

/// `GET /all-packages/since/{n}`: everything after id `n`, ascending.
fn packages_since(ctx: &CoreContext, since: i64, sink: &mut ResponseSink) {
    let entries = match ctx.catalog.since(since) {
        Ok(entries) => entries,
        Err(e) => return server_error(sink, e),
    };
    let specs: Vec<String> = entries
        .into_iter()
        .map(|e| format!("{}@{}", e.name, e.version))
        .collect();
    match serde_json::to_vec(&specs) {
        Ok(body) => {
            sink.header("Content-Type", "application/json");
            sink.write(&body);
        }
        Err(e) => server_error(sink, e),
    }
}

/// Raw artifact lookups, gated on the namespace registry: an unregistered
/// `group/pkg` is a public package and the request falls through so the
/// client talks to the real registry.
fn artifact(
    ctx: &CoreContext,
    name: &str,
    version: &str,
    file: ArtifactFile,
    sink: &mut ResponseSink,
) {
    match ctx.catalog.ns_get(name) {
        Ok(None) => sink.status(404),
        Ok(Some(_)) => match ctx.store.read_file(name, version, file) {
            Ok(bytes) => {
                sink.header("Content-Type", "application/json");
                sink.write(&bytes);
            }
            Err(StorageError::NotFound) => sink.status(404),
            Err(e) => server_error(sink, e),
        },
        Err(e) => server_error(sink, e),
    }
}
