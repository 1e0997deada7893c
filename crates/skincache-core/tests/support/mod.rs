//! Shared fixtures: an in-process mirror, a JSON pass-through transcoder and
//! a tar-based archiving tool.

#![allow(dead_code)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use skincache_core::{
    CatalogStore, Collaborators, Entity, HttpVersionOracle, ListingResolver, MemoryCatalog,
    Result, SkinCache, SkinCacheConfig, StructuredDocument, ToolConfig, Transcoder, Variant,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

struct Route {
    status: u16,
    body: Vec<u8>,
    delay: Duration,
}

/// Minimal HTTP/1.1 responder standing in for the remote mirror.
#[derive(Clone)]
pub struct MirrorServer {
    base_url: String,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl MirrorServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mirror");
        let addr = listener.local_addr().expect("mirror addr");
        let server = Self {
            base_url: format!("http://{addr}"),
            routes: Arc::new(Mutex::new(HashMap::new())),
            hits: Arc::new(Mutex::new(HashMap::new())),
        };

        let routes = Arc::clone(&server.routes);
        let hits = Arc::clone(&server.hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let routes = Arc::clone(&routes);
                let hits = Arc::clone(&hits);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let request = String::from_utf8_lossy(&buf);
                    let mut parts = request.split_whitespace();
                    let method = parts.next().unwrap_or("GET").to_string();
                    let path = parts.next().unwrap_or("/").to_string();
                    *hits.lock().unwrap().entry(path.clone()).or_default() += 1;

                    let (status, body, delay) = match routes.lock().unwrap().get(&path) {
                        Some(route) => (route.status, route.body.clone(), route.delay),
                        None => (404, b"not found".to_vec(), Duration::ZERO),
                    };
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let head = format!(
                        "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    if method != "HEAD" {
                        let _ = socket.write_all(&body).await;
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });
        server
    }

    pub fn url(&self) -> &str {
        &self.base_url
    }

    pub fn serve(&self, path: &str, body: impl Into<Vec<u8>>) {
        self.route(path, 200, body.into(), Duration::ZERO);
    }

    pub fn serve_slowly(&self, path: &str, body: impl Into<Vec<u8>>, delay: Duration) {
        self.route(path, 200, body.into(), delay);
    }

    pub fn fail(&self, path: &str, status: u16) {
        self.route(path, status, Vec::new(), Duration::ZERO);
    }

    fn route(&self, path: &str, status: u16, body: Vec<u8>, delay: Duration) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), Route { status, body, delay });
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn serve_versions(&self, versions: &[&str]) {
        self.serve("/api/versions.json", serde_json::to_vec(versions).unwrap());
    }

    pub fn serve_listing(&self, version: &str, dirs: &[&str]) {
        let links: String = dirs
            .iter()
            .map(|d| format!("<tr><td><a href=\"{d}/\">{d}/</a></td></tr>\n"))
            .collect();
        let html = format!("<html><body><table>\n<tr><td><a href=\"../\">../</a></td></tr>\n{links}</table></body></html>");
        self.serve(&format!("/{version}/game/data/characters/"), html);
    }

    pub fn payload_path(version: &str, dir: &str, variant_id: &str) -> String {
        format!("/{version}/game/data/characters/{dir}/skins/skin{variant_id}.bin")
    }

    pub fn serve_payload(&self, version: &str, dir: &str, variant_id: &str, doc: &Value) {
        self.serve(
            &Self::payload_path(version, dir, variant_id),
            serde_json::to_vec(doc).unwrap(),
        );
    }
}

/// Payloads in tests are JSON already: decoding and encoding are file copies.
pub struct JsonTranscoder;

#[async_trait]
impl Transcoder for JsonTranscoder {
    async fn decode(&self, binary_path: &Path) -> Result<StructuredDocument> {
        let json_path = binary_path.with_extension("json");
        tokio::fs::copy(binary_path, &json_path).await?;
        StructuredDocument::load(&json_path).await
    }

    async fn encode(&self, document_path: &Path) -> Result<PathBuf> {
        let bin_path = document_path.with_extension("bin");
        tokio::fs::copy(document_path, &bin_path).await?;
        Ok(bin_path)
    }
}

pub fn item(key: &str, name: &str) -> Value {
    json!({ "key": key, "value": { "name": name, "items": [] } })
}

pub fn skin_doc(items: Vec<Value>) -> Value {
    json!({
        "type": "PROP",
        "version": 3,
        "entries": { "type": "map", "value": { "keyType": "hash", "items": items } }
    })
}

pub fn base_doc(code: &str) -> Value {
    skin_doc(vec![
        item(&format!("Characters/{code}/Skins/Skin0"), "SkinCharacterDataProperties"),
        item("anim", "AnimationGraphData"),
        item(&format!("Characters/{code}/Skins/Skin0/Resources"), "ResourceResolver"),
    ])
}

pub fn variant_doc(code: &str, variant_id: &str) -> Value {
    skin_doc(vec![
        item(&format!("Characters/{code}/Skins/Skin{variant_id}"), "SkinCharacterDataProperties"),
        item(&format!("vfx-{variant_id}"), "VfxSystemDefinitionData"),
        item(&format!("Characters/{code}/Skins/Skin{variant_id}/Resources"), "ResourceResolver"),
    ])
}

pub fn entity(id: &str, code: &str, variant_ids: &[&str]) -> Entity {
    Entity {
        id: id.to_string(),
        code: code.to_string(),
        name: Some(code.to_string()),
        variants: variant_ids
            .iter()
            .map(|v| Variant::new(*v, Some(&format!("{code} skin {v}"))))
            .collect(),
    }
}

/// Shell script standing in for the archiving tool.
pub fn archiver_script(dir: &Path) -> ToolConfig {
    let path = dir.join("pack.sh");
    std::fs::write(&path, "#!/bin/sh\ntar -cf \"$2\" -C \"$1\" .\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    ToolConfig {
        program: path,
        wrapper: None,
        timeout_secs: 30,
    }
}

/// Entity `22` (code `ashe`) with variants 0, 1 and 2 on a mirror at 14.3.1.
pub async fn ashe_mirror() -> MirrorServer {
    let mirror = MirrorServer::start().await;
    mirror.serve_versions(&["14.3.1", "14.2.7"]);
    mirror.serve_listing("14.3", &["aatrox", "ashe", "sru_dragon"]);
    mirror.serve_payload("14.3", "ashe", "0", &base_doc("Ashe"));
    mirror.serve_payload("14.3", "ashe", "1", &variant_doc("Ashe", "1"));
    mirror.serve_payload("14.3", "ashe", "2", &variant_doc("Ashe", "2"));
    mirror
}

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub config: SkinCacheConfig,
    pub catalog: Arc<dyn CatalogStore>,
    pub mirror: MirrorServer,
}

impl Fixture {
    pub fn new(mirror: MirrorServer, entities: Vec<Entity>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SkinCacheConfig {
            data_root: dir.path().join("data"),
            versions_url: format!("{}/api/versions.json", mirror.url()),
            mirror_root: mirror.url().to_string(),
            archiver: archiver_script(dir.path()),
            http_timeout_secs: 5,
            ..SkinCacheConfig::default()
        };
        Self {
            dir,
            config,
            catalog: Arc::new(MemoryCatalog::new(entities)),
            mirror,
        }
    }

    /// A fresh instance over the same data root, as after a restart.
    pub fn open(&self) -> SkinCache {
        let client = reqwest::Client::new();
        SkinCache::with_collaborators(
            self.config.clone(),
            Collaborators {
                oracle: Arc::new(HttpVersionOracle::new(client.clone(), self.config.versions_url.clone())),
                catalog: Arc::clone(&self.catalog),
                resolver: Arc::new(ListingResolver::new(
                    client.clone(),
                    self.config.mirror_root.clone(),
                    self.config.denylist.clone(),
                )),
                transcoder: Arc::new(JsonTranscoder),
                client,
            },
        )
    }

    pub fn package_path(&self, entity_id: &str, variant_id: &str) -> PathBuf {
        self.config
            .package_dir()
            .join(entity_id)
            .join(format!("{variant_id}.wad.client"))
    }

    /// Merged document shipped in the pair's source tree.
    /// Payload document read back out of the shipped package.
    pub fn shipped_doc(&self, version: &str, entity_id: &str, variant_id: &str, dir: &str) -> Value {
        let package = self
            .config
            .package_dir()
            .join(entity_id)
            .join(format!("{variant_id}.wad.client"));
        let output = std::process::Command::new("tar")
            .arg("-xOf")
            .arg(&package)
            .arg(format!("./data/characters/{dir}/skins/skin0.bin"))
            .output()
            .expect("tar runs");
        assert!(output.status.success(), "no payload in {}", package.display());
        // Archive trees are per call and gone after archiving.
        assert!(!self.config.output_dir().join(version).join(entity_id).join(variant_id).exists());
        serde_json::from_slice(&output.stdout).expect("shipped json")
    }
}
