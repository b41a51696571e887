mod common;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use common::write_gguf;
use llmcore::registry::{Capability, LocalRegistry, ProgressEvent, Registry, RegistryError};
use llmcore::template::DEFAULT_TEMPLATE;

fn gguf_bytes(metadata: &[(&str, &str)]) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.gguf");
    write_gguf(&path, metadata);
    std::fs::read(path).unwrap()
}

async fn serve(weights: Vec<u8>) -> SocketAddr {
    let app = Router::new().route(
        "/library/tiny/latest.gguf",
        get(move || {
            let weights = weights.clone();
            async move { weights }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[test]
fn scan_adopts_loose_gguf_files() {
    let dir = tempfile::tempdir().unwrap();
    write_gguf(&dir.path().join("tiny.gguf"), &[("general.architecture", "llama"), ("general.name", "Tiny")]);
    write_gguf(&dir.path().join("nomic-embed-text.gguf"), &[("general.architecture", "nomic-bert")]);
    std::fs::write(dir.path().join("notes.gguf"), b"not a model").unwrap();

    let registry = LocalRegistry::new(dir.path().to_path_buf(), "https://example.com", false)
        .open()
        .unwrap();

    let names: Vec<String> = registry.list().unwrap().into_iter().map(|m| m.name).collect();
    assert_eq!(names, vec!["nomic-embed-text:latest", "tiny:latest"]);

    let tiny = registry.resolve("tiny").unwrap();
    assert_eq!(tiny.capability, Capability::Generation);
    assert_eq!(tiny.template, DEFAULT_TEMPLATE);
    assert_eq!(tiny.artifacts.model, dir.path().join("tiny.gguf"));
    assert!(registry.resolve("nomic-embed-text:latest").unwrap().is_embedding());
    assert!(dir.path().join("model_registry.json").exists());
}

#[test]
fn corrupt_gguf_header_does_not_break_open() {
    let dir = tempfile::tempdir().unwrap();
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"GGUF");
    bytes.extend_from_slice(&3u32.to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    bytes.extend_from_slice(&1u64.to_le_bytes());
    bytes.extend_from_slice(&(1u64 << 62).to_le_bytes());
    std::fs::write(dir.path().join("mangled.gguf"), bytes).unwrap();
    write_gguf(&dir.path().join("tiny.gguf"), &[("general.architecture", "llama")]);

    let registry = LocalRegistry::new(dir.path().to_path_buf(), "https://example.com", false)
        .open()
        .unwrap();

    assert!(registry.has("tiny").unwrap());
    let mangled = registry.resolve("mangled").unwrap();
    assert_eq!(mangled.capability, Capability::Generation);
}

#[test]
fn registry_file_survives_reopen_and_drops_missing_models() {
    let dir = tempfile::tempdir().unwrap();
    write_gguf(&dir.path().join("tiny.gguf"), &[("general.architecture", "llama")]);
    write_gguf(&dir.path().join("small.gguf"), &[("general.architecture", "qwen2")]);
    LocalRegistry::new(dir.path().to_path_buf(), "https://example.com", false)
        .open()
        .unwrap();

    std::fs::remove_file(dir.path().join("tiny.gguf")).unwrap();
    let reopened = LocalRegistry::new(dir.path().to_path_buf(), "https://example.com", false)
        .open()
        .unwrap();

    assert!(matches!(reopened.resolve("tiny"), Err(RegistryError::NotFound(_))));
    assert!(reopened.has("small").unwrap());
    let saved = std::fs::read_to_string(dir.path().join("model_registry.json")).unwrap();
    assert!(!saved.contains("tiny:latest"));
}

#[tokio::test]
async fn pull_downloads_and_registers_the_model() {
    let weights = gguf_bytes(&[("general.architecture", "llama"), ("general.name", "Tiny")]);
    let addr = serve(weights.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let registry = LocalRegistry::new(dir.path().to_path_buf(), format!("http://{}", addr), true)
        .open()
        .unwrap();
    assert!(!registry.has("tiny").unwrap());

    let mut events: Vec<ProgressEvent> = Vec::new();
    registry
        .pull(&CancellationToken::new(), "tiny", &mut |event| events.push(event))
        .await
        .unwrap();

    assert!(!events.is_empty());
    assert!(events.windows(2).all(|w| w[0].completed <= w[1].completed));
    let last = events.last().unwrap();
    assert_eq!(last.completed, weights.len() as u64);
    assert_eq!(last.total, weights.len() as u64);

    let manifest = registry.resolve("tiny:latest").unwrap();
    assert_eq!(manifest.size_bytes, weights.len() as u64);
    assert_eq!(std::fs::read(&manifest.artifacts.model).unwrap(), weights);
    assert!(!dir.path().join("tiny-latest.gguf.partial").exists());
}

#[tokio::test]
async fn pulling_an_unknown_model_is_not_found() {
    let addr = serve(gguf_bytes(&[])).await;
    let dir = tempfile::tempdir().unwrap();
    let registry = LocalRegistry::new(dir.path().to_path_buf(), format!("http://{}", addr), true);

    let err = registry
        .pull(&CancellationToken::new(), "ghost", &mut |_| {})
        .await
        .unwrap_err();

    assert!(matches!(err, RegistryError::NotFound(ref name) if name == "ghost"));
    assert!(!dir.path().join("ghost-latest.gguf.partial").exists());
    assert!(!dir.path().join("ghost-latest.gguf").exists());
}

#[tokio::test]
async fn cancelled_pull_leaves_nothing_behind() {
    let addr = serve(gguf_bytes(&[])).await;
    let dir = tempfile::tempdir().unwrap();
    let registry = LocalRegistry::new(dir.path().to_path_buf(), format!("http://{}", addr), true);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = registry.pull(&cancel, "tiny", &mut |_| {}).await.unwrap_err();

    assert!(matches!(err, RegistryError::Cancelled));
    assert!(!registry.has("tiny").unwrap());
    assert!(!dir.path().join("tiny-latest.gguf").exists());
}
