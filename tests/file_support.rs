//! Multi-format indexing through the `folio` binary.
//!
//! Office documents are indexed and searchable, broken files are recorded
//! as failed without stopping the pass, and oversized or unsupported files
//! are skipped.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn folio_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.push("folio");
    path
}

/// Minimal OOXML package with one XML entry holding `<a:t>`-style runs.
fn ooxml_package(entries: &[(&str, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        for (name, xml) in entries {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

fn minimal_docx(phrase: &str) -> Vec<u8> {
    ooxml_package(&[(
        "word/document.xml",
        format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
            phrase
        ),
    )])
}

fn minimal_pptx(phrase: &str) -> Vec<u8> {
    ooxml_package(&[(
        "ppt/slides/slide1.xml",
        format!(
            "<?xml version=\"1.0\"?><p:sld xmlns:p=\"http://schemas.openxmlformats.org/presentationml/2006/main\" xmlns:a=\"http://schemas.openxmlformats.org/drawingml/2006/main\"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>",
            phrase
        ),
    )])
}

fn setup_env(max_file_bytes: u64) -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap();

    fs::create_dir_all(root.join("config")).unwrap();
    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();

    let config_content = format!(
        r#"[data]
dir = "{}/data"

[scanner]
max_file_bytes = {}

[embedding]
provider = "hash"
dims = 256
"#,
        root.display(),
        max_file_bytes
    );
    let config = root.join("config").join("folio.toml");
    fs::write(&config, config_content).unwrap();

    fs::write(
        files_dir.join("readme.md"),
        "# Readme\n\nPlain text file for tests.\n",
    )
    .unwrap();

    (tmp, config, files_dir)
}

fn run_folio(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = folio_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run folio: {}", e));
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn index(config: &Path, files: &Path) -> String {
    run_folio(config, &["init"]);
    run_folio(config, &["path", "add", files.to_str().unwrap()]);
    let (stdout, stderr, success) = run_folio(config, &["index"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

#[test]
fn file_support_docx_index_and_search() {
    let (_tmp, config, files) = setup_env(1_000_000);
    fs::write(files.join("report.docx"), minimal_docx("office test phrase")).unwrap();

    let stdout = index(&config, &files);
    assert!(stdout.contains("added 2"), "{}", stdout);

    let (search_out, _, success) = run_folio(&config, &["search", "office test phrase", "-k", "1"]);
    assert!(success);
    assert!(search_out.contains("report.docx"), "{}", search_out);
    assert!(search_out.contains("office test phrase"), "{}", search_out);
}

#[test]
fn file_support_pptx_slides() {
    let (_tmp, config, files) = setup_env(1_000_000);
    fs::write(files.join("deck.pptx"), minimal_pptx("quarterly roadmap slide")).unwrap();

    index(&config, &files);
    let (search_out, _, success) = run_folio(&config, &["search", "quarterly roadmap", "-k", "1"]);
    assert!(success);
    assert!(search_out.contains("deck.pptx"), "{}", search_out);
}

#[test]
fn file_support_broken_file_is_failed_not_fatal() {
    let (_tmp, config, files) = setup_env(1_000_000);
    fs::write(files.join("bad.pdf"), b"not a valid pdf").unwrap();
    fs::write(files.join("bad.docx"), b"not a zip either").unwrap();
    fs::write(files.join("good.md"), "# Good\n\nThis is good.\n").unwrap();

    let stdout = index(&config, &files);
    assert!(stdout.contains("added 2"), "{}", stdout);
    assert!(stdout.contains("failed 2"), "{}", stdout);

    let (status, _, _) = run_folio(&config, &["status", "--json"]);
    let status: serde_json::Value = serde_json::from_str(&status).unwrap();
    assert_eq!(status["stats"]["failed"], 2);
    assert_eq!(status["stats"]["indexed"], 2);
}

#[test]
fn file_support_max_size_and_unknown_types_skipped() {
    let (_tmp, config, files) = setup_env(1000);
    fs::write(files.join("big.md"), "x".repeat(2000)).unwrap();
    fs::write(files.join("archive.bin"), [0u8; 16]).unwrap();
    fs::write(files.join("small.md"), "# Small\n\nOk.\n").unwrap();

    let stdout = index(&config, &files);
    assert!(stdout.contains("added 2"), "{}", stdout);
    assert!(stdout.contains("skipped 2"), "{}", stdout);
}

#[test]
fn file_support_reindex_is_idempotent() {
    let (_tmp, config, files) = setup_env(1_000_000);
    fs::write(files.join("report.docx"), minimal_docx("stable content")).unwrap();

    index(&config, &files);
    let (stdout, _, success) = run_folio(&config, &["index"]);
    assert!(success);
    assert!(
        stdout.contains("added 0  updated 0  deleted 0  unchanged 2"),
        "{}",
        stdout
    );
}
