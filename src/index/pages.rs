use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use tokio::process::Command;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Image,
}

pub fn document_kind(path: &Path) -> Result<DocumentKind> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => Ok(DocumentKind::Pdf),
        "png" | "jpg" | "jpeg" => Ok(DocumentKind::Image),
        _ => anyhow::bail!("unsupported document format: {}", path.display()),
    }
}

/// Files directly inside `dir`, hidden entries skipped, sorted by path.
pub fn list_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .map(|entry| entry.path().to_path_buf())
        .collect();

    files.sort();
    Ok(files)
}

/// Renders a document into PNG/JPEG page images, one entry per page.
pub async fn render_pages(path: &Path, dpi: u32) -> Result<Vec<Vec<u8>>> {
    match document_kind(path)? {
        DocumentKind::Pdf => render_pdf_pages(path, dpi).await,
        DocumentKind::Image => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read image: {}", path.display()))?;
            if !is_supported_image(&bytes) {
                anyhow::bail!("corrupt or unsupported image: {}", path.display());
            }
            Ok(vec![bytes])
        }
    }
}

async fn render_pdf_pages(pdf_path: &Path, dpi: u32) -> Result<Vec<Vec<u8>>> {
    if !has_command("pdftoppm").await {
        anyhow::bail!("pdftoppm not found on PATH; install poppler to index PDFs");
    }

    let expected_pages = get_pdf_page_count(pdf_path).await.ok();
    let render_dir = tempfile::tempdir().context("failed to create page render directory")?;
    let prefix = render_dir.path().join("page");

    let output = Command::new("pdftoppm")
        .arg("-png")
        .arg("-r")
        .arg(dpi.to_string())
        .arg(pdf_path)
        .arg(&prefix)
        .output()
        .await
        .context("failed to run pdftoppm")?;

    if !output.status.success() {
        anyhow::bail!(
            "pdftoppm failed for {}: {}",
            pdf_path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let mut files: Vec<PathBuf> = WalkDir::new(render_dir.path())
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.path().to_path_buf())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("png"))
                .unwrap_or(false)
        })
        .collect();

    files.sort();

    if files.is_empty() {
        anyhow::bail!("no pages rendered from {}", pdf_path.display());
    }

    if let Some(expected) = expected_pages {
        if expected != files.len() {
            tracing::warn!(
                "pdfinfo reported {} pages but {} were rendered for {}",
                expected,
                files.len(),
                pdf_path.display()
            );
        }
    }

    let mut pages = Vec::with_capacity(files.len());
    for file in files {
        let bytes = tokio::fs::read(&file)
            .await
            .with_context(|| format!("failed to read rendered page {}", file.display()))?;
        pages.push(bytes);
    }

    Ok(pages)
}

async fn get_pdf_page_count(pdf_path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(pdf_path)
        .output()
        .await
        .context("failed to run pdfinfo")?;

    if !output.status.success() {
        return Err(anyhow::anyhow!("pdfinfo exited with non-zero status"));
    }

    parse_page_count(&String::from_utf8_lossy(&output.stdout))
}

fn parse_page_count(pdfinfo_stdout: &str) -> Result<usize> {
    let regex = Regex::new(r"(?m)^Pages:\s+(\d+)\s*$")?;
    regex
        .captures(pdfinfo_stdout)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .ok_or_else(|| anyhow::anyhow!("unable to parse page count from pdfinfo"))
}

fn is_supported_image(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0x89, b'P', b'N', b'G']) || bytes.starts_with(&[0xFF, 0xD8, 0xFF])
}

pub(crate) async fn has_command(binary: &str) -> bool {
    // pdftoppm prints its version to stderr with a non-zero status on some
    // builds, so look it up on PATH instead.
    Command::new("which")
        .arg(binary)
        .output()
        .await
        .map(|out| out.status.success() && !out.stdout.is_empty())
        .unwrap_or(false)
}
