//! Offline document ingestion; not part of the turn path.
//!
//! Walks a directory of plain-text or markdown documents, splits them into
//! paragraph chunks, and indexes each chunk with a source id derived from
//! the file name. A subdirectory name becomes the chunk's topic tag
//! (e.g. `corpus/dermatology/eczema.md` → tag "dermatology").

use std::fs;
use std::path::Path;

use super::embedder::EmbeddingModel;
use super::index::InMemoryVectorIndex;
use super::RetrievalError;

/// Minimum chunk length worth indexing.
const MIN_CHUNK_CHARS: usize = 40;

/// Ingest every .txt/.md file under `source` into the index.
/// Returns the number of chunks indexed.
pub fn ingest_directory(
    source: &Path,
    embedder: &dyn EmbeddingModel,
    index: &InMemoryVectorIndex,
) -> Result<usize, RetrievalError> {
    let mut indexed = 0;
    ingest_dir_inner(source, None, embedder, index, &mut indexed)?;
    tracing::info!(chunks = indexed, source = %source.display(), "Ingestion complete");
    Ok(indexed)
}

fn ingest_dir_inner(
    dir: &Path,
    tag: Option<&str>,
    embedder: &dyn EmbeddingModel,
    index: &InMemoryVectorIndex,
    indexed: &mut usize,
) -> Result<(), RetrievalError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            let dir_name = entry.file_name().to_string_lossy().to_string();
            ingest_dir_inner(&path, Some(&dir_name), embedder, index, indexed)?;
            continue;
        }

        let is_text = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "txt" || e == "md")
            .unwrap_or(false);
        if !is_text {
            continue;
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());
        let content = fs::read_to_string(&path)?;

        for (i, chunk) in split_paragraphs(&content).iter().enumerate() {
            let embedding = embedder.embed(chunk)?;
            index.add(&format!("{stem}#{i}"), chunk, embedding, tag);
            *indexed += 1;
        }
    }
    Ok(())
}

fn split_paragraphs(content: &str) -> Vec<String> {
    content
        .split("\n\n")
        .map(|p| p.trim().to_string())
        .filter(|p| p.chars().count() >= MIN_CHUNK_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::retrieval::embedder::HashEmbedder;
    use crate::retrieval::index::VectorIndex;

    #[test]
    fn ingests_tagged_subdirectories() {
        let dir = std::env::temp_dir().join(format!("mediq-ingest-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(dir.join("dermatology")).unwrap();

        let mut f = fs::File::create(dir.join("dermatology").join("eczema.md")).unwrap();
        writeln!(
            f,
            "Atopic dermatitis presents with itchy erythematous patches, often in flexural areas.\n\n\
             Contact dermatitis follows exposure to an irritant and resolves once it is removed."
        )
        .unwrap();

        let embedder = HashEmbedder::default();
        let index = InMemoryVectorIndex::new();
        let count = ingest_directory(&dir, &embedder, &index).unwrap();
        assert_eq!(count, 2);

        let query = embedder.embed("itchy red patches dermatitis").unwrap();
        let hits = index.search(&query, 1).unwrap();
        assert_eq!(hits[0].tag.as_deref(), Some("dermatology"));
        assert!(hits[0].source_id.starts_with("eczema#"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn short_fragments_are_skipped() {
        assert!(split_paragraphs("too short\n\nalso tiny").is_empty());
    }
}
