//! In-process keyword index.
//!
//! Files are cut into overlapping line windows. A query scores each window
//! by the weighted share of query terms it contains; intent entities weigh
//! twice as much as free-text terms.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::models::CodeChunk;
use crate::domain::ports::{CodeIndex, IndexError, IndexQuery, ScoredChunk};

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "be", "by", "fn", "for", "from", "in", "is", "it", "let",
    "mut", "of", "on", "or", "pub", "self", "the", "this", "to", "use", "with",
];

const ENTITY_WEIGHT: f32 = 2.0;

/// How files are cut into chunks.
#[derive(Debug, Clone)]
pub struct ChunkingOptions {
    pub window_lines: usize,
    pub overlap_lines: usize,
    /// File extensions indexed by [`KeywordIndex::from_dir`].
    pub extensions: Vec<String>,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            window_lines: 40,
            overlap_lines: 10,
            extensions: ["rs", "py", "ts", "js", "go", "java", "toml", "yaml", "yml", "md"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

struct IndexedChunk {
    chunk: CodeChunk,
    terms: HashSet<String>,
}

pub struct KeywordIndex {
    chunks: Vec<IndexedChunk>,
}

impl KeywordIndex {
    pub fn from_files<I, P, C>(files: I, options: &ChunkingOptions) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: AsRef<str>,
    {
        let chunks = files
            .into_iter()
            .flat_map(|(path, content)| {
                let path: String = path.into();
                chunk_file(&path, content.as_ref(), options)
            })
            .map(|chunk| IndexedChunk {
                terms: tokenize(&chunk.content).chain(tokenize(&chunk.path)).collect(),
                chunk,
            })
            .collect();
        Self { chunks }
    }

    /// Index every matching file under `root`, skipping hidden directories
    /// and `target`.
    pub async fn from_dir(root: &Path, options: &ChunkingOptions) -> std::io::Result<Self> {
        let mut files = Vec::new();
        let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if !name.starts_with('.') && name != "target" {
                        pending.push(path);
                    }
                    continue;
                }
                let indexed = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|ext| options.extensions.iter().any(|x| x == ext));
                if !indexed {
                    continue;
                }
                let Ok(content) = tokio::fs::read_to_string(&path).await else {
                    tracing::debug!(path = %path.display(), "skipping unreadable file");
                    continue;
                };
                let relative = path.strip_prefix(root).unwrap_or(&path);
                files.push((relative.to_string_lossy().replace('\\', "/"), content));
            }
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        let index = Self::from_files(files, options);
        tracing::info!(root = %root.display(), chunks = index.len(), "indexed source tree");
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn score(&self, weights: &HashMap<String, f32>, indexed: &IndexedChunk) -> f32 {
        let total: f32 = weights.values().sum();
        if total <= 0.0 {
            return 0.0;
        }
        let matched: f32 = weights
            .iter()
            .filter(|(term, _)| indexed.terms.contains(*term))
            .map(|(_, w)| w)
            .sum();
        (matched / total).clamp(0.0, 1.0)
    }
}

#[async_trait]
impl CodeIndex for KeywordIndex {
    async fn search(&self, query: &IndexQuery) -> Result<Vec<ScoredChunk>, IndexError> {
        let mut weights: HashMap<String, f32> = HashMap::new();
        for term in tokenize(&query.text) {
            weights.entry(term).or_insert(1.0);
        }
        for term in query.terms.iter().flat_map(|t| tokenize(t)) {
            weights.insert(term, ENTITY_WEIGHT);
        }

        let mut scored: Vec<ScoredChunk> = self
            .chunks
            .iter()
            .filter_map(|indexed| {
                let score = self.score(&weights, indexed);
                (score > 0.0).then(|| ScoredChunk {
                    chunk: indexed.chunk.clone(),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.chunk.path.cmp(&b.chunk.path))
                .then_with(|| a.chunk.start_line.cmp(&b.chunk.start_line))
        });
        scored.truncate(query.limit);
        Ok(scored)
    }
}

fn chunk_file(path: &str, content: &str, options: &ChunkingOptions) -> Vec<CodeChunk> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }
    let window = options.window_lines.max(1);
    let step = window.saturating_sub(options.overlap_lines).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + window).min(lines.len());
        let mut text = lines[start..end].join("\n");
        text.push('\n');
        chunks.push(CodeChunk::new(path, start + 1, text));
        if end == lines.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Lowercased identifier words, with snake_case and camelCase parts split
/// out alongside the whole identifier.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .flat_map(|word| {
            let mut terms = vec![word.to_lowercase()];
            terms.extend(split_identifier(word));
            terms
        })
        .filter(|t| t.len() > 1 && !STOP_WORDS.contains(&t.as_str()))
}

fn split_identifier(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in word.chars() {
        if c == '_' {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        parts.push(current);
    }
    if parts.len() > 1 {
        parts
    } else {
        Vec::new()
    }
}
