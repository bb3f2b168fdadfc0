//! Knowledge retrieval for LLM prompt augmentation.
//!
//! Knowledge bases are directories of JSON documents plus a metadata file.
//! Retrieval is a keyword scorer: word overlap against the call objective
//! with a bonus for an exact phrase hit. No vector store; a heavier
//! retriever can slot in behind `knowledge_for_prompt` without touching
//! callers.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Character budget per prompt, roughly four chars per token.
const CHARS_PER_TOKEN: usize = 4;
/// Exact-phrase bonus added to the overlap score.
const PHRASE_BONUS: usize = 5;

/// Knowledge base metadata (`metadata.json` in the base directory).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseMeta {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    /// Keywords matching this base to call objectives. Empty means the
    /// base always applies.
    #[serde(default)]
    pub objective_keywords: Vec<String>,
}

/// A stored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default, rename = "type")]
    pub doc_type: String,
}

/// A scored search hit.
#[derive(Debug, Clone)]
pub struct DocumentHit {
    pub kb_id: String,
    pub document: Document,
    pub score: usize,
}

/// Directory-backed knowledge store.
pub struct KnowledgeStore {
    dir: PathBuf,
}

impl KnowledgeStore {
    /// Open a store rooted at `dir`. The directory need not exist yet;
    /// an empty store retrieves nothing.
    #[must_use]
    pub fn open(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// List available knowledge bases as `(id, metadata)`.
    #[must_use]
    pub fn list_bases(&self) -> Vec<(String, KnowledgeBaseMeta)> {
        let mut bases = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return bases,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let meta_path = path.join("metadata.json");
            let Ok(text) = std::fs::read_to_string(&meta_path) else {
                continue;
            };
            match serde_json::from_str::<KnowledgeBaseMeta>(&text) {
                Ok(meta) => {
                    let id = entry.file_name().to_string_lossy().into_owned();
                    bases.push((id, meta));
                }
                Err(e) => debug!("skipping malformed KB metadata {}: {e}", meta_path.display()),
            }
        }
        bases.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        bases
    }

    /// Search documents across the given bases (all bases when `None`).
    #[must_use]
    pub fn search(&self, query: &str, kb_ids: Option<&[String]>, limit: usize) -> Vec<DocumentHit> {
        let all_ids: Vec<String>;
        let ids: &[String] = match kb_ids {
            Some(ids) => ids,
            None => {
                all_ids = self.list_bases().into_iter().map(|(id, _)| id).collect();
                &all_ids
            }
        };

        let query_lower = query.to_lowercase();
        let query_words: std::collections::HashSet<&str> =
            query_lower.split_whitespace().collect();

        let mut hits = Vec::new();
        for kb_id in ids {
            let docs_dir = self.dir.join(kb_id).join("documents");
            let entries = match std::fs::read_dir(&docs_dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(&path) else {
                    continue;
                };
                let Ok(document) = serde_json::from_str::<Document>(&text) else {
                    continue;
                };

                let content = format!("{} {}", document.title, document.content).to_lowercase();
                let content_words: std::collections::HashSet<&str> =
                    content.split_whitespace().collect();

                let mut score = query_words.intersection(&content_words).count();
                if content.contains(&query_lower) {
                    score += PHRASE_BONUS;
                }

                if score > 0 {
                    hits.push(DocumentHit {
                        kb_id: kb_id.clone(),
                        document,
                        score,
                    });
                }
            }
        }

        hits.sort_by(|a, b| b.score.cmp(&a.score));
        hits.truncate(limit);
        hits
    }

    /// Format knowledge relevant to a call objective for prompt
    /// injection, within roughly `max_tokens` of text.
    ///
    /// Bases with objective keywords only participate when a keyword
    /// appears in the objective; keyword-less bases always participate.
    #[must_use]
    pub fn knowledge_for_prompt(&self, objective: &str, max_tokens: usize) -> String {
        if objective.trim().is_empty() {
            return String::new();
        }

        let objective_lower = objective.to_lowercase();
        let all = self.list_bases();
        let mut matched: Vec<String> = all
            .iter()
            .filter(|(_, meta)| {
                meta.objective_keywords.is_empty()
                    || meta
                        .objective_keywords
                        .iter()
                        .any(|kw| objective_lower.contains(&kw.to_lowercase()))
            })
            .map(|(id, _)| id.clone())
            .collect();
        if matched.is_empty() {
            matched = all.into_iter().map(|(id, _)| id).collect();
        }

        let hits = self.search(objective, Some(&matched), 10);
        if hits.is_empty() {
            return String::new();
        }

        let max_chars = max_tokens * CHARS_PER_TOKEN;
        let mut lines = vec!["RELEVANT KNOWLEDGE:".to_owned()];
        let mut used = 0usize;

        for hit in hits {
            let block = format!("\n### {}\n{}", hit.document.title, hit.document.content);
            if used + block.len() > max_chars {
                let remaining = max_chars.saturating_sub(used);
                if remaining > 100 {
                    let clipped: String = block.chars().take(remaining).collect();
                    lines.push(format!("{clipped}..."));
                }
                break;
            }
            used += block.len();
            lines.push(block);
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_kb(dir: &Path, id: &str, keywords: &[&str], docs: &[(&str, &str)]) {
        let kb = dir.join(id);
        std::fs::create_dir_all(kb.join("documents")).unwrap();
        let meta = serde_json::json!({
            "name": id,
            "objective_keywords": keywords,
        });
        std::fs::write(kb.join("metadata.json"), meta.to_string()).unwrap();
        for (i, (title, content)) in docs.iter().enumerate() {
            let doc = serde_json::json!({
                "id": format!("doc{i}"),
                "title": title,
                "content": content,
                "type": "faq",
            });
            std::fs::write(
                kb.join("documents").join(format!("doc{i}.json")),
                doc.to_string(),
            )
            .unwrap();
        }
    }

    #[test]
    fn empty_store_retrieves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnowledgeStore::open(dir.path());
        assert!(store.list_bases().is_empty());
        assert_eq!(store.knowledge_for_prompt("order a pizza", 2000), "");
    }

    #[test]
    fn word_overlap_ranks_documents() {
        let dir = tempfile::tempdir().unwrap();
        write_kb(
            dir.path(),
            "menu",
            &[],
            &[
                ("Pizza sizes", "Large pizza is 16 inches and costs $20"),
                ("Store hours", "Open ten to nine every day"),
            ],
        );

        let store = KnowledgeStore::open(dir.path());
        let hits = store.search("large pizza order", None, 5);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].document.title, "Pizza sizes");
    }

    #[test]
    fn exact_phrase_beats_scattered_words() {
        let dir = tempfile::tempdir().unwrap();
        write_kb(
            dir.path(),
            "kb",
            &[],
            &[
                ("Scattered", "appointment words everywhere confirm various"),
                ("Exact", "To confirm appointment slots call the office"),
            ],
        );

        let store = KnowledgeStore::open(dir.path());
        let hits = store.search("confirm appointment", None, 5);
        assert_eq!(hits[0].document.title, "Exact");
    }

    #[test]
    fn keyword_gated_bases_need_a_matching_objective() {
        let dir = tempfile::tempdir().unwrap();
        write_kb(
            dir.path(),
            "pricing",
            &["price", "quote"],
            &[("Rates", "Standard rate is $99 per month")],
        );

        let store = KnowledgeStore::open(dir.path());
        // "quote" appears in the objective: base participates.
        let text = store.knowledge_for_prompt("get a quote for service", 2000);
        assert!(text.contains("Standard rate"));
    }

    #[test]
    fn prompt_respects_the_character_budget() {
        let dir = tempfile::tempdir().unwrap();
        let long_content = "pizza ".repeat(3000);
        write_kb(dir.path(), "kb", &[], &[("Long doc", &long_content)]);

        let store = KnowledgeStore::open(dir.path());
        let text = store.knowledge_for_prompt("pizza", 500);
        assert!(text.len() <= 500 * CHARS_PER_TOKEN + 200, "len {}", text.len());
    }

    #[test]
    fn prompt_is_prefixed_and_titled() {
        let dir = tempfile::tempdir().unwrap();
        write_kb(dir.path(), "kb", &[], &[("Hours", "Open 9am to 5pm weekdays")]);

        let store = KnowledgeStore::open(dir.path());
        let text = store.knowledge_for_prompt("what are your hours", 2000);
        assert!(text.starts_with("RELEVANT KNOWLEDGE:"));
        assert!(text.contains("### Hours"));
    }
}
