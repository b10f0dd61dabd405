//! Corrective retrieval pipeline.
//!
//! A single user query runs through up to five stages:
//!
//! 1. **Decide**: ask the chat endpoint whether the query needs breaking into
//!    sub-questions (strict yes/no parse of the first token).
//! 2. **Decompose**: if yes, ask for a numbered list of sub-questions and
//!    parse lines shaped like `1. …` or `1) …`.
//! 3. **Retrieve**: run the configured search per sub-query, concurrently
//!    with a bound, order preserved.
//! 4. **Grade**: yes/no relevance of each retrieved chunk against the
//!    *original* query; keep scores ≥ 0.5, original order preserved.
//! 5. **Synthesize**: produce the final answer (combining per-sub-query
//!    findings when more than one sub-query was used), then number citations.
//!
//! Failure semantics: chat failures in stages 1 and 2 degrade to "no
//! decomposition"; a failed sub-query retrieval contributes empty results; a
//! failed grading call drops that chunk. Only stage 5 surfaces as a pipeline
//! failure, since it is the final answer-production call. No stage retries.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};

use crate::access::AccessFilter;
use crate::chat::{ChatMessage, ChatProvider};
use crate::error::{Error, Result};
use crate::models::{Caller, Citation, SearchResult};
use crate::search::{SearchEngine, SearchMode};
use crate::store::FieldFilter;

/// Relevance cutoff for graded chunks. Grades are binary, so any value in
/// `(0, 1]` keeps "yes" and drops "no"; 0.5 is the fixed contract.
const GRADE_THRESHOLD: f64 = 0.5;

/// A retrieval request executed as a caller.
#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    pub query: String,
    pub match_count: usize,
    pub mode: SearchMode,
    pub caller: Caller,
    /// Optional metadata equality filter ANDed into every search.
    pub filter: Option<FieldFilter>,
    /// Overall pipeline deadline; expiry discards partial results.
    pub deadline: Option<Duration>,
}

/// The final pipeline output.
#[derive(Debug, Clone)]
pub struct Answer {
    pub answer: String,
    /// Deduplicated, non-empty citation sources, in citation order.
    pub sources: Vec<String>,
    pub citations: Vec<Citation>,
}

/// One chunk with its relevance grade.
#[derive(Debug, Clone)]
pub struct GradedDocument {
    pub result: SearchResult,
    /// 1.0 for a "yes" verdict, 0.0 for anything else (including a failed
    /// grading call).
    pub score: f64,
}

/// Orchestrates decompose → retrieve → grade → synthesize → cite.
pub struct CorrectiveRetriever {
    engine: SearchEngine,
    chat: Arc<dyn ChatProvider>,
    max_concurrency: usize,
}

impl CorrectiveRetriever {
    pub fn new(engine: SearchEngine, chat: Arc<dyn ChatProvider>, max_concurrency: usize) -> Self {
        Self {
            engine,
            chat,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run the full pipeline for one request.
    pub async fn answer(&self, request: &RetrieveRequest) -> Result<Answer> {
        if request.query.trim().is_empty() {
            return Err(Error::validation("query must not be empty"));
        }
        if !crate::search::MATCH_COUNT_RANGE.contains(&request.match_count) {
            return Err(Error::validation("match_count must be in 1..=50"));
        }

        match request.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.run(request))
                .await
                .map_err(|_| Error::Cancelled)?,
            None => self.run(request).await,
        }
    }

    async fn run(&self, request: &RetrieveRequest) -> Result<Answer> {
        let access = AccessFilter::for_caller(&request.caller);

        let (decomposed, sub_queries) = self.decompose_query(&request.query).await;
        tracing::debug!(
            query = %request.query,
            decomposed,
            sub_queries = sub_queries.len(),
            "retrieval plan"
        );

        let retrieved = self
            .retrieve_all(&sub_queries, request, &access)
            .await;

        let all_results: Vec<SearchResult> = retrieved
            .iter()
            .flat_map(|(_, results)| results.iter().cloned())
            .collect();

        let graded = self.grade_documents(&request.query, &all_results).await;
        let kept_ids: HashSet<String> = graded
            .iter()
            .filter(|g| g.score >= GRADE_THRESHOLD)
            .map(|g| g.result.chunk_id.clone())
            .collect();

        // First-appearance order, one entry per kept chunk.
        let mut seen_kept = HashSet::new();
        let kept: Vec<SearchResult> = all_results
            .iter()
            .filter(|r| kept_ids.contains(&r.chunk_id) && seen_kept.insert(r.chunk_id.clone()))
            .cloned()
            .collect();

        let answer = if kept.is_empty() {
            // Nothing survived grading; there is no context to answer from.
            "No relevant documents were found for this query.".to_string()
        } else if sub_queries.len() > 1 {
            self.synthesize_multi(&request.query, &retrieved, &kept_ids)
                .await?
        } else {
            self.synthesize_single(&request.query, &kept).await?
        };

        let citations = build_citations(&kept);
        let mut sources = Vec::new();
        for citation in &citations {
            if !citation.source.is_empty() && !sources.contains(&citation.source) {
                sources.push(citation.source.clone());
            }
        }

        Ok(Answer {
            answer,
            sources,
            citations,
        })
    }

    /// Stages 1–2: decide whether to decompose, then parse sub-queries.
    ///
    /// Always yields at least one sub-query; every failure path falls back
    /// to the original query alone.
    pub async fn decompose_query(&self, query: &str) -> (bool, Vec<String>) {
        let decide = [
            ChatMessage::system(
                "You decide whether a search query needs to be broken into \
                 sub-questions to be answered well. Answer only yes or no.",
            ),
            ChatMessage::user(format!(
                "Does answering this query require breaking it into sub-questions?\n\n{query}"
            )),
        ];

        let wants_decomposition = match self.chat.complete(&decide).await {
            Ok(reply) => parse_yes_no(&reply),
            Err(e) => {
                tracing::warn!(query, stage = "decide", error = %e, "chat failed, skipping decomposition");
                false
            }
        };

        if !wants_decomposition {
            return (false, vec![query.to_string()]);
        }

        let list = [
            ChatMessage::system(
                "You break a complex query into independent sub-questions. \
                 Reply with a numbered list, one sub-question per line, and \
                 nothing else.",
            ),
            ChatMessage::user(format!("Break this query into sub-questions:\n\n{query}")),
        ];

        match self.chat.complete(&list).await {
            Ok(reply) => {
                let sub_queries = parse_numbered_list(&reply);
                if sub_queries.is_empty() {
                    tracing::warn!(query, stage = "decompose", "no sub-questions parsed, using original query");
                    (false, vec![query.to_string()])
                } else {
                    (true, sub_queries)
                }
            }
            Err(e) => {
                tracing::warn!(query, stage = "decompose", error = %e, "chat failed, using original query");
                (false, vec![query.to_string()])
            }
        }
    }

    /// Stage 3: retrieve per sub-query with bounded, order-preserving
    /// concurrency. A failed retrieval contributes an empty result set.
    async fn retrieve_all(
        &self,
        sub_queries: &[String],
        request: &RetrieveRequest,
        access: &AccessFilter,
    ) -> Vec<(String, Vec<SearchResult>)> {
        stream::iter(sub_queries.iter().cloned())
            .map(|sub_query| {
                let engine = self.engine.clone();
                let access = access.clone();
                let filter = request.filter.clone();
                let mode = request.mode;
                let match_count = request.match_count;
                async move {
                    match engine
                        .search(mode, &sub_query, match_count, &access, filter.as_ref())
                        .await
                    {
                        Ok(results) => (sub_query, results),
                        Err(e) => {
                            tracing::warn!(
                                sub_query = %sub_query,
                                stage = "retrieve",
                                error = %e,
                                "sub-query retrieval failed, contributing no results"
                            );
                            (sub_query, Vec::new())
                        }
                    }
                }
            })
            .buffered(self.max_concurrency)
            .collect()
            .await
    }

    /// Stage 4: grade every unique chunk against the original query.
    ///
    /// Returns one entry per unique `chunk_id` in first-appearance order,
    /// so "keep everything at or above the threshold" is reproducible.
    pub async fn grade_documents(
        &self,
        original_query: &str,
        results: &[SearchResult],
    ) -> Vec<GradedDocument> {
        let mut seen = HashSet::new();
        let unique: Vec<SearchResult> = results
            .iter()
            .filter(|r| seen.insert(r.chunk_id.clone()))
            .cloned()
            .collect();

        stream::iter(unique.into_iter())
            .map(|result| {
                let chat = Arc::clone(&self.chat);
                let query = original_query.to_string();
                async move {
                    let messages = [
                        ChatMessage::system(
                            "You judge whether a document excerpt is relevant to a \
                             query. Answer only yes or no.",
                        ),
                        ChatMessage::user(format!(
                            "Query: {query}\n\nDocument:\n{}\n\nIs this document relevant \
                             to the query? Answer yes or no.",
                            result.content
                        )),
                    ];

                    let score = match chat.complete(&messages).await {
                        Ok(reply) => {
                            if parse_yes_no(&reply) {
                                1.0
                            } else {
                                0.0
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                query = %query,
                                chunk_id = %result.chunk_id,
                                stage = "grade",
                                error = %e,
                                "grading call failed, dropping document"
                            );
                            0.0
                        }
                    };

                    GradedDocument { result, score }
                }
            })
            .buffered(self.max_concurrency)
            .collect()
            .await
    }

    /// Stage 5, multi-sub-query form: combine the kept findings of every
    /// sub-query into one coherent answer to the original query.
    async fn synthesize_multi(
        &self,
        query: &str,
        retrieved: &[(String, Vec<SearchResult>)],
        kept_ids: &HashSet<String>,
    ) -> Result<String> {
        let mut findings = String::new();
        for (index, (sub_query, results)) in retrieved.iter().enumerate() {
            findings.push_str(&format!("## Sub-question {}: {}\n", index + 1, sub_query));
            let kept: Vec<&SearchResult> = results
                .iter()
                .filter(|r| kept_ids.contains(&r.chunk_id))
                .collect();
            if kept.is_empty() {
                findings.push_str("(no relevant findings)\n\n");
            } else {
                for result in kept {
                    findings.push_str(&result.content);
                    findings.push_str("\n\n");
                }
            }
        }

        let messages = [
            ChatMessage::system(
                "You combine research findings for several sub-questions into a \
                 single coherent answer to the original question. Use only the \
                 provided findings.",
            ),
            ChatMessage::user(format!(
                "Original question: {query}\n\nFindings:\n{findings}"
            )),
        ];

        self.chat.complete(&messages).await
    }

    /// Stage 5, single-sub-query form: answer directly from the graded
    /// results.
    async fn synthesize_single(&self, query: &str, kept: &[SearchResult]) -> Result<String> {
        let context = kept
            .iter()
            .map(|r| r.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let messages = [
            ChatMessage::system(
                "You answer questions using only the provided context. If the \
                 context does not contain the answer, say so.",
            ),
            ChatMessage::user(format!("Question: {query}\n\nContext:\n{context}")),
        ];

        self.chat.complete(&messages).await
    }

    /// Restate a terse or ambiguous query as a fuller search query.
    ///
    /// Standalone step, not part of [`answer`](Self::answer). On failure the
    /// original query is returned unmodified.
    pub async fn rewrite_query(&self, query: &str) -> String {
        rewrite_query_with(self.chat.as_ref(), query).await
    }
}

/// [`CorrectiveRetriever::rewrite_query`] over a bare chat provider, for
/// callers that have no store to build a retriever from.
pub async fn rewrite_query_with(chat: &dyn ChatProvider, query: &str) -> String {
    let messages = [
        ChatMessage::system(
            "You rewrite terse or ambiguous search queries into fuller, more \
             specific ones. Reply with the rewritten query only.",
        ),
        ChatMessage::user(query.to_string()),
    ];

    match chat.complete(&messages).await {
        Ok(rewritten) if !rewritten.trim().is_empty() => rewritten.trim().to_string(),
        Ok(_) => query.to_string(),
        Err(e) => {
            tracing::warn!(query, stage = "rewrite", error = %e, "rewrite failed, keeping original query");
            query.to_string()
        }
    }
}

/// Strict yes/no parse: the first non-whitespace token, case-folded and
/// stripped of trailing punctuation, must be exactly `yes`. Anything else is
/// "no".
pub fn parse_yes_no(reply: &str) -> bool {
    reply
        .split_whitespace()
        .next()
        .map(|token| token.trim_end_matches(['.', ',', '!', ':']).eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}

/// Parse lines shaped like `1. text` or `1) text` into their text parts.
/// Lines without a leading ordinal marker are ignored.
pub fn parse_numbered_list(reply: &str) -> Vec<String> {
    reply
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
            if digits == 0 {
                return None;
            }
            let rest = &trimmed[digits..];
            let rest = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')'))?;
            if !rest.starts_with(' ') && !rest.starts_with('\t') {
                return None;
            }
            let item = rest.trim();
            if item.is_empty() {
                None
            } else {
                Some(item.to_string())
            }
        })
        .collect()
}

/// Build citations from the kept results: one per unique `chunk_id`, ids
/// assigned by 1-based position.
pub fn build_citations(kept: &[SearchResult]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    kept.iter()
        .filter(|r| seen.insert(r.chunk_id.clone()))
        .enumerate()
        .map(|(index, result)| Citation {
            id: index + 1,
            title: result.metadata.display_title(),
            source: result.metadata.display_source(),
            chunk_id: result.chunk_id.clone(),
        })
        .collect()
}

/// Format citations as a numbered list for presentation.
pub fn format_citations(citations: &[Citation]) -> String {
    citations
        .iter()
        .map(|c| {
            if c.source.is_empty() {
                format!("[{}] {}", c.id, c.title)
            } else {
                format!("[{}] {} — {}", c.id, c.title, c.source)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    #[test]
    fn test_parse_yes_no_first_token_case_insensitive() {
        assert!(parse_yes_no("yes"));
        assert!(parse_yes_no("Yes, it does."));
        assert!(parse_yes_no("  YES\nbecause…"));
        assert!(parse_yes_no("yes."));
        assert!(!parse_yes_no("no"));
        assert!(!parse_yes_no("No, not needed"));
        assert!(!parse_yes_no("maybe yes"));
        assert!(!parse_yes_no("yesterday"));
        assert!(!parse_yes_no(""));
        assert!(!parse_yes_no("   "));
    }

    #[test]
    fn test_parse_numbered_list_dot_and_paren() {
        let reply = "1. What is OAuth?\n2) How do tokens expire?\n3.Missing space\nNot numbered\n4. \n5. Last one";
        let parsed = parse_numbered_list(reply);
        assert_eq!(
            parsed,
            vec![
                "What is OAuth?".to_string(),
                "How do tokens expire?".to_string(),
                "Last one".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_numbered_list_empty_input() {
        assert!(parse_numbered_list("No list here.").is_empty());
        assert!(parse_numbered_list("").is_empty());
    }

    fn result(chunk_id: &str, title: Option<&str>, source: Option<&str>) -> SearchResult {
        SearchResult {
            chunk_id: chunk_id.to_string(),
            document_id: "d1".to_string(),
            content: "content".to_string(),
            similarity: 1.0,
            metadata: ChunkMetadata {
                document_title: title.map(|t| t.to_string()),
                source: source.map(|s| s.to_string()),
                ..ChunkMetadata::default()
            },
        }
    }

    #[test]
    fn test_build_citations_dedup_and_ids() {
        let kept = vec![
            result("c1", Some("Auth Guide"), Some("https://example.com/auth")),
            result("c1", Some("Auth Guide"), Some("https://example.com/auth")),
            result("c2", None, None),
        ];
        let citations = build_citations(&kept);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].id, 1);
        assert_eq!(citations[0].title, "Auth Guide");
        assert_eq!(citations[1].id, 2);
        assert_eq!(citations[1].title, "Untitled");
        assert_eq!(citations[1].source, "");
    }

    #[test]
    fn test_format_citations_contains_title_and_source() {
        let citations = build_citations(&[result(
            "c1",
            Some("Auth Guide"),
            Some("https://example.com/auth"),
        )]);
        let formatted = format_citations(&citations);
        assert!(formatted.contains("Auth Guide"));
        assert!(formatted.contains("https://example.com/auth"));
        assert!(formatted.starts_with("[1]"));
    }

    #[test]
    fn test_format_citations_without_source() {
        let citations = build_citations(&[result("c1", Some("Title Only"), None)]);
        assert_eq!(format_citations(&citations), "[1] Title Only");
    }
}
