use std::{
    cmp::Reverse,
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tantivy::{
    DocAddress,
    DocId,
    Index,
    IndexReader,
    IndexWriter,
    Score,
    SegmentReader,
    Term,
    collector::{Count, TopDocs},
    doc,
    query::{
        BooleanQuery,
        BoostQuery,
        ConstScoreQuery,
        Occur,
        Query,
        RegexQuery,
        TermQuery,
    },
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
        TokenStream,
    },
};

use crate::{doc_id::PageId, error::Result, page::Page};

/// Field names used in the schema.
pub mod fields {
    pub const PAGE_ID: &str = "page_id";
    pub const TITLE: &str = "title";
    pub const BODY: &str = "body";
    pub const CATEGORY_KEY: &str = "category_key";
}

const TOKENIZER: &str = "en_stem";

/// Weight of a title match relative to a body match.
pub const TITLE_BOOST: Score = 10.0;

/// Query words shorter than this many characters are ignored.
pub const MIN_TERM_CHARS: usize = 2;

/// Weight of a prefix-only match relative to an exact match in the same field.
pub const PREFIX_WEIGHT: Score = 0.1;

/// Boolean operator words users type into queries. They never become terms.
const QUERY_KEYWORDS: &[&str] = &["and", "or", "not", "near"];

const WRITER_MEMORY_BUDGET: usize = 50_000_000;

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
pub struct SchemaFields {
    pub page_id: Field,
    pub title: Field,
    pub body: Field,
    pub category_key: Field,
}

/// How a category restricts a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryFilter {
    /// Case-insensitive equality.
    Exact(String),
    /// Case-insensitive prefix.
    Prefix(String),
}

impl CategoryFilter {
    /// `"Motion"` is an exact filter, `"Mot*"` a prefix filter. Blank input
    /// and a bare `*` mean no filter.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        match trimmed.strip_suffix('*') {
            Some(prefix) if prefix.trim().is_empty() => None,
            Some(prefix) => Some(Self::Prefix(category_key(prefix))),
            None if trimmed.is_empty() => None,
            None => Some(Self::Exact(category_key(trimmed))),
        }
    }

    pub fn matches(&self, category: &str) -> bool {
        let key = category_key(category);
        match self {
            Self::Exact(want) => key == *want,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

/// Normalized form of a category used for filtering.
pub fn category_key(category: &str) -> String {
    category.trim().to_lowercase()
}

/// A ranked full-text retrieval request. `terms` are already analyzed.
#[derive(Debug, Clone)]
pub struct FullTextQuery<'a> {
    pub terms: &'a [String],
    pub category: Option<&'a CategoryFilter>,
    /// Match page bodies as well as titles.
    pub content: bool,
    pub limit: usize,
    pub offset: usize,
}

/// One page of ranked hits plus the total number of matches.
#[derive(Debug, Clone, Default)]
pub struct FullTextHits {
    pub total: usize,
    pub hits: Vec<(Score, PageId)>,
}

/// Tantivy index over page titles and bodies.
///
/// The writer is created on first use, so a run that changes nothing never
/// takes the index lock. Every commit records the store's commit sequence
/// as its payload.
pub struct FullTextIndex {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
    writer: Mutex<Option<IndexWriter>>,
}

fn build_schema() -> (Schema, SchemaFields) {
    let mut builder = Schema::builder();

    let page_id =
        builder.add_u64_field(fields::PAGE_ID, INDEXED | STORED | FAST);

    let text_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(TOKENIZER)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    let title = builder.add_text_field(fields::TITLE, text_opts.clone());
    let body = builder.add_text_field(fields::BODY, text_opts);
    let category_key = builder.add_text_field(fields::CATEGORY_KEY, STRING);

    let schema = builder.build();
    (
        schema,
        SchemaFields {
            page_id,
            title,
            body,
            category_key,
        },
    )
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register(TOKENIZER, en_stem);
}

fn escape_regex(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn lock(
    writer: &Mutex<Option<IndexWriter>>,
) -> MutexGuard<'_, Option<IndexWriter>> {
    writer.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FullTextIndex {
    /// Open or create the index in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let (schema, fields) = build_schema();

        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(mmap_dir, schema, tantivy::IndexSettings::default())?
        };

        Self::from_index(index, fields)
    }

    /// In-memory index, used by tests.
    pub fn open_in_ram() -> Result<Self> {
        let (schema, fields) = build_schema();
        Self::from_index(Index::create_in_ram(schema), fields)
    }

    fn from_index(index: Index, fields: SchemaFields) -> Result<Self> {
        register_tokenizers(&index);
        let reader = index.reader()?;
        Ok(Self {
            index,
            reader,
            fields,
            writer: Mutex::new(None),
        })
    }

    pub fn fields(&self) -> SchemaFields {
        self.fields
    }

    /// Run `text` through the index analyzer.
    ///
    /// Words shorter than [`MIN_TERM_CHARS`] and the operator words `and`,
    /// `or`, `not` and `near` are dropped. Duplicates are removed, keeping
    /// first-occurrence order.
    pub fn analyze(&self, text: &str) -> Result<Vec<String>> {
        let mut analyzer = self.index.tokenizer_for_field(self.fields.title)?;
        let mut stream = analyzer.token_stream(text);
        let mut terms: Vec<String> = Vec::new();
        while stream.advance() {
            let token = stream.token();
            let original = text
                .get(token.offset_from..token.offset_to)
                .unwrap_or(token.text.as_str());
            if original.chars().count() < MIN_TERM_CHARS
                || QUERY_KEYWORDS.contains(&original.to_lowercase().as_str())
            {
                continue;
            }
            if !terms.contains(&token.text) {
                terms.push(token.text.clone());
            }
        }
        Ok(terms)
    }

    fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut IndexWriter) -> Result<T>,
    ) -> Result<T> {
        let mut guard = lock(&self.writer);
        let writer = match guard.take() {
            Some(writer) => writer,
            None => self.index.writer(WRITER_MEMORY_BUDGET)?,
        };
        f(guard.insert(writer))
    }

    /// Stage `page`, replacing any earlier document with the same id.
    pub fn stage_page(&self, page: &Page) -> Result<()> {
        let f = self.fields;
        self.with_writer(|writer| {
            writer.delete_term(Term::from_field_u64(
                f.page_id,
                page.page_id.get(),
            ));
            writer.add_document(doc!(
                f.page_id => page.page_id.get(),
                f.title => page.title.as_str(),
                f.body => page.body_text.as_str(),
                f.category_key => category_key(&page.category),
            ))?;
            Ok(())
        })
    }

    pub fn stage_delete(&self, page_id: PageId) -> Result<()> {
        let f = self.fields;
        self.with_writer(|writer| {
            writer.delete_term(Term::from_field_u64(f.page_id, page_id.get()));
            Ok(())
        })
    }

    pub fn has_staged(&self) -> bool {
        lock(&self.writer).is_some()
    }

    /// Commit staged changes tagged with `commit_seq`.
    ///
    /// Returns `false` when nothing was staged. The writer is released
    /// afterwards either way.
    pub fn commit(&self, commit_seq: u64) -> Result<bool> {
        let Some(mut writer) = lock(&self.writer).take() else {
            return Ok(false);
        };
        let mut prepared = writer.prepare_commit()?;
        prepared.set_payload(&commit_seq.to_string());
        prepared.commit()?;
        self.reader.reload()?;
        Ok(true)
    }

    /// Drop everything staged since the last commit.
    pub fn discard_staged(&self) {
        if let Some(mut writer) = lock(&self.writer).take()
            && let Err(e) = writer.rollback()
        {
            tracing::warn!(error = %e, "full-text rollback failed");
        }
    }

    /// Commit sequence recorded by the last commit, if any.
    pub fn committed_seq(&self) -> Result<Option<u64>> {
        let metas = self.index.load_metas()?;
        Ok(metas.payload.as_deref().and_then(|p| p.trim().parse().ok()))
    }

    /// Replace the whole index with `pages` in one commit.
    pub fn rebuild<'p>(
        &self,
        pages: impl IntoIterator<Item = &'p Page>,
        commit_seq: u64,
    ) -> Result<usize> {
        self.discard_staged();
        let mut count = 0usize;
        self.with_writer(|writer| {
            writer.delete_all_documents()?;
            Ok(())
        })?;
        for page in pages {
            self.stage_page(page)?;
            count += 1;
        }
        self.commit(commit_seq)?;
        Ok(count)
    }

    pub fn num_docs(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }

    /// Exact and prefix clauses for one analyzed term in `field`.
    fn term_clauses(
        field: Field,
        term: &str,
        boost: Score,
    ) -> Result<[(Occur, Box<dyn Query>); 2]> {
        let exact: Box<dyn Query> = Box::new(BoostQuery::new(
            Box::new(TermQuery::new(
                Term::from_field_text(field, term),
                IndexRecordOption::WithFreqs,
            )),
            boost,
        ));
        let prefix: Box<dyn Query> = Box::new(BoostQuery::new(
            Box::new(RegexQuery::from_pattern(
                &format!("{}.*", escape_regex(term)),
                field,
            )?),
            boost * PREFIX_WEIGHT,
        ));
        Ok([(Occur::Should, exact), (Occur::Should, prefix)])
    }

    fn build_query(&self, query: &FullTextQuery<'_>) -> Result<BooleanQuery> {
        let f = self.fields;
        let mut clauses: Vec<(Occur, Box<dyn Query>)> =
            Vec::with_capacity(query.terms.len() + 1);
        for term in query.terms {
            let mut either = Vec::with_capacity(4);
            either.extend(Self::term_clauses(f.title, term, TITLE_BOOST)?);
            if query.content {
                either.extend(Self::term_clauses(f.body, term, 1.0)?);
            }
            clauses.push((Occur::Must, Box::new(BooleanQuery::new(either))));
        }

        if let Some(filter) = query.category {
            let restrict: Box<dyn Query> = match filter {
                CategoryFilter::Exact(key) => Box::new(TermQuery::new(
                    Term::from_field_text(f.category_key, key),
                    IndexRecordOption::Basic,
                )),
                CategoryFilter::Prefix(prefix) => {
                    Box::new(RegexQuery::from_pattern(
                        &format!("{}.*", escape_regex(prefix)),
                        f.category_key,
                    )?)
                }
            };
            clauses.push((
                Occur::Must,
                Box::new(ConstScoreQuery::new(restrict, 0.0)),
            ));
        }

        Ok(BooleanQuery::new(clauses))
    }

    /// Ranked retrieval. Each term must match the title or the body, either
    /// exactly or as a word prefix; equal scores are ordered by page id
    /// ascending. With `content` off only titles are matched.
    ///
    /// An offset past the last match yields an empty page with the total.
    pub fn search(&self, query: &FullTextQuery<'_>) -> Result<FullTextHits> {
        if query.terms.is_empty() {
            return Ok(FullTextHits::default());
        }

        let page_id_field = fields::PAGE_ID;
        let boolean = self.build_query(query)?;
        self.reader.reload()?;
        let searcher = self.reader.searcher();

        // Offsets are unbounded caller input; tantivy sizes its heap from
        // `limit + offset`, so both must stay within the document count.
        let num_docs = usize::try_from(searcher.num_docs()).unwrap_or(usize::MAX);
        if query.limit == 0 || query.offset >= num_docs {
            let total = searcher.search(&boolean, &Count)?;
            return Ok(FullTextHits {
                total,
                hits: Vec::new(),
            });
        }

        let top = TopDocs::with_limit(query.limit.min(num_docs))
            .and_offset(query.offset)
            .tweak_score(move |segment_reader: &SegmentReader| {
                let ids = segment_reader.fast_fields().u64(page_id_field).ok();
                move |doc: DocId, score: Score| {
                    let id = ids
                        .as_ref()
                        .and_then(|column| column.first(doc))
                        .unwrap_or(u64::MAX);
                    (score, Reverse(id))
                }
            });

        let (ranked, total): (Vec<((Score, Reverse<u64>), DocAddress)>, usize) =
            searcher.search(&boolean, &(top, Count))?;

        Ok(FullTextHits {
            total,
            hits: ranked
                .into_iter()
                .map(|((score, Reverse(id)), _)| (score, PageId::from_raw(id)))
                .collect(),
        })
    }
}

impl std::fmt::Debug for FullTextIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullTextIndex").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(id: u64, title: &str, category: &str, body: &str) -> Page {
        Page {
            page_id: PageId::from_raw(id),
            topic_id: id,
            help_id: None,
            title: title.to_string(),
            category: category.to_string(),
            section_path: vec![category.to_string()],
            body_text: body.to_string(),
            raw_markup: String::new(),
            source_path: format!("{id}.xml"),
            content_hash: String::new(),
            href: None,
            order: None,
            indexed_seq: 0,
            indexed_at: 0,
        }
    }

    fn search(
        idx: &FullTextIndex,
        text: &str,
        category: Option<&str>,
    ) -> Vec<u64> {
        let terms = idx.analyze(text).unwrap();
        let filter = category.and_then(CategoryFilter::parse);
        idx.search(&FullTextQuery {
            terms: &terms,
            category: filter.as_ref(),
            content: true,
            limit: 10,
            offset: 0,
        })
        .unwrap()
        .hits
        .into_iter()
        .map(|(_, id)| id.get())
        .collect()
    }

    fn indexed(pages: &[Page]) -> FullTextIndex {
        let idx = FullTextIndex::open_in_ram().unwrap();
        for p in pages {
            idx.stage_page(p).unwrap();
        }
        idx.commit(1).unwrap();
        idx
    }

    #[test]
    fn analyze_stems_and_drops_short_words() {
        let idx = FullTextIndex::open_in_ram().unwrap();
        let terms = idx.analyze("Running a motion X motion").unwrap();
        assert_eq!(terms, vec!["run", "motion"]);
    }

    #[test]
    fn analyze_drops_operator_words() {
        let idx = FullTextIndex::open_in_ram().unwrap();
        let terms = idx.analyze("Axis AND homing or NEAR not").unwrap();
        assert_eq!(terms, idx.analyze("axis homing").unwrap());
        assert_eq!(
            idx.analyze("homing OR nothing").unwrap(),
            idx.analyze("homing nothing").unwrap()
        );
    }

    #[test]
    fn operator_words_do_not_block_matches() {
        let idx = indexed(&[page(1, "Homing", "Motion", "Axis homing procedure.")]);
        assert_eq!(search(&idx, "axis homing", None), vec![1]);
        assert_eq!(search(&idx, "axis and homing", None), vec![1]);
    }

    #[test]
    fn partial_words_match_as_prefixes() {
        let idx = indexed(&[
            page(1, "MC_BR_MoveAbsolute", "Motion", "moves to a position"),
            page(2, "MC_BR_MoveVelocity", "Motion", "moves at a velocity"),
        ]);
        assert_eq!(search(&idx, "moveabso", None), vec![1]);
        assert_eq!(search(&idx, "movevel", None), vec![2]);
        assert_eq!(search(&idx, "MoveAbsolute", None), vec![1]);
    }

    #[test]
    fn exact_match_outranks_prefix_match() {
        let idx = indexed(&[
            page(1, "Configuration", "C", "text"),
            page(2, "Config", "C", "text"),
        ]);
        assert_eq!(search(&idx, "config", None), vec![2, 1]);
    }

    #[test]
    fn title_only_ignores_bodies() {
        let idx = indexed(&[
            page(1, "Axis Guide", "Motion", "programming"),
            page(2, "Language Guide", "Motion", "axis programming"),
        ]);
        let terms = idx.analyze("axis").unwrap();
        let hits = idx
            .search(&FullTextQuery {
                terms: &terms,
                category: None,
                content: false,
                limit: 10,
                offset: 0,
            })
            .unwrap();
        assert_eq!(hits.total, 1);
        assert_eq!(hits.hits[0].1.get(), 1);
    }

    #[test]
    fn huge_offset_and_limit_return_empty_page() {
        let idx = indexed(&[page(1, "Axis", "C", "axis"), page(2, "Axis", "C", "axis")]);
        let terms = idx.analyze("axis").unwrap();
        for (limit, offset) in [(10, usize::MAX), (usize::MAX, usize::MAX), (10, 2)] {
            let hits = idx
                .search(&FullTextQuery {
                    terms: &terms,
                    category: None,
                    content: true,
                    limit,
                    offset,
                })
                .unwrap();
            assert_eq!(hits.total, 2);
            assert!(hits.hits.is_empty());
        }

        let hits = idx
            .search(&FullTextQuery {
                terms: &terms,
                category: None,
                content: true,
                limit: usize::MAX,
                offset: 1,
            })
            .unwrap();
        assert_eq!(hits.total, 2);
        assert_eq!(hits.hits.len(), 1);
    }

    #[test]
    fn title_match_outranks_body_match() {
        let idx = indexed(&[
            page(1, "Axis Guide", "Motion", "programming guide"),
            page(2, "Language Guide", "Motion", "axis programming guide"),
        ]);
        assert_eq!(search(&idx, "axis", None), vec![1, 2]);
    }

    #[test]
    fn all_terms_must_match() {
        let idx = indexed(&[
            page(1, "Safety", "Safety", "emergency stop"),
            page(2, "Stop", "Motion", "stop the axis"),
        ]);
        assert_eq!(search(&idx, "emergency stop", None), vec![1]);
        assert!(search(&idx, "emergency nothingmatches", None).is_empty());
    }

    #[test]
    fn equal_scores_order_by_page_id() {
        let idx = indexed(&[
            page(9, "Same", "C", "identical text"),
            page(3, "Same", "C", "identical text"),
            page(5, "Same", "C", "identical text"),
        ]);
        assert_eq!(search(&idx, "identical", None), vec![3, 5, 9]);
    }

    #[test]
    fn category_filters() {
        let idx = indexed(&[
            page(1, "Overview", "Motion", "overview"),
            page(2, "Overview", "Motor Control", "overview"),
            page(3, "Overview", "Safety", "overview"),
        ]);
        assert_eq!(search(&idx, "overview", Some("motion")), vec![1]);
        assert_eq!(search(&idx, "overview", Some("Mot*")), vec![1, 2]);
        assert_eq!(search(&idx, "overview", Some("*")), vec![1, 2, 3]);
        assert!(search(&idx, "overview", Some("Mot")).is_empty());
    }

    #[test]
    fn prefix_with_regex_characters() {
        let idx = indexed(&[
            page(1, "Overview", "C++ (legacy)", "overview"),
            page(2, "Overview", "Cx", "overview"),
        ]);
        assert_eq!(search(&idx, "overview", Some("c++ (*")), vec![1]);
    }

    #[test]
    fn total_and_offset() {
        let pages: Vec<_> = (1..=5)
            .map(|i| page(i, "Topic", "C", "shared words"))
            .collect();
        let idx = indexed(&pages);
        let terms = idx.analyze("shared").unwrap();
        let hits = idx
            .search(&FullTextQuery {
                terms: &terms,
                category: None,
                content: true,
                limit: 2,
                offset: 2,
            })
            .unwrap();
        assert_eq!(hits.total, 5);
        let ids: Vec<_> = hits.hits.iter().map(|(_, id)| id.get()).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn restaging_replaces_document() {
        let idx = indexed(&[page(1, "Old Title", "C", "old content")]);
        idx.stage_page(&page(1, "New Title", "C", "new content"))
            .unwrap();
        idx.commit(2).unwrap();
        assert!(search(&idx, "old", None).is_empty());
        assert_eq!(search(&idx, "content", None), vec![1]);
        assert_eq!(idx.num_docs().unwrap(), 1);
    }

    #[test]
    fn delete_and_payload() {
        let idx = indexed(&[page(1, "A", "C", "alpha"), page(2, "B", "C", "alpha")]);
        assert_eq!(idx.committed_seq().unwrap(), Some(1));

        idx.stage_delete(PageId::from_raw(1)).unwrap();
        assert!(idx.has_staged());
        assert!(idx.commit(7).unwrap());
        assert!(!idx.has_staged());
        assert_eq!(idx.committed_seq().unwrap(), Some(7));
        assert_eq!(search(&idx, "alpha", None), vec![2]);
    }

    #[test]
    fn commit_without_changes_is_noop() {
        let idx = FullTextIndex::open_in_ram().unwrap();
        assert!(!idx.commit(3).unwrap());
        assert_eq!(idx.committed_seq().unwrap(), None);
    }

    #[test]
    fn discard_drops_staged_documents() {
        let idx = indexed(&[page(1, "Kept", "C", "kept")]);
        idx.stage_page(&page(2, "Dropped", "C", "dropped")).unwrap();
        idx.discard_staged();
        assert!(search(&idx, "dropped", None).is_empty());
        assert_eq!(search(&idx, "kept", None), vec![1]);
    }

    #[test]
    fn rebuild_replaces_everything() {
        let idx = indexed(&[page(1, "Stale", "C", "stale")]);
        let fresh = [page(2, "Fresh", "C", "fresh")];
        assert_eq!(idx.rebuild(fresh.iter(), 9).unwrap(), 1);
        assert!(search(&idx, "stale", None).is_empty());
        assert_eq!(search(&idx, "fresh", None), vec![2]);
        assert_eq!(idx.committed_seq().unwrap(), Some(9));
    }

    #[test]
    fn disk_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("fulltext");
        {
            let idx = FullTextIndex::open(&dir).unwrap();
            idx.stage_page(&page(1, "Persistent", "C", "data")).unwrap();
            idx.commit(4).unwrap();
        }
        let idx = FullTextIndex::open(&dir).unwrap();
        assert_eq!(search(&idx, "persistent", None), vec![1]);
        assert_eq!(idx.committed_seq().unwrap(), Some(4));
    }

    #[test]
    fn category_filter_parse() {
        assert_eq!(
            CategoryFilter::parse(" Motion "),
            Some(CategoryFilter::Exact("motion".into()))
        );
        assert_eq!(
            CategoryFilter::parse("Mot*"),
            Some(CategoryFilter::Prefix("mot".into()))
        );
        assert_eq!(CategoryFilter::parse(""), None);
        assert_eq!(CategoryFilter::parse(" * "), None);
        assert!(CategoryFilter::parse("mot*").unwrap().matches("MOTION"));
    }
}
