//! Query side: ranked search, browsing the section tree and lookups.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::{
    config::LinkFormat,
    doc_id::{PageId, SectionId},
    error::Result,
    page::{
        CategoryCount,
        Crumb,
        Page,
        SectionChild,
        SectionNode,
        Statistics,
        breadcrumb_path,
        sort_children,
    },
    store::IndexStore,
    tantivy_index::{CategoryFilter, FullTextQuery, MIN_TERM_CHARS},
    text_util::extract_snippet,
};

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// `"Motion"` matches that category exactly (case-insensitive);
    /// `"Mot*"` matches by prefix.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    /// Search page bodies too. When `false` only titles are matched.
    #[serde(default = "default_content")]
    pub content: bool,
}

fn default_content() -> bool {
    true
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            category: None,
            limit: None,
            offset: 0,
            content: default_content(),
        }
    }
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Match titles only.
    pub fn titles_only(mut self) -> Self {
        self.content = false;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub page_id: PageId,
    pub title: String,
    pub category: String,
    pub help_id: Option<u64>,
    pub breadcrumb_path: String,
    pub score: f32,
    pub online_url: String,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub query: String,
    pub category: Option<String>,
    pub total_matches: usize,
    pub offset: usize,
    pub results: Vec<SearchHit>,
}

/// One level of the browse tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseListing {
    /// The listed section; `None` for the root.
    pub section: Option<SectionNode>,
    /// Path from the root to the listed section, inclusive.
    pub breadcrumb: Vec<Crumb>,
    pub children: Vec<SectionChild>,
}

/// In-memory copy of the navigation tree, valid for one commit sequence.
#[derive(Debug)]
struct SectionTree {
    commit_seq: u64,
    nodes: HashMap<SectionId, SectionNode>,
    children: HashMap<u64, Vec<SectionChild>>,
}

impl SectionTree {
    fn build(store: &IndexStore) -> Result<Self> {
        // Stamp before reading: a commit racing the build leaves the tree
        // stale, never falsely fresh.
        let commit_seq = store.commit_seq();
        let sections = store.load_sections()?;
        let headers = store.load_page_headers()?;

        let mut grouped: HashMap<u64, Vec<(SectionChild, Option<i64>)>> =
            HashMap::new();
        for node in &sections {
            grouped
                .entry(SectionId::key_of(node.parent_id))
                .or_default()
                .push((
                    SectionChild::Section {
                        node_id: node.node_id,
                        name: node.display_name.clone(),
                        page_count: node.page_count,
                    },
                    None,
                ));
        }
        for header in headers {
            grouped.entry(SectionId::key_of(header.parent)).or_default().push((
                SectionChild::Page {
                    page_id: header.page_id,
                    title: header.title,
                    help_id: header.help_id,
                },
                header.order,
            ));
        }

        let children = grouped
            .into_iter()
            .map(|(key, mut list)| {
                sort_children(&mut list);
                (key, list.into_iter().map(|(child, _)| child).collect())
            })
            .collect();

        tracing::debug!(
            commit_seq,
            sections = sections.len(),
            "built section tree"
        );

        Ok(Self {
            commit_seq,
            nodes: sections.into_iter().map(|n| (n.node_id, n)).collect(),
            children,
        })
    }

    fn children_of(&self, parent: Option<SectionId>) -> Vec<SectionChild> {
        self.children
            .get(&SectionId::key_of(parent))
            .cloned()
            .unwrap_or_default()
    }

    fn trail(&self, node: &SectionNode) -> Vec<Crumb> {
        let mut trail = vec![Crumb {
            node_id: node.node_id,
            name: node.display_name.clone(),
        }];
        let mut parent = node.parent_id;
        while let Some(id) = parent {
            let Some(ancestor) = self.nodes.get(&id) else {
                break;
            };
            trail.push(Crumb {
                node_id: ancestor.node_id,
                name: ancestor.display_name.clone(),
            });
            parent = ancestor.parent_id;
        }
        trail.reverse();
        trail
    }
}

/// Read-only query engine over an [`IndexStore`].
///
/// Safe to share between threads. The section tree is cached and rebuilt
/// lazily the first time it is needed after a commit.
pub struct SearchEngine {
    store: Arc<IndexStore>,
    links: LinkFormat,
    tree: RwLock<Option<Arc<SectionTree>>>,
}

impl SearchEngine {
    pub fn new(store: Arc<IndexStore>, links: LinkFormat) -> Self {
        Self {
            store,
            links,
            tree: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn online_url(&self, page: &Page) -> String {
        self.links.online_url(page.href.as_deref(), &page.source_path)
    }

    fn tree(&self) -> Result<Arc<SectionTree>> {
        let current = self.store.commit_seq();
        {
            let cached = self.tree.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(tree) = cached.as_ref()
                && tree.commit_seq == current
            {
                return Ok(Arc::clone(tree));
            }
        }

        let fresh = Arc::new(SectionTree::build(&self.store)?);
        let mut slot = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Ranked search over titles and bodies.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResults> {
        let mut results = SearchResults {
            query: request.query.clone(),
            category: request.category.clone(),
            total_matches: 0,
            offset: request.offset,
            results: Vec::new(),
        };

        let terms = self.store.analyze(&request.query)?;
        if terms.is_empty() {
            return Ok(results);
        }
        let filter = request.category.as_deref().and_then(CategoryFilter::parse);

        let hits = self.store.query_fulltext(&FullTextQuery {
            terms: &terms,
            category: filter.as_ref(),
            content: request.content,
            limit: request.effective_limit(),
            offset: request.offset,
        })?;
        results.total_matches = hits.total;

        let ids: Vec<PageId> = hits.hits.iter().map(|(_, id)| *id).collect();
        let mut pages: HashMap<PageId, Page> = self
            .store
            .get_pages(&ids)?
            .into_iter()
            .map(|p| (p.page_id, p))
            .collect();

        let needles = snippet_needles(&request.query, &terms);
        for (score, id) in hits.hits {
            // The full-text index can briefly hold pages the records no
            // longer have.
            let Some(page) = pages.remove(&id) else {
                tracing::debug!(page_id = %id, "dropping hit without a stored page");
                continue;
            };
            results.results.push(SearchHit {
                page_id: page.page_id,
                breadcrumb_path: breadcrumb_path(&page.section_path, &page.title),
                online_url: self.online_url(&page),
                snippet: extract_snippet(&page.body_text, &needles),
                title: page.title,
                category: page.category,
                help_id: page.help_id,
                score,
            });
        }

        Ok(results)
    }

    pub fn list_categories(&self) -> Result<Vec<CategoryCount>> {
        self.store.list_categories()
    }

    /// Children of a section, or the root sections and root-level pages for
    /// `None`. Unknown sections yield `None`.
    pub fn browse(&self, section: Option<SectionId>) -> Result<Option<BrowseListing>> {
        let tree = self.tree()?;
        let Some(id) = section else {
            return Ok(Some(BrowseListing {
                section: None,
                breadcrumb: Vec::new(),
                children: tree.children_of(None),
            }));
        };
        let Some(node) = tree.nodes.get(&id) else {
            return Ok(None);
        };
        Ok(Some(BrowseListing {
            section: Some(node.clone()),
            breadcrumb: tree.trail(node),
            children: tree.children_of(Some(id)),
        }))
    }

    pub fn get_page(&self, page_id: PageId) -> Result<Option<Page>> {
        self.store.get_page(page_id)
    }

    pub fn get_page_by_help_id(&self, help_id: u64) -> Result<Option<Page>> {
        self.store.get_page_by_help_id(help_id)
    }

    pub fn get_breadcrumb(&self, page_id: PageId) -> Result<Option<Vec<Crumb>>> {
        self.store.get_breadcrumb(page_id)
    }

    pub fn get_statistics(&self) -> Result<Statistics> {
        self.store.get_statistics()
    }
}

impl std::fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEngine")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Words to look for when cutting a snippet: the analyzed terms plus the
/// query words as typed, lowercased.
fn snippet_needles(query: &str, terms: &[String]) -> Vec<String> {
    let mut needles: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_TERM_CHARS)
        .map(str::to_lowercase)
        .collect();
    for term in terms {
        if !needles.contains(term) {
            needles.push(term.clone());
        }
    }
    needles
}
