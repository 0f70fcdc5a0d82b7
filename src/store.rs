//! Durable page records (redb) plus the full-text index (tantivy).
//!
//! The redb database is the source of truth. Every committed change bumps a
//! commit sequence, and every tantivy commit carries that sequence as its
//! payload, so a mismatch at open time means the full-text index missed
//! some changes and is rebuilt from the stored pages.

use std::{
    collections::HashMap,
    path::Path,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use redb::{
    Database,
    MultimapTable,
    MultimapTableDefinition,
    ReadableDatabase,
    ReadableMultimapTable,
    ReadableTable,
    ReadableTableMetadata,
    Table,
    TableDefinition,
    WriteTransaction,
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    doc_id::{PageId, SectionId},
    error::Result,
    incremental::Manifest,
    page::{
        CategoryCount,
        Crumb,
        Fingerprint,
        Page,
        PageHeader,
        SectionChild,
        SectionNode,
        Statistics,
        sort_categories,
        sort_children,
    },
    tantivy_index::{FullTextHits, FullTextIndex, FullTextQuery},
};

const PAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("pages");
const PAGE_HEADERS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("page_headers");
const FINGERPRINTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("fingerprints");
const HELP_IDS: MultimapTableDefinition<u64, u64> =
    MultimapTableDefinition::new("help_ids");
const SECTIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("sections");
const SECTION_CHILDREN: MultimapTableDefinition<u64, u64> =
    MultimapTableDefinition::new("section_children");
const SECTION_PAGES: MultimapTableDefinition<u64, u64> =
    MultimapTableDefinition::new("section_pages");
const CATEGORIES: TableDefinition<&str, u64> =
    TableDefinition::new("categories");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const META_COMMIT_SEQ: &str = "commit_seq";
const META_LAST_INDEXED_AT: &str = "last_indexed_at";

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Every table, opened once inside a write transaction.
struct WriteTables<'txn> {
    pages: Table<'txn, u64, &'static [u8]>,
    headers: Table<'txn, u64, &'static [u8]>,
    fingerprints: Table<'txn, &'static str, &'static [u8]>,
    help_ids: MultimapTable<'txn, u64, u64>,
    sections: Table<'txn, u64, &'static [u8]>,
    section_children: MultimapTable<'txn, u64, u64>,
    section_pages: MultimapTable<'txn, u64, u64>,
    categories: Table<'txn, &'static str, u64>,
    meta: Table<'txn, &'static str, u64>,
}

impl<'txn> WriteTables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> Result<Self> {
        Ok(Self {
            pages: txn.open_table(PAGES)?,
            headers: txn.open_table(PAGE_HEADERS)?,
            fingerprints: txn.open_table(FINGERPRINTS)?,
            help_ids: txn.open_multimap_table(HELP_IDS)?,
            sections: txn.open_table(SECTIONS)?,
            section_children: txn.open_multimap_table(SECTION_CHILDREN)?,
            section_pages: txn.open_multimap_table(SECTION_PAGES)?,
            categories: txn.open_table(CATEGORIES)?,
            meta: txn.open_table(META)?,
        })
    }

    fn meta(&self, key: &str) -> Result<u64> {
        Ok(self.meta.get(key)?.map(|v| v.value()).unwrap_or(0))
    }

    fn next_seq(&mut self) -> Result<u64> {
        let seq = self.meta(META_COMMIT_SEQ)? + 1;
        self.meta.insert(META_COMMIT_SEQ, seq)?;
        Ok(seq)
    }

    fn load_page(&self, page_id: PageId) -> Result<Option<Page>> {
        self.pages
            .get(page_id.get())?
            .map(|v| decode(v.value()))
            .transpose()
    }

    fn load_section(&self, node_id: SectionId) -> Result<Option<SectionNode>> {
        self.sections
            .get(node_id.get())?
            .map(|v| decode(v.value()))
            .transpose()
    }

    fn adjust_category(&mut self, category: &str, delta: i64) -> Result<()> {
        let current = self.categories.get(category)?.map(|v| v.value());
        let next = current.unwrap_or(0).saturating_add_signed(delta);
        if next == 0 {
            self.categories.remove(category)?;
        } else {
            self.categories.insert(category, next)?;
        }
        Ok(())
    }

    /// Remove a committed page and everything that points at it.
    ///
    /// Section page counts are decremented along the whole path; sections
    /// that end up empty are pruned from the tree.
    fn detach(&mut self, old: &Page) -> Result<()> {
        let id = old.page_id.get();
        self.pages.remove(id)?;
        self.headers.remove(id)?;
        if let Some(help_id) = old.help_id {
            self.help_ids.remove(help_id, id)?;
        }
        self.adjust_category(&old.category, -1)?;
        self.section_pages
            .remove(SectionId::key_of(old.parent_section()), id)?;

        for depth in 1..=old.section_path.len() {
            let node_id = SectionId::from_path(&old.section_path[..depth]);
            let Some(mut node) = self.load_section(node_id)? else {
                continue;
            };
            node.page_count = node.page_count.saturating_sub(1);
            if node.page_count == 0 {
                self.sections.remove(node_id.get())?;
                self.section_children
                    .remove(SectionId::key_of(node.parent_id), node_id.get())?;
            } else {
                self.sections.insert(node_id.get(), encode(&node)?.as_slice())?;
            }
        }
        Ok(())
    }

    fn attach(&mut self, page: &Page) -> Result<()> {
        let id = page.page_id.get();
        self.pages.insert(id, encode(page)?.as_slice())?;
        self.headers.insert(id, encode(&page.header())?.as_slice())?;
        if let Some(help_id) = page.help_id {
            self.help_ids.insert(help_id, id)?;
        }
        self.adjust_category(&page.category, 1)?;
        self.section_pages
            .insert(SectionId::key_of(page.parent_section()), id)?;

        let path = &page.section_path;
        for depth in 1..=path.len() {
            let node_id = SectionId::from_path(&path[..depth]);
            let node = match self.load_section(node_id)? {
                Some(mut node) => {
                    node.page_count += 1;
                    node
                }
                None => {
                    let parent_id = (depth > 1)
                        .then(|| SectionId::from_path(&path[..depth - 1]));
                    self.section_children
                        .insert(SectionId::key_of(parent_id), node_id.get())?;
                    SectionNode {
                        node_id,
                        parent_id,
                        display_name: path[depth - 1].clone(),
                        category: path[0].clone(),
                        depth,
                        page_count: 1,
                    }
                }
            };
            self.sections.insert(node_id.get(), encode(&node)?.as_slice())?;
        }
        Ok(())
    }
}

/// The persistent index: page records, navigation tree, manifest and
/// full-text index.
///
/// Writes go through one caller at a time (the indexing pipeline); reads
/// are safe from any thread and always see whole committed pages.
pub struct IndexStore {
    db: Database,
    fulltext: FullTextIndex,
    commit_seq: AtomicU64,
    fulltext_stale: AtomicBool,
}

impl IndexStore {
    /// Open or create the store, repairing the full-text index if it lags
    /// behind the records.
    pub fn open(db_path: &Path, fulltext_dir: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(db_path)?;
        let fulltext = FullTextIndex::open(fulltext_dir)?;
        Self::from_parts(db, fulltext)
    }

    fn from_parts(db: Database, fulltext: FullTextIndex) -> Result<Self> {
        let txn = db.begin_write()?;
        let seq = {
            let tables = WriteTables::open(&txn)?;
            tables.meta(META_COMMIT_SEQ)?
        };
        txn.commit()?;

        let store = Self {
            db,
            fulltext,
            commit_seq: AtomicU64::new(seq),
            fulltext_stale: AtomicBool::new(false),
        };

        let recorded = store.fulltext.committed_seq()?;
        if recorded.unwrap_or(0) != seq {
            tracing::warn!(
                store_seq = seq,
                fulltext_seq = ?recorded,
                "full-text index out of date, rebuilding",
            );
            store.rebuild_fulltext()?;
        }

        Ok(store)
    }

    /// Current commit sequence; changes whenever a page is added, replaced
    /// or removed.
    pub fn commit_seq(&self) -> u64 {
        self.commit_seq.load(Ordering::Acquire)
    }

    /// Replace (or add) a page in one transaction, then stage it for the
    /// next full-text commit. Returns the page as committed.
    ///
    /// Once the records are committed the call succeeds; a staging failure
    /// only marks the full-text index for a rebuild on the next commit.
    pub fn upsert_page(&self, mut page: Page, now: u64) -> Result<Page> {
        let txn = self.db.begin_write()?;
        let seq = {
            let mut tables = WriteTables::open(&txn)?;
            if let Some(old) = tables.load_page(page.page_id)? {
                tables.detach(&old)?;
            }
            let seq = tables.next_seq()?;
            page.indexed_seq = seq;
            page.indexed_at = now;
            tables.attach(&page)?;
            let fingerprint = Fingerprint::for_page(&page, now);
            tables.fingerprints.insert(
                page.source_path.as_str(),
                encode(&fingerprint)?.as_slice(),
            )?;
            seq
        };
        txn.commit()?;
        self.commit_seq.store(seq, Ordering::Release);

        if let Err(e) = self.fulltext.stage_page(&page) {
            tracing::warn!(
                page_id = %page.page_id,
                error = %e,
                "full-text staging failed, index will be rebuilt"
            );
            self.fulltext_stale.store(true, Ordering::Release);
        }
        Ok(page)
    }

    /// Remove the pages indexed from `source_paths` in one transaction.
    /// Unknown paths are ignored. Returns how many pages were removed.
    pub fn delete_pages(&self, source_paths: &[String]) -> Result<usize> {
        if source_paths.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin_write()?;
        let (removed, seq) = {
            let mut tables = WriteTables::open(&txn)?;
            let mut removed = Vec::new();
            for path in source_paths {
                let fingerprint: Option<Fingerprint> = tables
                    .fingerprints
                    .remove(path.as_str())?
                    .map(|v| decode(v.value()))
                    .transpose()?;
                let page_id = fingerprint
                    .map_or_else(|| PageId::from_source_path(path), |fp| fp.page_id);
                if let Some(old) = tables.load_page(page_id)? {
                    tables.detach(&old)?;
                    removed.push(page_id);
                }
            }
            if removed.is_empty() {
                (removed, 0)
            } else {
                let seq = tables.next_seq()?;
                (removed, seq)
            }
        };

        if removed.is_empty() {
            txn.abort()?;
            return Ok(0);
        }
        txn.commit()?;
        self.commit_seq.store(seq, Ordering::Release);

        for page_id in &removed {
            if let Err(e) = self.fulltext.stage_delete(*page_id) {
                tracing::warn!(
                    page_id = %page_id,
                    error = %e,
                    "full-text staging failed, index will be rebuilt"
                );
                self.fulltext_stale.store(true, Ordering::Release);
                break;
            }
        }
        Ok(removed.len())
    }

    /// Commit staged full-text changes. Returns `false` when nothing was
    /// pending.
    pub fn commit_fulltext(&self) -> Result<bool> {
        if self.fulltext_stale.load(Ordering::Acquire) {
            self.rebuild_fulltext()?;
            return Ok(true);
        }
        self.fulltext.commit(self.commit_seq())
    }

    /// Forget staged full-text changes. The next open rebuilds the index if
    /// records were committed in the meantime.
    pub fn discard_fulltext(&self) {
        self.fulltext.discard_staged();
    }

    /// Rebuild the full-text index from every stored page.
    pub fn rebuild_fulltext(&self) -> Result<usize> {
        let pages = self.load_pages()?;
        let count = self.fulltext.rebuild(pages.iter(), self.commit_seq())?;
        self.fulltext_stale.store(false, Ordering::Release);
        tracing::info!(pages = count, "rebuilt full-text index");
        Ok(count)
    }

    /// Record the time of a run that changed the store.
    pub fn record_run(&self, now: u64) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            meta.insert(META_LAST_INDEXED_AT, now)?;
        }
        txn.commit()?;
        Ok(())
    }

    // -- Full-text --

    pub fn analyze(&self, text: &str) -> Result<Vec<String>> {
        self.fulltext.analyze(text)
    }

    pub fn query_fulltext(&self, query: &FullTextQuery<'_>) -> Result<FullTextHits> {
        self.fulltext.search(query)
    }

    pub fn fulltext_docs(&self) -> Result<u64> {
        self.fulltext.num_docs()
    }

    // -- Pages --

    pub fn get_page(&self, page_id: PageId) -> Result<Option<Page>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PAGES)?;
        table
            .get(page_id.get())?
            .map(|v| decode(v.value()))
            .transpose()
    }

    pub fn get_header(&self, page_id: PageId) -> Result<Option<PageHeader>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PAGE_HEADERS)?;
        table
            .get(page_id.get())?
            .map(|v| decode(v.value()))
            .transpose()
    }

    /// Several pages from one read transaction, in request order. Ids with
    /// no stored page are skipped.
    pub fn get_pages(&self, page_ids: &[PageId]) -> Result<Vec<Page>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PAGES)?;
        let mut pages = Vec::with_capacity(page_ids.len());
        for id in page_ids {
            if let Some(v) = table.get(id.get())? {
                pages.push(decode(v.value())?);
            }
        }
        Ok(pages)
    }

    /// The page mapped to `help_id`. When several pages share it, the one
    /// committed last wins.
    pub fn get_page_by_help_id(&self, help_id: u64) -> Result<Option<Page>> {
        let txn = self.db.begin_read()?;
        let help_ids = txn.open_multimap_table(HELP_IDS)?;
        let headers = txn.open_table(PAGE_HEADERS)?;

        let mut best: Option<PageHeader> = None;
        for entry in help_ids.get(help_id)? {
            let page_id = entry?.value();
            let Some(raw) = headers.get(page_id)? else {
                continue;
            };
            let header: PageHeader = decode(raw.value())?;
            let newer = best.as_ref().is_none_or(|b| {
                (header.indexed_seq, header.page_id) > (b.indexed_seq, b.page_id)
            });
            if newer {
                best = Some(header);
            }
        }

        let Some(best) = best else {
            return Ok(None);
        };
        let pages = txn.open_table(PAGES)?;
        pages
            .get(best.page_id.get())?
            .map(|v| decode(v.value()))
            .transpose()
    }

    pub fn load_pages(&self) -> Result<Vec<Page>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PAGES)?;
        let mut pages = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            pages.push(decode(v.value())?);
        }
        Ok(pages)
    }

    pub fn load_page_headers(&self) -> Result<Vec<PageHeader>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PAGE_HEADERS)?;
        let mut headers = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            headers.push(decode(v.value())?);
        }
        Ok(headers)
    }

    /// Every fingerprint, keyed by source path.
    pub fn load_manifest(&self) -> Result<Manifest> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FINGERPRINTS)?;
        let mut manifest = HashMap::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let fingerprint: Fingerprint = decode(v.value())?;
            manifest.insert(k.value().to_string(), fingerprint);
        }
        Ok(manifest)
    }

    // -- Sections --

    pub fn get_section(&self, node_id: SectionId) -> Result<Option<SectionNode>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SECTIONS)?;
        table
            .get(node_id.get())?
            .map(|v| decode(v.value()))
            .transpose()
    }

    pub fn load_sections(&self) -> Result<Vec<SectionNode>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SECTIONS)?;
        let mut nodes = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            nodes.push(decode(v.value())?);
        }
        Ok(nodes)
    }

    /// Ordered children of a section, or of the root for `None`.
    pub fn get_section_children(
        &self,
        parent: Option<SectionId>,
    ) -> Result<Vec<SectionChild>> {
        let key = SectionId::key_of(parent);
        let txn = self.db.begin_read()?;
        let children = txn.open_multimap_table(SECTION_CHILDREN)?;
        let section_pages = txn.open_multimap_table(SECTION_PAGES)?;
        let sections = txn.open_table(SECTIONS)?;
        let headers = txn.open_table(PAGE_HEADERS)?;

        let mut out = Vec::new();
        for entry in children.get(key)? {
            let child_id = entry?.value();
            if let Some(raw) = sections.get(child_id)? {
                let node: SectionNode = decode(raw.value())?;
                out.push((
                    SectionChild::Section {
                        node_id: node.node_id,
                        name: node.display_name,
                        page_count: node.page_count,
                    },
                    None,
                ));
            }
        }
        for entry in section_pages.get(key)? {
            let page_id = entry?.value();
            if let Some(raw) = headers.get(page_id)? {
                let header: PageHeader = decode(raw.value())?;
                out.push((
                    SectionChild::Page {
                        page_id: header.page_id,
                        title: header.title,
                        help_id: header.help_id,
                    },
                    header.order,
                ));
            }
        }

        sort_children(&mut out);
        Ok(out.into_iter().map(|(child, _)| child).collect())
    }

    /// Ancestor sections of a page, root first, ending at its immediate
    /// parent. `None` when the page is unknown.
    pub fn get_breadcrumb(&self, page_id: PageId) -> Result<Option<Vec<Crumb>>> {
        Ok(self.get_header(page_id)?.map(|header| {
            (1..=header.section_path.len())
                .map(|depth| Crumb {
                    node_id: SectionId::from_path(&header.section_path[..depth]),
                    name: header.section_path[depth - 1].clone(),
                })
                .collect()
        }))
    }

    // -- Aggregates --

    pub fn list_categories(&self) -> Result<Vec<CategoryCount>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CATEGORIES)?;
        let mut categories = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            categories.push(CategoryCount {
                name: k.value().to_string(),
                pages: v.value(),
            });
        }
        sort_categories(&mut categories);
        Ok(categories)
    }

    pub fn last_indexed_at(&self) -> Result<Option<u64>> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META)?;
        Ok(meta.get(META_LAST_INDEXED_AT)?.map(|v| v.value()))
    }

    pub fn get_statistics(&self) -> Result<Statistics> {
        let categories = self.list_categories()?;
        let txn = self.db.begin_read()?;
        let pages = txn.open_table(PAGES)?;
        let sections = txn.open_table(SECTIONS)?;
        let children = txn.open_multimap_table(SECTION_CHILDREN)?;
        let help_ids = txn.open_multimap_table(HELP_IDS)?;
        let meta = txn.open_table(META)?;

        let root_sections = children
            .get(SectionId::ROOT_KEY)?
            .filter(|entry| entry.is_ok())
            .count() as u64;

        Ok(Statistics {
            total_pages: pages.len()?,
            total_sections: sections.len()?,
            root_sections,
            help_id_mappings: help_ids.len()?,
            categories,
            last_indexed_at: meta.get(META_LAST_INDEXED_AT)?.map(|v| v.value()),
            commit_seq: meta.get(META_COMMIT_SEQ)?.map(|v| v.value()).unwrap_or(0),
        })
    }
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("commit_seq", &self.commit_seq())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tantivy_index::CategoryFilter;

    fn test_store() -> (tempfile::TempDir, IndexStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::open(
            &tmp.path().join("index.redb"),
            &tmp.path().join("fulltext"),
        )
        .unwrap();
        (tmp, store)
    }

    fn page(path: &str, title: &str, sections: &[&str]) -> Page {
        Page {
            page_id: PageId::from_source_path(path),
            topic_id: 1,
            help_id: None,
            title: title.to_string(),
            category: sections.first().copied().unwrap_or("General").to_string(),
            section_path: sections.iter().map(|s| s.to_string()).collect(),
            body_text: format!("body of {title}"),
            raw_markup: String::new(),
            source_path: path.to_string(),
            content_hash: format!("hash-{path}-{title}"),
            href: None,
            order: None,
            indexed_seq: 0,
            indexed_at: 0,
        }
    }

    #[test]
    fn upsert_assigns_increasing_sequence() {
        let (_tmp, store) = test_store();
        let a = store.upsert_page(page("a.xml", "A", &["Motion"]), 10).unwrap();
        let b = store.upsert_page(page("b.xml", "B", &["Motion"]), 11).unwrap();
        assert_eq!(a.indexed_seq, 1);
        assert_eq!(b.indexed_seq, 2);
        assert_eq!(store.commit_seq(), 2);
        assert_eq!(store.get_page(a.page_id).unwrap().unwrap().indexed_at, 10);
    }

    #[test]
    fn manifest_tracks_fingerprints() {
        let (_tmp, store) = test_store();
        let committed =
            store.upsert_page(page("a.xml", "A", &["Motion"]), 5).unwrap();
        let manifest = store.load_manifest().unwrap();
        let fp = &manifest["a.xml"];
        assert_eq!(fp.content_hash, committed.content_hash);
        assert_eq!(fp.page_id, committed.page_id);
        assert_eq!(fp.last_indexed_at, 5);
    }

    #[test]
    fn sections_are_refcounted_and_pruned() {
        let (_tmp, store) = test_store();
        store
            .upsert_page(page("a.xml", "A", &["Motion", "Axis"]), 1)
            .unwrap();
        store
            .upsert_page(page("b.xml", "B", &["Motion", "Drives"]), 1)
            .unwrap();

        let motion = SectionId::from_path(&["Motion"]);
        assert_eq!(store.get_section(motion).unwrap().unwrap().page_count, 2);
        assert_eq!(store.load_sections().unwrap().len(), 3);

        store.delete_pages(&["b.xml".to_string()]).unwrap();
        assert_eq!(store.get_section(motion).unwrap().unwrap().page_count, 1);
        assert!(
            store
                .get_section(SectionId::from_path(&["Motion", "Drives"]))
                .unwrap()
                .is_none()
        );

        store.delete_pages(&["a.xml".to_string()]).unwrap();
        assert!(store.load_sections().unwrap().is_empty());
        assert!(store.get_section_children(None).unwrap().is_empty());
    }

    #[test]
    fn moving_a_page_updates_the_tree() {
        let (_tmp, store) = test_store();
        store
            .upsert_page(page("a.xml", "A", &["Motion", "Axis"]), 1)
            .unwrap();
        store
            .upsert_page(page("a.xml", "A", &["Safety"]), 2)
            .unwrap();

        let roots = store.get_section_children(None).unwrap();
        let names: Vec<_> = roots.iter().map(SectionChild::name).collect();
        assert_eq!(names, vec!["Safety"]);
        assert_eq!(store.get_statistics().unwrap().total_pages, 1);
        let cats = store.list_categories().unwrap();
        assert_eq!(cats.len(), 1);
        assert_eq!(cats[0].name, "Safety");
    }

    #[test]
    fn children_are_ordered() {
        let (_tmp, store) = test_store();
        let mut second = page("p2.xml", "Second", &["Motion"]);
        second.order = Some(2);
        let mut first = page("p1.xml", "zz First", &["Motion"]);
        first.order = Some(1);
        store.upsert_page(second, 1).unwrap();
        store.upsert_page(first, 1).unwrap();
        store
            .upsert_page(page("sub.xml", "Deep", &["Motion", "Axis"]), 1)
            .unwrap();

        let children = store
            .get_section_children(Some(SectionId::from_path(&["Motion"])))
            .unwrap();
        let names: Vec<_> = children.iter().map(SectionChild::name).collect();
        assert_eq!(names, vec!["Axis", "zz First", "Second"]);
        assert!(!children[0].is_leaf());
        assert!(children[1].is_leaf());
    }

    #[test]
    fn root_level_pages_are_root_children() {
        let (_tmp, store) = test_store();
        store.upsert_page(page("start.xml", "Start", &[]), 1).unwrap();
        let roots = store.get_section_children(None).unwrap();
        assert_eq!(roots.len(), 1);
        assert!(roots[0].is_leaf());
        assert_eq!(
            store
                .get_breadcrumb(PageId::from_source_path("start.xml"))
                .unwrap(),
            Some(vec![])
        );
    }

    #[test]
    fn breadcrumb_runs_root_to_parent() {
        let (_tmp, store) = test_store();
        let p = store
            .upsert_page(page("a.xml", "A", &["Motion", "Axis", "Homing"]), 1)
            .unwrap();
        let crumbs = store.get_breadcrumb(p.page_id).unwrap().unwrap();
        let names: Vec<_> = crumbs.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Motion", "Axis", "Homing"]);
        assert_eq!(
            crumbs[2].node_id,
            SectionId::from_path(&["Motion", "Axis", "Homing"])
        );
        assert!(
            store
                .get_breadcrumb(PageId::from_raw(42))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn help_id_last_indexed_wins() {
        let (_tmp, store) = test_store();
        let mut a = page("a.xml", "A", &["Motion"]);
        a.help_id = Some(100);
        let mut b = page("b.xml", "B", &["Motion"]);
        b.help_id = Some(100);
        store.upsert_page(a.clone(), 1).unwrap();
        store.upsert_page(b, 2).unwrap();
        assert_eq!(
            store.get_page_by_help_id(100).unwrap().unwrap().title,
            "B"
        );

        a.title = "A again".into();
        store.upsert_page(a, 3).unwrap();
        assert_eq!(
            store.get_page_by_help_id(100).unwrap().unwrap().title,
            "A again"
        );
        assert_eq!(store.get_statistics().unwrap().help_id_mappings, 2);
        assert!(store.get_page_by_help_id(7).unwrap().is_none());
    }

    #[test]
    fn delete_unknown_paths_is_noop() {
        let (_tmp, store) = test_store();
        store.upsert_page(page("a.xml", "A", &["Motion"]), 1).unwrap();
        let seq = store.commit_seq();
        assert_eq!(store.delete_pages(&["nope.xml".to_string()]).unwrap(), 0);
        assert_eq!(store.commit_seq(), seq);
    }

    #[test]
    fn statistics_and_categories() {
        let (_tmp, store) = test_store();
        store.upsert_page(page("a.xml", "A", &["Motion"]), 1).unwrap();
        store.upsert_page(page("b.xml", "B", &["Motion", "X"]), 1).unwrap();
        store.upsert_page(page("c.xml", "C", &["Safety"]), 1).unwrap();
        store.record_run(99).unwrap();

        let stats = store.get_statistics().unwrap();
        assert_eq!(stats.total_pages, 3);
        assert_eq!(stats.total_sections, 3);
        assert_eq!(stats.root_sections, 2);
        assert_eq!(stats.last_indexed_at, Some(99));
        assert_eq!(stats.commit_seq, 3);
        assert_eq!(stats.categories[0].name, "Motion");
        assert_eq!(stats.categories[0].pages, 2);
    }

    #[test]
    fn fulltext_follows_records() {
        let (_tmp, store) = test_store();
        store.upsert_page(page("a.xml", "Homing", &["Motion"]), 1).unwrap();
        assert!(store.commit_fulltext().unwrap());
        assert!(!store.commit_fulltext().unwrap());

        let terms = store.analyze("homing").unwrap();
        let filter = CategoryFilter::parse("motion");
        let hits = store
            .query_fulltext(&FullTextQuery {
                terms: &terms,
                category: filter.as_ref(),
                content: true,
                limit: 10,
                offset: 0,
            })
            .unwrap();
        assert_eq!(hits.total, 1);
    }

    #[test]
    fn staging_failure_after_commit_still_succeeds() {
        let (tmp, store) = test_store();
        store
            .upsert_page(page("a.xml", "Anchor", &["Motion"]), 1)
            .unwrap();
        store.commit_fulltext().unwrap();

        // A second handle on the same directory holds the writer lock.
        let blocker = FullTextIndex::open(&tmp.path().join("fulltext")).unwrap();
        blocker
            .stage_delete(PageId::from_source_path("unrelated.xml"))
            .unwrap();

        let committed = store
            .upsert_page(page("b.xml", "Blocked", &["Motion"]), 2)
            .unwrap();
        assert_eq!(committed.indexed_seq, 2);
        assert!(store.get_page(committed.page_id).unwrap().is_some());
        assert!(store.fulltext_stale.load(Ordering::Acquire));

        assert_eq!(
            store.delete_pages(&["a.xml".to_string()]).unwrap(),
            1
        );

        drop(blocker);
        assert!(store.commit_fulltext().unwrap());
        assert!(!store.fulltext_stale.load(Ordering::Acquire));
        assert_eq!(store.fulltext_docs().unwrap(), 1);

        let terms = store.analyze("blocked").unwrap();
        let hits = store
            .query_fulltext(&FullTextQuery {
                terms: &terms,
                category: None,
                content: true,
                limit: 10,
                offset: 0,
            })
            .unwrap();
        assert_eq!(hits.hits.len(), 1);
        assert_eq!(hits.hits[0].1, committed.page_id);
    }

    #[test]
    fn reopen_rebuilds_lagging_fulltext() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("index.redb");
        let ft = tmp.path().join("fulltext");
        {
            let store = IndexStore::open(&db, &ft).unwrap();
            store.upsert_page(page("a.xml", "Homing", &["Motion"]), 1).unwrap();
            store.commit_fulltext().unwrap();
            store.upsert_page(page("b.xml", "Jogging", &["Motion"]), 1).unwrap();
            store.discard_fulltext();
        }

        let store = IndexStore::open(&db, &ft).unwrap();
        assert_eq!(store.fulltext_docs().unwrap(), 2);
        let terms = store.analyze("jogging").unwrap();
        let hits = store
            .query_fulltext(&FullTextQuery {
                terms: &terms,
                category: None,
                content: true,
                limit: 10,
                offset: 0,
            })
            .unwrap();
        assert_eq!(hits.total, 1);
    }
}
