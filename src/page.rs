//! Records shared by the extractor, the store and the engine.

use serde::{Deserialize, Serialize};

use crate::doc_id::{PageId, SectionId};

/// One documentation topic as committed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page_id: PageId,
    /// Numeric identifier declared by the page file itself.
    pub topic_id: u64,
    /// External id used for context-sensitive lookup. Not unique.
    pub help_id: Option<u64>,
    pub title: String,
    pub category: String,
    /// Ancestor section names, root first.
    pub section_path: Vec<String>,
    /// Normalized plain text, one paragraph per line.
    pub body_text: String,
    pub raw_markup: String,
    /// Corpus-relative path with `/` separators.
    pub source_path: String,
    pub content_hash: String,
    pub href: Option<String>,
    pub order: Option<i64>,
    /// Commit sequence assigned by the store; 0 until committed.
    #[serde(default)]
    pub indexed_seq: u64,
    /// Unix seconds of the commit; 0 until committed.
    #[serde(default)]
    pub indexed_at: u64,
}

impl Page {
    /// The section this page hangs under, `None` for root-level pages.
    pub fn parent_section(&self) -> Option<SectionId> {
        if self.section_path.is_empty() {
            None
        } else {
            Some(SectionId::from_path(&self.section_path))
        }
    }

    pub fn header(&self) -> PageHeader {
        PageHeader {
            page_id: self.page_id,
            title: self.title.clone(),
            category: self.category.clone(),
            help_id: self.help_id,
            section_path: self.section_path.clone(),
            parent: self.parent_section(),
            order: self.order,
            href: self.href.clone(),
            source_path: self.source_path.clone(),
            indexed_seq: self.indexed_seq,
        }
    }
}

/// Compact projection of a [`Page`] without body or markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageHeader {
    pub page_id: PageId,
    pub title: String,
    pub category: String,
    pub help_id: Option<u64>,
    pub section_path: Vec<String>,
    pub parent: Option<SectionId>,
    pub order: Option<i64>,
    pub href: Option<String>,
    pub source_path: String,
    pub indexed_seq: u64,
}

impl PageHeader {
    pub fn breadcrumb_path(&self) -> String {
        breadcrumb_path(&self.section_path, &self.title)
    }
}

/// `Section > Subsection > Title`, the navigation path shown with hits.
pub fn breadcrumb_path(section_path: &[String], title: &str) -> String {
    section_path
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(title))
        .collect::<Vec<_>>()
        .join(" > ")
}

/// A node of the browse tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionNode {
    pub node_id: SectionId,
    pub parent_id: Option<SectionId>,
    pub display_name: String,
    /// Name of the root section of this node's chain.
    pub category: String,
    /// 1 for root sections.
    pub depth: usize,
    /// Number of committed pages in this node's subtree.
    pub page_count: u64,
}

/// One manifest entry: what was indexed from a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub source_path: String,
    pub content_hash: String,
    pub last_indexed_at: u64,
    pub page_id: PageId,
}

impl Fingerprint {
    pub fn for_page(page: &Page, now: u64) -> Self {
        Self {
            source_path: page.source_path.clone(),
            content_hash: page.content_hash.clone(),
            last_indexed_at: now,
            page_id: page.page_id,
        }
    }
}

/// An immediate child in the browse tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SectionChild {
    Section {
        node_id: SectionId,
        name: String,
        page_count: u64,
    },
    Page {
        page_id: PageId,
        title: String,
        help_id: Option<u64>,
    },
}

impl SectionChild {
    pub fn name(&self) -> &str {
        match self {
            SectionChild::Section { name, .. } => name,
            SectionChild::Page { title, .. } => title,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, SectionChild::Page { .. })
    }
}

/// One ancestor in a breadcrumb trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crumb {
    pub node_id: SectionId,
    pub name: String,
}

/// Page count for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub name: String,
    pub pages: u64,
}

/// Corpus-level counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_pages: u64,
    pub total_sections: u64,
    pub root_sections: u64,
    pub help_id_mappings: u64,
    pub categories: Vec<CategoryCount>,
    /// Unix seconds of the last run that changed the store.
    pub last_indexed_at: Option<u64>,
    pub commit_seq: u64,
}

/// Sort categories by page count descending, then name ascending.
pub fn sort_categories(categories: &mut [CategoryCount]) {
    categories.sort_by(|a, b| {
        b.pages.cmp(&a.pages).then_with(|| a.name.cmp(&b.name))
    });
}

/// Order siblings: sections by case-insensitive name, then pages by
/// declared order, case-insensitive title and id.
pub fn sort_children(children: &mut [(SectionChild, Option<i64>)]) {
    children.sort_by(|(a, a_order), (b, b_order)| {
        use std::cmp::Ordering;
        match (a, b) {
            (SectionChild::Section { .. }, SectionChild::Page { .. }) => {
                Ordering::Less
            }
            (SectionChild::Page { .. }, SectionChild::Section { .. }) => {
                Ordering::Greater
            }
            (
                SectionChild::Section {
                    node_id: a_id,
                    name: a_name,
                    ..
                },
                SectionChild::Section {
                    node_id: b_id,
                    name: b_name,
                    ..
                },
            ) => a_name
                .to_lowercase()
                .cmp(&b_name.to_lowercase())
                .then_with(|| a_id.cmp(b_id)),
            (
                SectionChild::Page {
                    page_id: a_id,
                    title: a_title,
                    ..
                },
                SectionChild::Page {
                    page_id: b_id,
                    title: b_title,
                    ..
                },
            ) => a_order
                .unwrap_or(i64::MAX)
                .cmp(&b_order.unwrap_or(i64::MAX))
                .then_with(|| {
                    a_title.to_lowercase().cmp(&b_title.to_lowercase())
                })
                .then_with(|| a_id.cmp(b_id)),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_child(title: &str, order: Option<i64>) -> (SectionChild, Option<i64>) {
        (
            SectionChild::Page {
                page_id: PageId::from_source_path(title),
                title: title.to_string(),
                help_id: None,
            },
            order,
        )
    }

    fn section_child(name: &str) -> (SectionChild, Option<i64>) {
        (
            SectionChild::Section {
                node_id: SectionId::from_path(&[name]),
                name: name.to_string(),
                page_count: 1,
            },
            None,
        )
    }

    #[test]
    fn categories_sort_by_count_then_name() {
        let mut cats = vec![
            CategoryCount { name: "Safety".into(), pages: 2 },
            CategoryCount { name: "Motion".into(), pages: 5 },
            CategoryCount { name: "Hardware".into(), pages: 2 },
        ];
        sort_categories(&mut cats);
        let names: Vec<_> = cats.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Motion", "Hardware", "Safety"]);
    }

    #[test]
    fn sections_before_pages_and_order_respected() {
        let mut children = vec![
            page_child("zeta", Some(1)),
            page_child("Alpha", None),
            section_child("beta"),
            page_child("gamma", Some(0)),
            section_child("Aardvark"),
        ];
        sort_children(&mut children);
        let names: Vec<_> =
            children.iter().map(|(c, _)| c.name().to_string()).collect();
        assert_eq!(names, vec!["Aardvark", "beta", "gamma", "zeta", "Alpha"]);
    }

    #[test]
    fn breadcrumb_path_ends_with_title() {
        let header = PageHeader {
            page_id: PageId::from_raw(1),
            title: "MC_BR_MoveAbsolute".into(),
            category: "Motion".into(),
            help_id: None,
            section_path: vec!["Motion".into(), "mapp Motion".into()],
            parent: None,
            order: None,
            href: None,
            source_path: "a.xml".into(),
            indexed_seq: 1,
        };
        assert_eq!(
            header.breadcrumb_path(),
            "Motion > mapp Motion > MC_BR_MoveAbsolute"
        );
    }
}
