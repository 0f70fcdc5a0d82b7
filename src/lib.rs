//! helpdex - an incremental full-text index for structured help corpora.
//!
//! helpdex walks a tree of XML help pages, extracts each page's title,
//! section path, category and body, and keeps a persistent store in sync
//! with the tree: records in [redb](https://github.com/cberner/redb) and a
//! ranked full-text index in
//! [Tantivy](https://github.com/quickwit-oss/tantivy). On top of the store
//! it answers ranked search, section browsing, lookups by page or help id,
//! breadcrumbs and corpus statistics.
//!
//! # Quick start
//!
//! ```no_run
//! use helpdex::{Config, DataDir, HelpIndex, SearchRequest};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config = Config::new("/srv/help/en", data_dir);
//! let index = HelpIndex::open(config).unwrap();
//!
//! let results = index
//!     .search(&SearchRequest::new("absolute move").category("Motion"))
//!     .unwrap();
//! for hit in &results.results {
//!     println!("{} (score: {:.3}) {}", hit.breadcrumb_path, hit.score, hit.online_url);
//! }
//! ```

pub mod config;
pub mod doc_id;
pub mod error;
pub mod extract;
pub mod incremental;
pub mod page;
pub mod pipeline;
pub mod search;
pub mod service;
pub mod store;
pub mod tantivy_index;
pub mod text_util;
pub mod walker;

pub use config::{Config, DataDir, DocVersion};
pub use doc_id::{PageId, SectionId};
pub use error::{Error, Result};
pub use page::Page;
pub use pipeline::{CancelToken, RunSummary};
pub use search::{SearchEngine, SearchRequest, SearchResults};
pub use service::HelpIndex;
pub use store::IndexStore;
