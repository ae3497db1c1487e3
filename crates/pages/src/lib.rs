//! Pages domain module (event-sourced).
//!
//! Reference domain for the runtime: a minimal `Page` aggregate with create
//! and rename commands plus a publication-time activity listener, wired
//! through the registry. Domain logic itself is deterministic and does no IO.

pub mod page;

pub use page::{
    PAGE, PAGE_CREATE, PAGE_CREATED, PAGE_RENAME, PAGE_RENAMED, Page, PageActivityListener,
    PageCreateHandler, PageRenameHandler, PageState, register,
};
