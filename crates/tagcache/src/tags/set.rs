//! Caller-facing tag set

use crate::config::TagMode;
use crate::context::StoreContext;
use crate::tags::TagOps;
use crate::CacheResult;
use sha1::{Digest, Sha1};
use std::sync::Arc;

/// An unordered collection of tag names presented to write, read, and
/// flush operations.
///
/// Names are canonicalised (deduplicated and sorted) so that the
/// `all`-mode namespace digest depends only on the set, not on argument
/// order.
#[derive(Clone)]
pub struct TagSet {
    context: Arc<StoreContext>,
    names: Vec<String>,
}

impl TagSet {
    pub fn new(context: Arc<StoreContext>, names: &[&str]) -> Self {
        let mut names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        names.sort();
        names.dedup();
        Self { context, names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn context(&self) -> &Arc<StoreContext> {
        &self.context
    }

    /// Tag identifiers in the active mode: the structure infix in `all`
    /// mode, the bare name in `any` mode.
    pub fn tag_ids(&self, mode: TagMode) -> Vec<String> {
        match mode {
            TagMode::All => self
                .names
                .iter()
                .map(|n| format!("tag:{}:entries", n))
                .collect(),
            TagMode::Any => self.names.clone(),
        }
    }

    /// The `all`-mode namespace digest: `sha1(tag_ids joined by '|')`.
    pub fn digest(&self) -> String {
        let joined = self.tag_ids(TagMode::All).join("|");
        let mut hasher = Sha1::new();
        hasher.update(joined.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// The union of cache keys across all contained tags, deduplicated.
    /// Iteration streams page-wise underneath; the result is materialised
    /// for the caller.
    pub async fn entries(&self) -> CacheResult<Vec<String>> {
        TagOps::for_context(Arc::clone(&self.context))
            .entries(self)
            .await
    }

    /// Remove every entry referenced by these tags, with the semantics of
    /// the active mode.
    pub async fn flush(&self) -> CacheResult<()> {
        TagOps::for_context(Arc::clone(&self.context))
            .flush(self)
            .await
    }
}
