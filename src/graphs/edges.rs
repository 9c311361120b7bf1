//! Edge types: unconditional successors and conditional router edges (§3, §4.B).

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::channels::StateSnapshot;
use crate::types::NodeKind;

/// `router: State -> label`. Evaluated against the post-barrier state of the
/// super-step in which `from` ran (§4.C step e).
pub type RouterFn = Arc<dyn Fn(&StateSnapshot) -> String + Send + Sync>;

/// A conditional edge: `(from, router, {label -> to})` (§3 Edge).
///
/// The router returns exactly one label; the label is resolved against
/// `labels` to find the successor. A label absent from the map is a fatal
/// [`crate::schedulers::SchedulerError::RouterLabel`].
#[derive(Clone)]
pub struct ConditionalEdge {
    pub from: NodeKind,
    pub router: RouterFn,
    pub labels: IndexMap<String, NodeKind>,
}

impl ConditionalEdge {
    pub fn new(
        from: NodeKind,
        router: RouterFn,
        labels: impl IntoIterator<Item = (String, NodeKind)>,
    ) -> Self {
        Self {
            from,
            router,
            labels: labels.into_iter().collect(),
        }
    }
}

impl fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("from", &self.from)
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}
