//! Per-branch metadata threaded through the graph.
//!
//! Every in-flight unit of work carries a [`NodeSessionMetadata`]: the path
//! of demultiplex branch indices that distinguishes this branch from its
//! siblings. The metadata doubles as the session-lookup key and as the
//! recombination sort key for gathers.

use crate::errors::PipelineError;
use std::collections::{HashMap, HashSet};
use tracing::error;

/// String key uniquely identifying one logical branch at one node.
pub type SessionKey = String;

/// Branch index within one demultiplex level.
pub type ShardId = usize;

/// Immutable, cheaply copyable record of the demultiplex path of a session.
///
/// Each level maps the demultiplexing node's name to this branch's index and
/// the total sibling count at that level. `levels` remembers the order in
/// which levels were opened; gathers must unwind them in LIFO order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSessionMetadata {
    details: HashMap<String, (ShardId, usize)>,
    levels: Vec<String>,
}

/// Description of the demultiplex levels collapsed by a gathering node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollapseDetails {
    /// Names of the collapsed demultiplexers, oldest first.
    pub collapsed_names: Vec<String>,
    /// Sibling counts of the collapsed levels, same order as the names.
    pub collapsed_sizes: Vec<usize>,
}

impl CollapseDetails {
    /// Total number of branches recombined by this collapse.
    #[must_use]
    pub fn total_branches(&self) -> usize {
        self.collapsed_sizes.iter().product()
    }
}

impl NodeSessionMetadata {
    /// Metadata for the root session of a request, with no branch path.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Branch index and sibling count of level `name`, if open.
    #[must_use]
    pub fn level(&self, name: &str) -> Option<(ShardId, usize)> {
        self.details.get(name).copied()
    }

    /// Spawns `count` subsession metadatas, one per branch of the
    /// demultiplexing node `node_name`.
    pub fn generate_subsessions(
        &self,
        node_name: &str,
        count: usize,
    ) -> Result<Vec<Self>, PipelineError> {
        if node_name.is_empty() {
            error!("tried to generate subsessions with an empty node name");
            return Err(PipelineError::internal(
                "cannot generate subsessions for an unnamed node",
            ));
        }
        if self.details.contains_key(node_name) {
            error!(node = node_name, "node already spawned subsessions");
            return Err(PipelineError::internal(format!(
                "node '{node_name}' already opened a demultiplex level"
            )));
        }
        let mut metas = Vec::with_capacity(count);
        for index in 0..count {
            let mut meta = self.clone();
            meta.details.insert(node_name.to_string(), (index, count));
            meta.levels.push(node_name.to_string());
            metas.push(meta);
        }
        Ok(metas)
    }

    /// The session key for the full branch path.
    #[must_use]
    pub fn session_key(&self) -> SessionKey {
        // Levels cannot fail LIFO checks when nothing is ignored.
        self.build_key(&HashSet::new()).unwrap_or_default()
    }

    /// The session key with the `ignored` demultiplex levels stripped.
    ///
    /// Used by gathering nodes so that all sibling branches of the gathered
    /// demultiplexer(s) map onto one shared session.
    pub fn session_key_ignoring(
        &self,
        ignored: &HashSet<String>,
    ) -> Result<SessionKey, PipelineError> {
        self.build_key(ignored)
    }

    fn build_key(&self, ignored: &HashSet<String>) -> Result<SessionKey, PipelineError> {
        for name in ignored {
            if !self.details.contains_key(name) {
                error!(level = %name, "session key requested ignoring a level that is not open");
                return Err(PipelineError::internal(format!(
                    "demultiplex level '{name}' is not open on this branch"
                )));
            }
        }
        self.check_lifo(ignored)?;
        let mut parts = Vec::with_capacity(self.levels.len().saturating_sub(ignored.len()));
        for name in self.levels.iter().rev() {
            if ignored.contains(name) {
                continue;
            }
            let (index, _) = self.details[name];
            parts.push(format!("{name}_{index}"));
        }
        Ok(parts.join("_"))
    }

    /// Strips the `gathered` levels, returning the collapsed metadata and a
    /// description of what was removed.
    pub fn collapse(
        &self,
        gathered: &HashSet<String>,
    ) -> Result<(Self, CollapseDetails), PipelineError> {
        if gathered.is_empty() {
            return Err(PipelineError::internal(
                "tried to collapse sessions with an empty gather set",
            ));
        }
        for name in gathered {
            if !self.details.contains_key(name) {
                error!(level = %name, "tried to collapse a level that is not open");
                return Err(PipelineError::internal(format!(
                    "demultiplex level '{name}' is not open on this branch"
                )));
            }
        }
        self.check_lifo(gathered)?;

        let mut collapsed = Self::default();
        let mut details = CollapseDetails::default();
        for name in &self.levels {
            let entry = self.details[name];
            if gathered.contains(name) {
                details.collapsed_names.push(name.clone());
                details.collapsed_sizes.push(entry.1);
            } else {
                collapsed.levels.push(name.clone());
                collapsed.details.insert(name.clone(), entry);
            }
        }
        Ok((collapsed, details))
    }

    /// Linearizes this branch's indices within the `collapsed` levels into a
    /// single shard id, the position of this branch in gather order.
    pub fn shard_id(&self, collapsed: &HashSet<String>) -> Result<ShardId, PipelineError> {
        if collapsed.is_empty() {
            return Ok(0);
        }
        if collapsed.len() > self.levels.len() {
            error!("tried to collapse more demultiplex levels than are open");
            return Err(PipelineError::internal(
                "tried to collapse more demultiplex levels than are open",
            ));
        }
        self.check_lifo(collapsed)?;
        let mut shard = 0;
        let mut factor = 1;
        for name in self.levels.iter().rev().take(collapsed.len()) {
            let (index, size) = self.details[name];
            shard += factor * index;
            factor *= size;
        }
        Ok(shard)
    }

    /// Verifies that `stripped` forms a suffix of the open levels: gathers
    /// must unwind demultiplexers newest-first.
    fn check_lifo(&self, stripped: &HashSet<String>) -> Result<(), PipelineError> {
        if stripped.is_empty() {
            return Ok(());
        }
        for name in self.levels.iter().rev().take(stripped.len()) {
            if !stripped.contains(name) {
                error!(
                    level = %name,
                    "gather does not unwind demultiplexers in LIFO order"
                );
                return Err(PipelineError::internal(format!(
                    "demultiplex level '{name}' must be gathered first"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_root_session_key_is_empty() {
        assert_eq!(NodeSessionMetadata::new().session_key(), "");
    }

    #[test]
    fn test_subsessions_get_distinct_keys() {
        let root = NodeSessionMetadata::new();
        let metas = root.generate_subsessions("split", 3).unwrap();
        assert_eq!(metas.len(), 3);
        assert_eq!(metas[0].session_key(), "split_0");
        assert_eq!(metas[2].session_key(), "split_2");
        assert_eq!(metas[1].level("split"), Some((1, 3)));
    }

    #[test]
    fn test_nested_subsession_keys_are_newest_first() {
        let root = NodeSessionMetadata::new();
        let outer = root.generate_subsessions("a", 2).unwrap();
        let inner = outer[1].generate_subsessions("b", 4).unwrap();
        assert_eq!(inner[3].session_key(), "b_3_a_1");
    }

    #[test]
    fn test_reusing_a_level_name_fails() {
        let root = NodeSessionMetadata::new();
        let metas = root.generate_subsessions("a", 2).unwrap();
        assert!(metas[0].generate_subsessions("a", 2).is_err());
    }

    #[test]
    fn test_key_ignoring_innermost_level() {
        let root = NodeSessionMetadata::new();
        let outer = root.generate_subsessions("a", 2).unwrap();
        let inner = outer[1].generate_subsessions("b", 3).unwrap();
        let key = inner[2].session_key_ignoring(&set(&["b"])).unwrap();
        assert_eq!(key, "a_1");
    }

    #[test]
    fn test_key_ignoring_outer_level_violates_lifo() {
        let root = NodeSessionMetadata::new();
        let outer = root.generate_subsessions("a", 2).unwrap();
        let inner = outer[0].generate_subsessions("b", 3).unwrap();
        assert!(inner[0].session_key_ignoring(&set(&["a"])).is_err());
    }

    #[test]
    fn test_collapse_strips_level_and_reports_size() {
        let root = NodeSessionMetadata::new();
        let outer = root.generate_subsessions("a", 2).unwrap();
        let inner = outer[1].generate_subsessions("b", 3).unwrap();
        let (collapsed, details) = inner[2].collapse(&set(&["b"])).unwrap();
        assert_eq!(collapsed.session_key(), "a_1");
        assert_eq!(details.collapsed_names, vec!["b".to_string()]);
        assert_eq!(details.collapsed_sizes, vec![3]);
        assert_eq!(details.total_branches(), 3);
    }

    #[test]
    fn test_collapse_two_levels_at_once() {
        let root = NodeSessionMetadata::new();
        let outer = root.generate_subsessions("a", 2).unwrap();
        let inner = outer[1].generate_subsessions("b", 3).unwrap();
        let (collapsed, details) = inner[0].collapse(&set(&["a", "b"])).unwrap();
        assert_eq!(collapsed.session_key(), "");
        assert_eq!(details.total_branches(), 6);
        assert_eq!(
            details.collapsed_names,
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_collapse_of_unknown_level_fails() {
        let root = NodeSessionMetadata::new();
        let metas = root.generate_subsessions("a", 2).unwrap();
        assert!(metas[0].collapse(&set(&["zzz"])).is_err());
    }

    #[test]
    fn test_shard_id_single_level() {
        let root = NodeSessionMetadata::new();
        let metas = root.generate_subsessions("a", 4).unwrap();
        for (i, meta) in metas.iter().enumerate() {
            assert_eq!(meta.shard_id(&set(&["a"])).unwrap(), i);
        }
    }

    #[test]
    fn test_shard_id_two_levels_is_row_major() {
        let root = NodeSessionMetadata::new();
        let outer = root.generate_subsessions("a", 2).unwrap();
        let mut shards = Vec::new();
        for outer_meta in &outer {
            for inner_meta in outer_meta.generate_subsessions("b", 3).unwrap() {
                shards.push(inner_meta.shard_id(&set(&["a", "b"])).unwrap());
            }
        }
        // Outer index is the slower-varying digit.
        assert_eq!(shards, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_shard_id_empty_set_is_zero() {
        let meta = NodeSessionMetadata::new();
        assert_eq!(meta.shard_id(&HashSet::new()).unwrap(), 0);
    }
}
