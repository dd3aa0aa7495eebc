//! Outline document engine for heading-per-line outline text.
//! The pure modules (`headline`, `tree`, `links`, `fold`, `format`) map text to values;
//! `sync` owns the live buffer, the parsed forest and the two debounce timers.

pub mod core {
    use crate::catalog::StateCatalog;
    use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
    use indexmap::{IndexMap, IndexSet};
    use serde::{Deserialize, Serialize};
    use std::{
        collections::BTreeSet,
        fmt,
        path::{Path, PathBuf},
    };
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeId(pub Uuid);

    impl NodeId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for NodeId {
        fn default() -> Self {
            Self::new()
        }
    }

    impl fmt::Display for NodeId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// Single-letter priority cookie, `[#A]` through `[#C]`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub enum Priority {
        A,
        B,
        C,
    }

    impl Priority {
        pub fn from_char(c: char) -> Option<Self> {
            match c {
                'A' => Some(Self::A),
                'B' => Some(Self::B),
                'C' => Some(Self::C),
                _ => None,
            }
        }

        pub fn as_char(self) -> char {
            match self {
                Self::A => 'A',
                Self::B => 'B',
                Self::C => 'C',
            }
        }

        /// none → A → B → C → none.
        pub fn cycle(current: Option<Priority>) -> Option<Priority> {
            match current {
                None => Some(Self::A),
                Some(Self::A) => Some(Self::B),
                Some(Self::B) => Some(Self::C),
                Some(Self::C) => None,
            }
        }
    }

    /// A date with an optional time of day.
    ///
    /// Active timestamps render as `<...>` (SCHEDULED, DEADLINE); inactive ones as
    /// `[...]` (CLOSED).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Timestamp {
        pub active: bool,
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
    }

    impl Timestamp {
        pub fn active(date: NaiveDate) -> Self {
            Self {
                active: true,
                date,
                time: None,
            }
        }

        /// Inactive timestamp truncated to the minute, the shape of a CLOSED stamp.
        pub fn inactive_at(at: NaiveDateTime) -> Self {
            Self {
                active: false,
                date: at.date(),
                time: NaiveTime::from_hms_opt(at.hour(), at.minute(), 0),
            }
        }

        pub fn start(&self) -> NaiveDateTime {
            self.date.and_time(self.time.unwrap_or(NaiveTime::MIN))
        }
    }

    impl fmt::Display for Timestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let (open, close) = if self.active { ('<', '>') } else { ('[', ']') };
            write!(f, "{open}{}", self.date.format("%Y-%m-%d %a"))?;
            if let Some(time) = self.time {
                write!(f, " {}", time.format("%H:%M"))?;
            }
            write!(f, "{close}")
        }
    }

    /// What a state assignment did to the CLOSED stamp.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ClosedChange {
        Unchanged,
        Stamped,
        Cleared,
    }

    /// Derived counts over a node's descendants. Never stored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct NodeStats {
        pub total: usize,
        pub completed: usize,
        pub overdue: usize,
        /// Completed share of the descendants that carry a workflow state, 0..=100.
        pub completion_percentage: u8,
    }

    /* ------------------------------ Entities ------------------------------ */

    /// One heading and its subtree.
    ///
    /// Fields are crate-private so the invariants hold: children are always deeper than
    /// their parent, tags are non-empty and unique, and `closed` follows the completed
    /// classification of `state` unless auto-stamping is suppressed.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct OutlineNode {
        pub(crate) id: NodeId,
        pub(crate) depth: usize,
        pub(crate) state: Option<String>,
        pub(crate) priority: Option<Priority>,
        pub(crate) title: String,
        #[serde(default)]
        pub(crate) tags: IndexSet<String>,
        #[serde(default)]
        pub(crate) properties: IndexMap<String, String>,
        pub(crate) scheduled: Option<Timestamp>,
        pub(crate) deadline: Option<Timestamp>,
        pub(crate) closed: Option<Timestamp>,
        #[serde(default)]
        pub(crate) body: String,
        #[serde(default)]
        pub(crate) children: Vec<OutlineNode>,
        pub(crate) file_path: Option<PathBuf>,
        pub(crate) created: NaiveDateTime,
        pub(crate) last_modified: NaiveDateTime,

        /// Buffer line holding the heading itself.
        #[serde(skip)]
        pub(crate) line: Option<usize>,
        /// Last buffer line of this node's own section, children excluded.
        #[serde(skip)]
        pub(crate) last_line: Option<usize>,
        #[serde(skip)]
        pub(crate) planning_line: Option<usize>,
        /// `:PROPERTIES:` and `:END:` lines.
        #[serde(skip)]
        pub(crate) drawer: Option<(usize, usize)>,
        #[serde(skip)]
        pub(crate) suppress_auto_closed: bool,
    }

    impl OutlineNode {
        pub fn new(depth: usize, title: impl Into<String>) -> Self {
            let now = Local::now().naive_local();
            Self {
                id: NodeId::new(),
                depth: depth.max(1),
                state: None,
                priority: None,
                title: title.into().trim().to_string(),
                tags: IndexSet::new(),
                properties: IndexMap::new(),
                scheduled: None,
                deadline: None,
                closed: None,
                body: String::new(),
                children: vec![],
                file_path: None,
                created: now,
                last_modified: now,
                line: None,
                last_line: None,
                planning_line: None,
                drawer: None,
                suppress_auto_closed: false,
            }
        }

        pub fn id(&self) -> NodeId {
            self.id
        }

        pub fn depth(&self) -> usize {
            self.depth
        }

        pub fn state(&self) -> Option<&str> {
            self.state.as_deref()
        }

        pub fn priority(&self) -> Option<Priority> {
            self.priority
        }

        pub fn title(&self) -> &str {
            &self.title
        }

        pub fn tags(&self) -> &IndexSet<String> {
            &self.tags
        }

        pub fn properties(&self) -> &IndexMap<String, String> {
            &self.properties
        }

        pub fn property(&self, key: &str) -> Option<&str> {
            self.properties.get(key).map(String::as_str)
        }

        pub fn scheduled(&self) -> Option<Timestamp> {
            self.scheduled
        }

        pub fn deadline(&self) -> Option<Timestamp> {
            self.deadline
        }

        pub fn closed(&self) -> Option<Timestamp> {
            self.closed
        }

        pub fn body(&self) -> &str {
            &self.body
        }

        pub fn children(&self) -> &[OutlineNode] {
            &self.children
        }

        pub fn has_children(&self) -> bool {
            !self.children.is_empty()
        }

        pub fn file_path(&self) -> Option<&Path> {
            self.file_path.as_deref()
        }

        pub fn created(&self) -> NaiveDateTime {
            self.created
        }

        pub fn last_modified(&self) -> NaiveDateTime {
            self.last_modified
        }

        /// Buffer line of the heading, when the node came from a parse.
        pub fn line(&self) -> Option<usize> {
            self.line
        }

        fn touch(&mut self) {
            self.last_modified = Local::now().naive_local();
        }

        /* --------------------------- workflow state --------------------------- */

        /// Assigns the workflow state. Unless auto-stamping is suppressed, `closed` is
        /// stamped or cleared right away to match the new classification.
        pub fn set_state(
            &mut self,
            state: Option<String>,
            catalog: &StateCatalog,
            now: NaiveDateTime,
        ) -> ClosedChange {
            if self.state == state {
                return ClosedChange::Unchanged;
            }
            self.state = state;
            self.touch();
            if self.suppress_auto_closed {
                ClosedChange::Unchanged
            } else {
                self.reconcile_closed(catalog, now)
            }
        }

        /// Toggles the CLOSED auto-stamp performed by [`OutlineNode::set_state`].
        pub fn suppress_auto_closed(&mut self, suppress: bool) {
            self.suppress_auto_closed = suppress;
        }

        pub fn is_auto_closed_suppressed(&self) -> bool {
            self.suppress_auto_closed
        }

        /// Brings `closed` in line with the completed classification of the current state.
        pub fn reconcile_closed(&mut self, catalog: &StateCatalog, now: NaiveDateTime) -> ClosedChange {
            match (self.is_completed(catalog), self.closed) {
                (true, None) => {
                    self.closed = Some(Timestamp::inactive_at(now));
                    ClosedChange::Stamped
                }
                (false, Some(_)) => {
                    self.closed = None;
                    ClosedChange::Cleared
                }
                _ => ClosedChange::Unchanged,
            }
        }

        pub fn set_closed(&mut self, closed: Option<Timestamp>) {
            self.closed = closed;
        }

        pub fn is_completed(&self, catalog: &StateCatalog) -> bool {
            self.state.as_deref().is_some_and(|s| catalog.is_completed(s))
        }

        pub fn requires_action(&self, catalog: &StateCatalog) -> bool {
            self.state.as_deref().is_some_and(|s| catalog.requires_action(s))
        }

        /// A workflow item that still has to be finished.
        pub fn is_actionable(&self, catalog: &StateCatalog) -> bool {
            self.state.is_some() && !self.is_completed(catalog)
        }

        /// A dated heading that is not a workflow item.
        pub fn is_calendar_event(&self) -> bool {
            self.state.is_none() && (self.scheduled.is_some() || self.deadline.is_some())
        }

        pub fn is_overdue(&self, catalog: &StateCatalog, today: NaiveDate) -> bool {
            !self.is_completed(catalog) && self.deadline.is_some_and(|d| d.date < today)
        }

        /* ------------------------------ fields ------------------------------ */

        pub fn set_priority(&mut self, priority: Option<Priority>) {
            if self.priority != priority {
                self.priority = priority;
                self.touch();
            }
        }

        pub fn cycle_priority(&mut self) -> Option<Priority> {
            self.set_priority(Priority::cycle(self.priority));
            self.priority
        }

        pub fn set_title(&mut self, title: impl Into<String>) {
            let title = title.into().trim().to_string();
            if self.title != title {
                self.title = title;
                self.touch();
            }
        }

        pub fn set_body(&mut self, body: impl Into<String>) {
            self.body = body.into();
            self.touch();
        }

        pub fn set_scheduled(&mut self, scheduled: Option<Timestamp>) {
            if self.scheduled != scheduled {
                self.scheduled = scheduled;
                self.touch();
            }
        }

        pub fn set_deadline(&mut self, deadline: Option<Timestamp>) {
            if self.deadline != deadline {
                self.deadline = deadline;
                self.touch();
            }
        }

        /// Adds a tag at the end of the tag list. Returns `false` when it was already present.
        pub fn add_tag(&mut self, tag: &str) -> Result<bool, DomainError> {
            let tag = tag.trim();
            if tag.is_empty() || !tag.chars().all(crate::headline::is_tag_char) {
                return Err(DomainError::InvalidTag(tag.to_string()));
            }
            let inserted = self.tags.insert(tag.to_string());
            if inserted {
                self.touch();
            }
            Ok(inserted)
        }

        pub fn remove_tag(&mut self, tag: &str) -> bool {
            let removed = self.tags.shift_remove(tag);
            if removed {
                self.touch();
            }
            removed
        }

        pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
            self.properties.insert(key.into(), value.into());
            self.touch();
        }

        pub fn remove_property(&mut self, key: &str) -> Option<String> {
            let removed = self.properties.shift_remove(key);
            if removed.is_some() {
                self.touch();
            }
            removed
        }

        /* ------------------------------ subtree ------------------------------ */

        /// Appends `child`, re-depthing its whole subtree to sit one level below `self`.
        pub fn add_child(&mut self, mut child: OutlineNode) -> NodeId {
            child.set_depth(self.depth + 1);
            child.set_file_path(self.file_path.clone());
            let id = child.id;
            self.children.push(child);
            self.touch();
            id
        }

        /// Detaches a direct child.
        pub fn remove_child(&mut self, id: NodeId) -> Option<OutlineNode> {
            let pos = self.children.iter().position(|c| c.id == id)?;
            self.touch();
            Some(self.children.remove(pos))
        }

        pub(crate) fn remove_descendant(&mut self, id: NodeId) -> Option<OutlineNode> {
            if let Some(found) = self.remove_child(id) {
                return Some(found);
            }
            self.children
                .iter_mut()
                .find_map(|c| c.remove_descendant(id))
        }

        /// Moves the node to `depth`, keeping the relative depth of every descendant.
        pub(crate) fn set_depth(&mut self, depth: usize) {
            let delta = depth.max(1) as isize - self.depth as isize;
            self.shift_depth(delta);
        }

        fn shift_depth(&mut self, delta: isize) {
            self.depth = (self.depth as isize + delta).max(1) as usize;
            for child in &mut self.children {
                child.shift_depth(delta);
            }
        }

        pub(crate) fn set_file_path(&mut self, path: Option<PathBuf>) {
            for child in &mut self.children {
                child.set_file_path(path.clone());
            }
            self.file_path = path;
        }

        /// Depth-first walk including `self`.
        pub fn walk<'a>(&'a self, out: &mut Vec<&'a OutlineNode>) {
            out.push(self);
            for c in &self.children {
                c.walk(out);
            }
        }

        pub fn descendants(&self) -> Vec<&OutlineNode> {
            let mut out = Vec::new();
            for c in &self.children {
                c.walk(&mut out);
            }
            out
        }

        pub fn find(&self, id: NodeId) -> Option<&OutlineNode> {
            if self.id == id {
                return Some(self);
            }
            self.children.iter().find_map(|c| c.find(id))
        }

        pub fn find_mut(&mut self, id: NodeId) -> Option<&mut OutlineNode> {
            if self.id == id {
                return Some(self);
            }
            self.children.iter_mut().find_map(|c| c.find_mut(id))
        }

        /// Last buffer line owned by this node or any descendant.
        pub(crate) fn subtree_last_line(&self) -> Option<usize> {
            let mut nodes = Vec::new();
            self.walk(&mut nodes);
            nodes.iter().filter_map(|n| n.last_line.or(n.line)).max()
        }

        pub fn incomplete_items(&self, catalog: &StateCatalog) -> Vec<&OutlineNode> {
            let mut all = Vec::new();
            self.walk(&mut all);
            all.into_iter()
                .filter(|n| n.is_actionable(catalog))
                .collect()
        }

        pub fn completion_percentage(&self, catalog: &StateCatalog) -> u8 {
            let tracked: Vec<_> = self
                .descendants()
                .into_iter()
                .filter(|n| n.state.is_some())
                .collect();
            if tracked.is_empty() {
                return 0;
            }
            let done = tracked.iter().filter(|n| n.is_completed(catalog)).count();
            (done * 100 / tracked.len()) as u8
        }

        pub fn stats(&self, catalog: &StateCatalog, today: NaiveDate) -> NodeStats {
            let descendants = self.descendants();
            NodeStats {
                total: descendants.len(),
                completed: descendants.iter().filter(|n| n.is_completed(catalog)).count(),
                overdue: descendants
                    .iter()
                    .filter(|n| n.is_overdue(catalog, today))
                    .count(),
                completion_percentage: self.completion_percentage(catalog),
            }
        }

        /* ---------------------------- line bookkeeping ---------------------------- */

        pub(crate) fn shift_lines_inserted(&mut self, at: usize, count: usize) {
            let bump = move |l: usize| if l >= at { l + count } else { l };
            self.line = self.line.map(bump);
            self.last_line = self.last_line.map(bump);
            self.planning_line = self.planning_line.map(bump);
            self.drawer = self.drawer.map(|(s, e)| (bump(s), bump(e)));
            for child in &mut self.children {
                child.shift_lines_inserted(at, count);
            }
        }

        pub(crate) fn shift_lines_removed(&mut self, start: usize, count: usize) {
            let end = start + count;
            let keep = move |l: usize| {
                if l >= end {
                    Some(l - count)
                } else if l < start {
                    Some(l)
                } else {
                    None
                }
            };
            self.line = self.line.and_then(keep);
            self.last_line = self
                .last_line
                .map(|l| keep(l).unwrap_or(start.saturating_sub(1)));
            if let (Some(line), Some(last)) = (self.line, self.last_line) {
                if last < line {
                    self.last_line = Some(line);
                }
            }
            self.planning_line = self.planning_line.and_then(keep);
            self.drawer = self.drawer.and_then(|(s, e)| Some((keep(s)?, keep(e)?)));
            for child in &mut self.children {
                child.shift_lines_removed(start, count);
            }
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Top-level headings of one document.
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    pub struct Forest {
        pub path: Option<PathBuf>,
        /// `#+KEY: value` lines ahead of the first heading.
        #[serde(default)]
        pub settings: IndexMap<String, String>,
        #[serde(default)]
        pub roots: Vec<OutlineNode>,
    }

    impl Forest {
        pub fn new(path: Option<PathBuf>) -> Self {
            Self {
                path,
                settings: IndexMap::new(),
                roots: vec![],
            }
        }

        pub fn is_empty(&self) -> bool {
            self.roots.is_empty()
        }

        /// Number of nodes at every depth.
        pub fn len(&self) -> usize {
            self.nodes().len()
        }

        /// Every node in document order.
        pub fn nodes(&self) -> Vec<&OutlineNode> {
            let mut out = Vec::new();
            for r in &self.roots {
                r.walk(&mut out);
            }
            out
        }

        pub fn find(&self, id: NodeId) -> Option<&OutlineNode> {
            self.roots.iter().find_map(|r| r.find(id))
        }

        pub fn find_mut(&mut self, id: NodeId) -> Option<&mut OutlineNode> {
            self.roots.iter_mut().find_map(|r| r.find_mut(id))
        }

        pub fn parent_id(&self, id: NodeId) -> Option<NodeId> {
            self.nodes()
                .into_iter()
                .find(|n| n.children.iter().any(|c| c.id == id))
                .map(|n| n.id)
        }

        /// The node whose heading sits on `line`.
        pub fn node_at_line(&self, line: usize) -> Option<&OutlineNode> {
            self.nodes().into_iter().find(|n| n.line == Some(line))
        }

        /// The node whose own section (heading through body) covers `line`.
        pub fn node_containing_line(&self, line: usize) -> Option<&OutlineNode> {
            self.nodes().into_iter().find(|n| {
                n.line.is_some_and(|start| start <= line)
                    && n.last_line.or(n.line).is_some_and(|end| line <= end)
            })
        }

        pub fn push_root(&mut self, mut node: OutlineNode) -> NodeId {
            node.set_file_path(self.path.clone());
            let id = node.id;
            self.roots.push(node);
            id
        }

        /// Detaches a node (and its subtree) from wherever it sits.
        pub fn remove(&mut self, id: NodeId) -> Option<OutlineNode> {
            if let Some(pos) = self.roots.iter().position(|r| r.id == id) {
                return Some(self.roots.remove(pos));
            }
            self.roots.iter_mut().find_map(|r| r.remove_descendant(id))
        }

        /// Updates the document path on the forest and every node. Pure metadata.
        pub fn set_path(&mut self, path: Option<PathBuf>) {
            for root in &mut self.roots {
                root.set_file_path(path.clone());
            }
            self.path = path;
        }

        pub fn all_tags(&self) -> Vec<String> {
            self.nodes()
                .into_iter()
                .flat_map(|n| n.tags.iter().cloned())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        }

        /// Case-insensitive match over title, body and tags.
        pub fn search(&self, query: &str) -> Vec<&OutlineNode> {
            let needle = query.to_lowercase();
            self.nodes()
                .into_iter()
                .filter(|n| {
                    n.title.to_lowercase().contains(&needle)
                        || n.body.to_lowercase().contains(&needle)
                        || n.tags.iter().any(|t| t.to_lowercase().contains(&needle))
                })
                .collect()
        }

        pub fn items_with_state(&self, state: Option<&str>) -> Vec<&OutlineNode> {
            self.nodes()
                .into_iter()
                .filter(|n| n.state.as_deref() == state)
                .collect()
        }

        pub fn items_with_tag(&self, tag: &str) -> Vec<&OutlineNode> {
            self.nodes()
                .into_iter()
                .filter(|n| n.tags.contains(tag))
                .collect()
        }

        pub fn overdue_items(&self, catalog: &StateCatalog, today: NaiveDate) -> Vec<&OutlineNode> {
            self.nodes()
                .into_iter()
                .filter(|n| n.is_overdue(catalog, today))
                .collect()
        }

        /// `closed` is set exactly on completed nodes, ignoring nodes inside a suppressed window.
        pub fn completion_invariant_holds(&self, catalog: &StateCatalog) -> bool {
            self.nodes()
                .into_iter()
                .filter(|n| !n.suppress_auto_closed)
                .all(|n| n.closed.is_some() == n.is_completed(catalog))
        }

        pub(crate) fn subtree_last_line(&self, id: NodeId) -> Option<usize> {
            self.find(id).and_then(OutlineNode::subtree_last_line)
        }

        pub(crate) fn shift_lines_inserted(&mut self, at: usize, count: usize) {
            for root in &mut self.roots {
                root.shift_lines_inserted(at, count);
            }
        }

        pub(crate) fn shift_lines_removed(&mut self, start: usize, count: usize) {
            for root in &mut self.roots {
                root.shift_lines_removed(start, count);
            }
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error, PartialEq, Eq)]
    pub enum DomainError {
        #[error("no node with id {0}")]
        NodeNotFound(NodeId),
        #[error("invalid tag {0:?}: tags are non-empty runs of letters, digits and _@#%-+")]
        InvalidTag(String),
        #[error("node {0} is already at depth 1 and cannot be promoted")]
        CannotPromote(NodeId),
        #[error("invalid property key {0:?}")]
        InvalidPropertyKey(String),
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::catalog::StateCatalog;
        use chrono::NaiveDate;

        fn catalog() -> StateCatalog {
            StateCatalog::from_names(&["TODO", "STARTED"], &["WAITING"], &["DONE"]).unwrap()
        }

        fn at(h: u32, m: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2025, 3, 14)
                .unwrap()
                .and_hms_opt(h, m, 42)
                .unwrap()
        }

        #[test]
        fn set_state_stamps_and_clears_closed() {
            let cat = catalog();
            let mut node = OutlineNode::new(1, "Buy milk");
            assert_eq!(node.set_state(Some("TODO".into()), &cat, at(9, 0)), ClosedChange::Unchanged);
            assert!(node.closed().is_none());

            assert_eq!(node.set_state(Some("DONE".into()), &cat, at(9, 5)), ClosedChange::Stamped);
            let closed = node.closed().expect("stamped");
            assert!(!closed.active);
            assert_eq!(closed.time, NaiveTime::from_hms_opt(9, 5, 0));

            assert_eq!(node.set_state(None, &cat, at(9, 6)), ClosedChange::Cleared);
            assert!(node.closed().is_none());
        }

        #[test]
        fn suppressed_assignment_leaves_closed_alone() {
            let cat = catalog();
            let mut node = OutlineNode::new(1, "Write report");
            node.suppress_auto_closed(true);
            node.set_state(Some("DONE".into()), &cat, at(10, 0));
            assert!(node.closed().is_none());
            node.suppress_auto_closed(false);
            assert_eq!(node.reconcile_closed(&cat, at(10, 1)), ClosedChange::Stamped);
        }

        #[test]
        fn tags_keep_order_and_reject_bad_input() {
            let mut node = OutlineNode::new(1, "x");
            assert_eq!(node.add_tag("work"), Ok(true));
            assert_eq!(node.add_tag("home"), Ok(true));
            assert_eq!(node.add_tag("work"), Ok(false));
            assert!(matches!(node.add_tag(""), Err(DomainError::InvalidTag(_))));
            assert!(matches!(node.add_tag("a:b"), Err(DomainError::InvalidTag(_))));
            assert_eq!(node.tags().iter().collect::<Vec<_>>(), vec!["work", "home"]);
            assert!(node.remove_tag("work"));
            assert!(!node.remove_tag("work"));
        }

        #[test]
        fn add_child_redepths_the_whole_subtree() {
            let mut parent = OutlineNode::new(2, "parent");
            parent.set_file_path(Some(PathBuf::from("notes.org")));
            let mut child = OutlineNode::new(1, "child");
            child.add_child(OutlineNode::new(1, "grandchild"));
            let id = parent.add_child(child);

            let child = parent.find(id).unwrap();
            assert_eq!(child.depth(), 3);
            assert_eq!(child.children()[0].depth(), 4);
            assert_eq!(child.children()[0].file_path(), Some(Path::new("notes.org")));

            assert!(parent.remove_child(id).is_some());
            assert!(!parent.has_children());
        }

        #[test]
        fn priority_cycles_through_all_four_values() {
            let mut node = OutlineNode::new(1, "x");
            assert_eq!(node.cycle_priority(), Some(Priority::A));
            assert_eq!(node.cycle_priority(), Some(Priority::B));
            assert_eq!(node.cycle_priority(), Some(Priority::C));
            assert_eq!(node.cycle_priority(), None);
        }

        #[test]
        fn stats_are_derived_from_descendants() {
            let cat = catalog();
            let today = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
            let mut project = OutlineNode::new(1, "project");
            let mut a = OutlineNode::new(2, "a");
            a.set_state(Some("DONE".into()), &cat, at(8, 0));
            let mut b = OutlineNode::new(2, "b");
            b.set_state(Some("TODO".into()), &cat, at(8, 0));
            b.set_deadline(Some(Timestamp::active(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap())));
            let c = OutlineNode::new(2, "plain note");
            project.add_child(a);
            project.add_child(b);
            project.add_child(c);

            let stats = project.stats(&cat, today);
            assert_eq!(stats.total, 3);
            assert_eq!(stats.completed, 1);
            assert_eq!(stats.overdue, 1);
            assert_eq!(stats.completion_percentage, 50);
            assert_eq!(project.incomplete_items(&cat).len(), 1);
        }

        #[test]
        fn timestamps_render_in_outline_syntax() {
            let date = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
            assert_eq!(Timestamp::active(date).to_string(), "<2025-01-05 Sun>");
            let closed = Timestamp::inactive_at(date.and_hms_opt(14, 30, 59).unwrap());
            assert_eq!(closed.to_string(), "[2025-01-05 Sun 14:30]");
        }
    }
}

pub mod catalog {
    use serde::{Deserialize, Serialize};
    use std::{
        collections::HashMap,
        sync::{
            Arc, Mutex, PoisonError, RwLock,
            mpsc::{self, Receiver, Sender},
        },
    };
    use tracing::debug;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum StateClass {
        ActionRequired,
        NoAction,
        Completed,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StateDefinition {
        pub name: String,
        pub class: StateClass,
        #[serde(default)]
        pub color: Option<String>,
        #[serde(default)]
        pub description: Option<String>,
    }

    impl StateDefinition {
        pub fn new(name: impl Into<String>, class: StateClass) -> Self {
            Self {
                name: name.into(),
                class,
                color: None,
                description: None,
            }
        }

        pub fn with_color(mut self, color: impl Into<String>) -> Self {
            self.color = Some(color.into());
            self
        }

        pub fn with_description(mut self, description: impl Into<String>) -> Self {
            self.description = Some(description.into());
            self
        }

        pub fn requires_action(&self) -> bool {
            self.class == StateClass::ActionRequired
        }

        pub fn is_completed(&self) -> bool {
            self.class == StateClass::Completed
        }
    }

    #[derive(Debug, thiserror::Error, PartialEq, Eq)]
    pub enum CatalogError {
        #[error("state {0:?} is declared more than once")]
        Duplicate(String),
        #[error("state names must be non-empty and contain no whitespace, got {0:?}")]
        InvalidName(String),
    }

    /// Ordered workflow states. The cycle order is every action-required state, then the
    /// no-action states, then the completed ones, each group in declaration order.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct StateCatalog {
        states: Vec<StateDefinition>,
        #[serde(skip)]
        index: HashMap<String, usize>,
    }

    impl StateCatalog {
        pub fn new(definitions: impl IntoIterator<Item = StateDefinition>) -> Result<Self, CatalogError> {
            let mut grouped: Vec<StateDefinition> = definitions.into_iter().collect();
            // stable: keeps declaration order inside each class
            grouped.sort_by_key(|d| match d.class {
                StateClass::ActionRequired => 0,
                StateClass::NoAction => 1,
                StateClass::Completed => 2,
            });
            let mut index = HashMap::with_capacity(grouped.len());
            for (i, def) in grouped.iter().enumerate() {
                if def.name.is_empty() || def.name.chars().any(char::is_whitespace) {
                    return Err(CatalogError::InvalidName(def.name.clone()));
                }
                if index.insert(def.name.clone(), i).is_some() {
                    return Err(CatalogError::Duplicate(def.name.clone()));
                }
            }
            Ok(Self {
                states: grouped,
                index,
            })
        }

        pub fn from_names(
            action: &[&str],
            no_action: &[&str],
            completed: &[&str],
        ) -> Result<Self, CatalogError> {
            let defs = action
                .iter()
                .map(|n| StateDefinition::new(*n, StateClass::ActionRequired))
                .chain(no_action.iter().map(|n| StateDefinition::new(*n, StateClass::NoAction)))
                .chain(completed.iter().map(|n| StateDefinition::new(*n, StateClass::Completed)));
            Self::new(defs)
        }

        /// Builds a catalog from a `#+TODO:` keyword line: words before `|` are
        /// action-required, words after it are completed. Without a `|` the last word is
        /// the completed one. `(x)` shortcut suffixes are ignored.
        pub fn from_todo_keywords(keywords: &[String]) -> Result<Self, CatalogError> {
            let words: Vec<&str> = keywords
                .iter()
                .map(|w| w.split('(').next().unwrap_or(w.as_str()))
                .filter(|w| !w.is_empty())
                .collect();
            let (open, done): (Vec<&str>, Vec<&str>) = match words.iter().position(|w| *w == "|") {
                Some(bar) => (words[..bar].to_vec(), words[bar + 1..].to_vec()),
                None => match words.split_last() {
                    Some((last, rest)) if !rest.is_empty() => (rest.to_vec(), vec![*last]),
                    _ => (words.clone(), vec![]),
                },
            };
            Self::from_names(&open, &[], &done)
        }

        pub fn empty() -> Self {
            Self {
                states: vec![],
                index: HashMap::new(),
            }
        }

        pub fn len(&self) -> usize {
            self.states.len()
        }

        pub fn is_empty(&self) -> bool {
            self.states.is_empty()
        }

        pub fn iter(&self) -> impl Iterator<Item = &StateDefinition> {
            self.states.iter()
        }

        pub fn names(&self) -> impl Iterator<Item = &str> {
            self.states.iter().map(|d| d.name.as_str())
        }

        pub fn get(&self, name: &str) -> Option<&StateDefinition> {
            self.index.get(name).map(|&i| &self.states[i])
        }

        pub fn contains(&self, name: &str) -> bool {
            self.index.contains_key(name)
        }

        pub fn class_of(&self, name: &str) -> Option<StateClass> {
            self.get(name).map(|d| d.class)
        }

        pub fn is_completed(&self, name: &str) -> bool {
            self.get(name).is_some_and(StateDefinition::is_completed)
        }

        /// Unknown states never require action.
        pub fn requires_action(&self, name: &str) -> bool {
            self.get(name).is_some_and(StateDefinition::requires_action)
        }

        /// The successor in cycle order. No state, or a state this catalog does not know,
        /// moves to the first state; the last state moves to no state.
        pub fn next_state(&self, current: Option<&str>) -> Option<&StateDefinition> {
            match current.filter(|s| !s.is_empty()).and_then(|s| self.index.get(s)) {
                None => self.states.first(),
                Some(&i) => self.states.get(i + 1),
            }
        }
    }

    impl Default for StateCatalog {
        fn default() -> Self {
            let defs = [
                StateDefinition::new("TODO", StateClass::ActionRequired).with_color("#FF6B6B"),
                StateDefinition::new("NEXT", StateClass::ActionRequired).with_color("#4ECDC4"),
                StateDefinition::new("STARTED", StateClass::ActionRequired).with_color("#45B7D1"),
                StateDefinition::new("PROJECT", StateClass::ActionRequired).with_color("#96CEB4"),
                StateDefinition::new("DELEGATED", StateClass::NoAction).with_color("#FECA57"),
                StateDefinition::new("SOMEDAY", StateClass::NoAction).with_color("#A29BFE"),
                StateDefinition::new("WAITING", StateClass::NoAction).with_color("#FDCB6E"),
                StateDefinition::new("DEFERRED", StateClass::NoAction).with_color("#B2BEC3"),
                StateDefinition::new("DONE", StateClass::Completed).with_color("#00B894"),
                StateDefinition::new("CANCELLED", StateClass::Completed).with_color("#636E72"),
            ];
            Self::new(defs).unwrap_or_else(|_| Self::empty())
        }
    }

    /* ------------------------------ provider ------------------------------ */

    /// A catalog together with the version it was published under.
    #[derive(Debug, Clone)]
    pub struct CatalogSnapshot {
        pub version: u64,
        pub catalog: Arc<StateCatalog>,
    }

    /// Publishes catalog replacements to subscribed coordinators.
    ///
    /// Readers hold an `Arc` to an immutable snapshot, so a replacement never changes
    /// a catalog somebody is already using.
    #[derive(Debug)]
    pub struct CatalogProvider {
        current: RwLock<CatalogSnapshot>,
        subscribers: Mutex<Vec<Sender<CatalogSnapshot>>>,
    }

    impl CatalogProvider {
        pub fn new(catalog: StateCatalog) -> Self {
            Self {
                current: RwLock::new(CatalogSnapshot {
                    version: 1,
                    catalog: Arc::new(catalog),
                }),
                subscribers: Mutex::new(vec![]),
            }
        }

        pub fn snapshot(&self) -> CatalogSnapshot {
            self.current
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn subscribe(&self) -> Receiver<CatalogSnapshot> {
            let (tx, rx) = mpsc::channel();
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(tx);
            rx
        }

        /// Installs a new catalog and notifies subscribers. Returns the new version.
        pub fn replace(&self, catalog: StateCatalog) -> u64 {
            let snapshot = {
                let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
                current.version += 1;
                current.catalog = Arc::new(catalog);
                current.clone()
            };
            let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            subscribers.retain(|tx| tx.send(snapshot.clone()).is_ok());
            debug!(
                version = snapshot.version,
                subscribers = subscribers.len(),
                "published state catalog"
            );
            snapshot.version
        }
    }

    impl Default for CatalogProvider {
        fn default() -> Self {
            Self::new(StateCatalog::default())
        }
    }

}

pub mod headline {
    //! Line codec for headings, plus the small grammars that live directly under a
    //! heading: planning lines, property lines and timestamps.
    //!
    //! `decode(encode(decode(line))) == decode(line)` for every heading line.

    use crate::catalog::StateCatalog;
    use crate::core::{Priority, Timestamp};
    use chrono::{NaiveDate, NaiveTime};
    use indexmap::IndexSet;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till, take_till1, take_while1, take_while_m_n},
        character::complete::{anychar, char, space0, space1},
        combinator::{eof, map_opt, map_res, opt},
        error::VerboseError,
        sequence::{delimited, preceded, terminated, tuple},
    };
    use serde::{Deserialize, Serialize};

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Everything a heading line carries.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HeadlineFields {
        pub depth: usize,
        pub state: Option<String>,
        pub priority: Option<Priority>,
        pub title: String,
        pub tags: IndexSet<String>,
        pub closed: Option<Timestamp>,
    }

    impl HeadlineFields {
        pub fn new(depth: usize, title: impl Into<String>) -> Self {
            Self {
                depth: depth.max(1),
                state: None,
                priority: None,
                title: title.into(),
                tags: IndexSet::new(),
                closed: None,
            }
        }
    }

    pub fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || matches!(c, '_' | '@' | '#' | '%' | '-' | '+')
    }

    pub fn is_heading(line: &str) -> bool {
        markers(line).is_ok()
    }

    /// Depth of a heading line, `None` for any other line.
    pub fn depth_of(line: &str) -> Option<usize> {
        markers(line).ok().map(|(_, depth)| depth)
    }

    /// Decodes one heading line. A leading word counts as the workflow state only when
    /// `catalog` knows it; anything else stays in the title.
    pub fn decode(line: &str, catalog: &StateCatalog) -> Option<HeadlineFields> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (rest, depth) = markers(line).ok()?;

        let (text, closed) = strip_closed(rest);
        let text = text.trim_start();

        let (text, state) = match keyword(text) {
            Ok((after, word)) if catalog.contains(word) => (after, Some(word.to_string())),
            _ => (text, None),
        };
        let (text, priority) = match priority_cookie(text) {
            Ok((after, p)) => (after, Some(p)),
            Err(_) => (text, None),
        };
        let (title, tags) = split_tags(text);

        Some(HeadlineFields {
            depth,
            state,
            priority,
            title: title.trim().to_string(),
            tags,
            closed,
        })
    }

    /// Canonical heading line: markers, then state, priority, title, CLOSED stamp and
    /// tag block, single-space separated.
    pub fn encode(fields: &HeadlineFields) -> String {
        let mut buf = "*".repeat(fields.depth.max(1));
        buf.push(' ');

        let mut parts: Vec<String> = Vec::new();
        if let Some(state) = &fields.state {
            parts.push(state.clone());
        }
        if let Some(p) = fields.priority {
            parts.push(format!("[#{}]", p.as_char()));
        }
        let title = fields.title.trim();
        if !title.is_empty() {
            parts.push(title.to_string());
        }
        if let Some(ts) = &fields.closed {
            parts.push(format!("CLOSED: {ts}"));
        }
        if !fields.tags.is_empty() {
            let tags: Vec<&str> = fields.tags.iter().map(String::as_str).collect();
            parts.push(format!(":{}:", tags.join(":")));
        }
        buf.push_str(&parts.join(" "));
        buf
    }

    /// Byte column where the title starts in `encode(fields)`.
    pub fn title_column(fields: &HeadlineFields) -> usize {
        let mut col = fields.depth.max(1) + 1;
        if let Some(state) = &fields.state {
            col += state.len() + 1;
        }
        if fields.priority.is_some() {
            col += "[#A] ".len();
        }
        col
    }

    /// Decode, edit, re-encode. `None` when `line` is not a heading.
    pub fn rewrite(
        line: &str,
        catalog: &StateCatalog,
        edit: impl FnOnce(&mut HeadlineFields),
    ) -> Option<String> {
        let mut fields = decode(line, catalog)?;
        edit(&mut fields);
        Some(encode(&fields))
    }

    fn markers(i: &str) -> PResult<'_, usize> {
        let (i, stars) = take_while1(|c: char| c == '*')(i)?;
        let (i, _) = space1(i)?;
        Ok((i, stars.len()))
    }

    fn keyword(i: &str) -> PResult<'_, &str> {
        terminated(take_till1(|c: char| c == ' ' || c == '\t'), alt((space1, eof)))(i)
    }

    fn priority_cookie(i: &str) -> PResult<'_, Priority> {
        terminated(
            delimited(tag("[#"), map_opt(anychar, Priority::from_char), char(']')),
            alt((space1, eof)),
        )(i)
    }

    fn closed_cookie(i: &str) -> PResult<'_, Timestamp> {
        preceded(tuple((tag("CLOSED:"), space0)), timestamp)(i)
    }

    /// Removes every `CLOSED: <timestamp>` cookie, wherever it sits. Runs until no cookie
    /// is left, since removing one can butt two fragments into a new one. The first
    /// stamp found wins.
    fn strip_closed(text: &str) -> (String, Option<Timestamp>) {
        let mut current = text.to_string();
        let mut closed = None;
        loop {
            let (next, found) = strip_closed_once(&current);
            if found.is_none() {
                return (current, closed);
            }
            closed = closed.or(found);
            current = next;
        }
    }

    fn strip_closed_once(text: &str) -> (String, Option<Timestamp>) {
        let mut out = String::with_capacity(text.len());
        let mut first = None;
        let mut rest = text;
        while let Some(pos) = rest.find("CLOSED:") {
            let at_boundary = pos == 0 && (out.is_empty() || out.ends_with(char::is_whitespace))
                || rest[..pos].ends_with(char::is_whitespace);
            match closed_cookie(&rest[pos..]) {
                Ok((after, ts)) if at_boundary => {
                    out.push_str(rest[..pos].trim_end());
                    if !out.is_empty() && !after.is_empty() && !after.starts_with(char::is_whitespace) {
                        out.push(' ');
                    }
                    first = first.or(Some(ts));
                    rest = after;
                }
                _ => {
                    let skip = pos + "CLOSED:".len();
                    out.push_str(&rest[..skip]);
                    rest = &rest[skip..];
                }
            }
        }
        out.push_str(rest);
        (out, first)
    }

    /// Splits a trailing `:a:b:` block off the text.
    fn split_tags(text: &str) -> (&str, IndexSet<String>) {
        let trimmed = text.trim_end();
        let start = trimmed.rfind([' ', '\t']).map_or(0, |p| p + 1);
        let candidate = &trimmed[start..];
        if candidate.len() >= 3 && candidate.starts_with(':') && candidate.ends_with(':') {
            let tags: IndexSet<String> = candidate[1..candidate.len() - 1]
                .split(':')
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            if !tags.is_empty() && tags.iter().all(|t| t.chars().all(is_tag_char)) {
                return (&trimmed[..start], tags);
            }
        }
        (trimmed, IndexSet::new())
    }

    /* --------------------------- Planning & Drawers --------------------------- */

    /// `SCHEDULED:` / `DEADLINE:` / `CLOSED:` line directly under a heading.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Planning {
        pub scheduled: Option<Timestamp>,
        pub deadline: Option<Timestamp>,
        pub closed: Option<Timestamp>,
    }

    impl Planning {
        pub fn is_empty(&self) -> bool {
            self.scheduled.is_none() && self.deadline.is_none() && self.closed.is_none()
        }
    }

    /// A line made only of planning keywords and their timestamps.
    pub fn decode_planning(line: &str) -> Option<Planning> {
        // e.g.: SCHEDULED: <2025-11-15 Sat> DEADLINE: <...>  CLOSED: [2025-11-15 Sat 14:10]
        let mut rest = line.trim_end_matches(['\r', '\n']);
        let mut p = Planning::default();
        let mut matched = false;

        while !rest.trim().is_empty() {
            if let Ok((r, ts)) = preceded_ws(tag("SCHEDULED:"), timestamp)(rest) {
                p.scheduled = Some(ts);
                rest = r;
                matched = true;
                continue;
            }
            if let Ok((r, ts)) = preceded_ws(tag("DEADLINE:"), timestamp)(rest) {
                p.deadline = Some(ts);
                rest = r;
                matched = true;
                continue;
            }
            if let Ok((r, ts)) = preceded_ws(tag("CLOSED:"), timestamp)(rest) {
                p.closed = Some(ts);
                rest = r;
                matched = true;
                continue;
            }
            return None;
        }

        matched.then_some(p)
    }

    /// Renders a planning line behind `indent`; `None` when there is nothing to plan.
    pub fn encode_planning(p: &Planning, indent: &str) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(ts) = p.scheduled {
            parts.push(format!("SCHEDULED: {ts}"));
        }
        if let Some(ts) = p.deadline {
            parts.push(format!("DEADLINE: {ts}"));
        }
        if let Some(ts) = p.closed {
            parts.push(format!("CLOSED: {ts}"));
        }
        (!parts.is_empty()).then(|| format!("{indent}{}", parts.join(" ")))
    }

    fn preceded_ws<'a, F, O>(
        prefix: F,
        inner: impl Fn(&'a str) -> PResult<'a, O>,
    ) -> impl Fn(&'a str) -> PResult<'a, O>
    where
        F: Fn(&'a str) -> PResult<'a, &'a str>,
    {
        move |i: &'a str| {
            let (i, _) = space0(i)?;
            let (i, _) = prefix(i)?;
            let (i, _) = space0(i)?;
            inner(i)
        }
    }

    pub fn is_drawer_start(line: &str) -> bool {
        line.trim().eq_ignore_ascii_case(":PROPERTIES:")
    }

    pub fn is_drawer_end(line: &str) -> bool {
        line.trim().eq_ignore_ascii_case(":END:")
    }

    /// `:KEY: value` inside a property drawer.
    pub fn decode_property(line: &str) -> Option<(String, String)> {
        let (value, key) = property_key(line.trim_end_matches(['\r', '\n'])).ok()?;
        Some((key.to_string(), value.trim().to_string()))
    }

    pub fn encode_property(key: &str, value: &str) -> String {
        format!(":{key}: {value}").trim_end().to_string()
    }

    fn property_key(i: &str) -> PResult<'_, &str> {
        let (i, _) = space0(i)?;
        let (i, key) = delimited(
            char(':'),
            take_till1(|c: char| c == ':' || c.is_whitespace()),
            char(':'),
        )(i)?;
        let (i, _) = space0(i)?;
        Ok((i, key))
    }

    /* ----------------------------- Timestamps ----------------------------- */

    pub fn parse_timestamp(text: &str) -> Option<Timestamp> {
        timestamp(text.trim()).ok().map(|(_, ts)| ts)
    }

    pub(crate) fn timestamp(i: &str) -> PResult<'_, Timestamp> {
        // Active: <YYYY-MM-DD [Day] [HH:MM]>
        // Inactive: [YYYY-MM-DD [Day] [HH:MM]]
        let (i, open) = alt((char('<'), char('[')))(i)?;
        let close = if open == '<' { '>' } else { ']' };
        let (i, date) = date(i)?;
        let (i, _) = opt(preceded(space1, day_name))(i)?;
        let (i, time) = opt(preceded(space1, time))(i)?;
        let (i, _) = opt(preceded(space1, day_name))(i)?;
        // repeaters and warning delays are accepted and dropped
        let (i, _) = take_till(move |c: char| c == close || c == '\n')(i)?;
        let (i, _) = char(close)(i)?;
        Ok((
            i,
            Timestamp {
                active: open == '<',
                date,
                time,
            },
        ))
    }

    fn day_name(i: &str) -> PResult<'_, &str> {
        take_while1(|c: char| c.is_alphabetic())(i)
    }

    fn number<'a>(min: usize, max: usize) -> impl FnMut(&'a str) -> PResult<'a, u32> {
        map_res(take_while_m_n(min, max, |c: char| c.is_ascii_digit()), str::parse::<u32>)
    }

    fn date(i: &str) -> PResult<'_, NaiveDate> {
        map_opt(
            tuple((number(4, 4), char('-'), number(2, 2), char('-'), number(2, 2))),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y as i32, m, d),
        )(i)
    }

    fn time(i: &str) -> PResult<'_, NaiveTime> {
        map_opt(
            tuple((number(1, 2), char(':'), number(2, 2))),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0),
        )(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use proptest::prelude::*;

        fn catalog() -> StateCatalog {
            StateCatalog::from_names(&["TODO", "STARTED"], &["WAITING"], &["DONE"]).unwrap()
        }

        fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        #[test]
        fn decodes_state_priority_title_and_tags() {
            let f = decode("** TODO [#A] Buy milk :errands:home:", &catalog()).unwrap();
            assert_eq!(f.depth, 2);
            assert_eq!(f.state.as_deref(), Some("TODO"));
            assert_eq!(f.priority, Some(Priority::A));
            assert_eq!(f.title, "Buy milk");
            assert_eq!(f.tags.iter().collect::<Vec<_>>(), vec!["errands", "home"]);
            assert!(f.closed.is_none());
        }

        #[test]
        fn unknown_leading_word_stays_in_the_title() {
            let f = decode("* MAYBE call Bob", &catalog()).unwrap();
            assert_eq!(f.state, None);
            assert_eq!(f.title, "MAYBE call Bob");
        }

        #[test]
        fn non_headings_are_rejected() {
            let cat = catalog();
            assert!(decode("*bold* text", &cat).is_none());
            assert!(decode("plain", &cat).is_none());
            assert!(decode("***", &cat).is_none());
            assert!(decode(" * indented", &cat).is_none());
            assert_eq!(decode("* ", &cat).unwrap().title, "");
        }

        #[test]
        fn closed_cookie_is_lifted_out_of_the_title() {
            let f = decode("* DONE Buy milk CLOSED: [2025-03-14 Fri 09:05] :errands:", &catalog()).unwrap();
            assert_eq!(f.title, "Buy milk");
            let closed = f.closed.unwrap();
            assert_eq!(closed.date, ymd(2025, 3, 14));
            assert_eq!(closed.time, NaiveTime::from_hms_opt(9, 5, 0));
            assert_eq!(f.tags.len(), 1);

            // stray keyword without a timestamp is ordinary title text
            let f = decode("* Note the CLOSED: sign", &catalog()).unwrap();
            assert_eq!(f.title, "Note the CLOSED: sign");
            assert!(f.closed.is_none());
        }

        #[test]
        fn encode_places_closed_before_tags() {
            let mut f = decode("* TODO Buy milk :errands:", &catalog()).unwrap();
            f.state = Some("DONE".into());
            f.closed = Some(Timestamp::inactive_at(ymd(2025, 3, 14).and_hms_opt(9, 5, 0).unwrap()));
            assert_eq!(
                encode(&f),
                "* DONE Buy milk CLOSED: [2025-03-14 Fri 09:05] :errands:"
            );
        }

        #[test]
        fn title_column_points_past_state_and_priority() {
            let f = decode("*** STARTED [#B] Refactor", &catalog()).unwrap();
            let line = encode(&f);
            assert_eq!(&line[title_column(&f)..], "Refactor");
        }

        #[test]
        fn planning_lines_parse_all_three_keywords() {
            let p = decode_planning("  SCHEDULED: <2025-11-15 Sat> DEADLINE: <2025-11-20 Thu 12:00>")
                .unwrap();
            assert_eq!(p.scheduled.unwrap().date, ymd(2025, 11, 15));
            assert_eq!(p.deadline.unwrap().time, NaiveTime::from_hms_opt(12, 0, 0));
            assert!(p.closed.is_none());
            assert!(decode_planning("SCHEDULED: tomorrow").is_none());
            assert!(decode_planning("Some text").is_none());

            let rendered = encode_planning(&p, "  ").unwrap();
            assert_eq!(rendered, "  SCHEDULED: <2025-11-15 Sat> DEADLINE: <2025-11-20 Thu 12:00>");
            assert_eq!(encode_planning(&Planning::default(), ""), None);
        }

        #[test]
        fn timestamps_tolerate_repeaters_and_reordered_day_names() {
            let ts = parse_timestamp("<2025-01-06 Mon 10:00 +1w>").unwrap();
            assert!(ts.active);
            assert_eq!(ts.time, NaiveTime::from_hms_opt(10, 0, 0));
            let ts = parse_timestamp("[2025-01-06 10:00 Mon]").unwrap();
            assert!(!ts.active);
            assert!(parse_timestamp("<2025-13-01>").is_none());
        }

        #[test]
        fn property_lines() {
            assert_eq!(
                decode_property("  :CUSTOM_ID: intro-section "),
                Some(("CUSTOM_ID".into(), "intro-section".into()))
            );
            assert_eq!(decode_property(":EMPTY:"), Some(("EMPTY".into(), "".into())));
            assert_eq!(decode_property("no drawer here"), None);
            assert_eq!(encode_property("ID", "42"), ":ID: 42");
            assert!(is_drawer_start(":PROPERTIES:"));
            assert!(is_drawer_end("  :end:"));
        }

        fn token() -> impl Strategy<Value = String> {
            prop_oneof![
                Just("TODO".to_string()),
                Just("DONE".to_string()),
                Just("WAITING".to_string()),
                Just("[#A]".to_string()),
                Just("[#Z]".to_string()),
                Just("CLOSED:".to_string()),
                Just("[2025-01-02 Thu 10:00]".to_string()),
                Just("<2025-02-03>".to_string()),
                Just(":a:b:".to_string()),
                Just("::".to_string()),
                "[a-z:#\\[\\]]{1,6}",
            ]
        }

        fn heading_line() -> impl Strategy<Value = String> {
            (1usize..4, proptest::collection::vec(token(), 0..8), "[ ]{1,2}").prop_map(
                |(depth, words, gap)| format!("{}{}{}", "*".repeat(depth), gap, words.join(" ")),
            )
        }

        proptest! {
            #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

            #[test]
            fn decode_encode_round_trips(line in heading_line()) {
                let cat = catalog();
                let first = decode(&line, &cat).expect("generated lines are headings");
                let again = decode(&encode(&first), &cat).expect("encoded line is a heading");
                prop_assert_eq!(first, again);
            }
        }
    }
}

pub mod buffer {
    use std::ops::Range;

    /// Text plus the byte offset of every line start.
    ///
    /// Lines are split on `\n`; a trailing `\r` is not part of the line content. There is
    /// always at least one line, and a text ending in `\n` ends with an empty line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LineTable {
        text: String,
        starts: Vec<usize>,
        revision: u64,
    }

    impl Default for LineTable {
        fn default() -> Self {
            Self::new("")
        }
    }

    impl LineTable {
        pub fn new(text: impl Into<String>) -> Self {
            let mut table = Self {
                text: text.into(),
                starts: vec![],
                revision: 0,
            };
            table.reindex();
            table
        }

        fn reindex(&mut self) {
            self.starts.clear();
            self.starts.push(0);
            self.starts
                .extend(self.text.match_indices('\n').map(|(i, _)| i + 1));
        }

        pub fn text(&self) -> &str {
            &self.text
        }

        /// Bumped by every mutation.
        pub fn revision(&self) -> u64 {
            self.revision
        }

        pub fn line_count(&self) -> usize {
            self.starts.len()
        }

        pub fn line_start(&self, idx: usize) -> Option<usize> {
            self.starts.get(idx).copied()
        }

        /// Byte offset just past the line content, terminator excluded.
        pub fn line_end(&self, idx: usize) -> Option<usize> {
            self.line_range(idx).map(|r| r.end)
        }

        pub fn line_range(&self, idx: usize) -> Option<Range<usize>> {
            let start = *self.starts.get(idx)?;
            let end = match self.starts.get(idx + 1) {
                Some(next) => next - 1,
                None => self.text.len(),
            };
            let end = if self.text[start..end].ends_with('\r') { end - 1 } else { end };
            Some(start..end)
        }

        pub fn line(&self, idx: usize) -> Option<&str> {
            self.line_range(idx).map(|r| &self.text[r])
        }

        pub fn lines(&self) -> impl Iterator<Item = &str> + '_ {
            (0..self.line_count()).filter_map(|i| self.line(i))
        }

        /// Largest char boundary not past `offset`, itself clamped to the text length.
        pub fn clamp_offset(&self, offset: usize) -> usize {
            let mut offset = offset.min(self.text.len());
            while !self.text.is_char_boundary(offset) {
                offset -= 1;
            }
            offset
        }

        pub fn line_of_offset(&self, offset: usize) -> usize {
            let offset = offset.min(self.text.len());
            match self.starts.binary_search(&offset) {
                Ok(i) => i,
                Err(i) => i - 1,
            }
        }

        /// Swaps the content of one line in place. Later line starts shift by the length
        /// difference; no other line is touched.
        pub fn replace_line(&mut self, idx: usize, content: &str) -> Option<isize> {
            if content.contains('\n') {
                return None;
            }
            let range = self.line_range(idx)?;
            let delta = content.len() as isize - range.len() as isize;
            self.text.replace_range(range, content);
            for start in &mut self.starts[idx + 1..] {
                *start = (*start as isize + delta) as usize;
            }
            self.revision += 1;
            Some(delta)
        }

        /// Inserts a line before `idx`; `idx == line_count()` appends after the last line.
        /// The new line ends the way its neighbours do (`\n` or `\r\n`).
        pub fn insert_line(&mut self, idx: usize, content: &str) -> bool {
            if content.contains('\n') || idx > self.line_count() {
                return false;
            }
            let eol = self.terminator_near(idx);
            match self.starts.get(idx) {
                Some(&at) => self.text.insert_str(at, &format!("{content}{eol}")),
                None => {
                    self.text.push_str(eol);
                    self.text.push_str(content);
                }
            }
            self.reindex();
            self.revision += 1;
            true
        }

        /// Removes lines `range.start..range.end` together with their terminators.
        pub fn remove_lines(&mut self, range: Range<usize>) -> bool {
            if range.is_empty() || range.end > self.line_count() {
                return false;
            }
            let bytes = match self.starts.get(range.end) {
                Some(&next) => self.starts[range.start]..next,
                // through the last line: drop the terminator that precedes the range instead
                None => {
                    let start = self.starts[range.start];
                    let eol = if self.text[..start].ends_with("\r\n") { 2 } else { 1 };
                    start.saturating_sub(eol)..self.text.len()
                }
            };
            self.text.replace_range(bytes, "");
            self.reindex();
            self.revision += 1;
            true
        }

        /// Terminator of the nearest terminated line at or just above `idx`.
        fn terminator_near(&self, idx: usize) -> &'static str {
            let crlf = [Some(idx), idx.checked_sub(1), idx.checked_sub(2)]
                .into_iter()
                .flatten()
                .find_map(|l| {
                    let next = *self.starts.get(l + 1)?;
                    Some(self.text[..next].ends_with("\r\n"))
                })
                .unwrap_or(false);
            if crlf { "\r\n" } else { "\n" }
        }

        /// Arbitrary edit coming from outside the engine.
        pub fn apply_edit(&mut self, range: Range<usize>, replacement: &str) {
            let start = self.clamp_offset(range.start);
            let end = self.clamp_offset(range.end.max(range.start));
            self.text.replace_range(start..end, replacement);
            self.reindex();
            self.revision += 1;
        }

        pub fn set_text(&mut self, text: impl Into<String>) {
            self.text = text.into();
            self.reindex();
            self.revision += 1;
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn lines_exclude_terminators() {
            let t = LineTable::new("one\r\ntwo\n\nfour");
            assert_eq!(t.line_count(), 4);
            assert_eq!(t.lines().collect::<Vec<_>>(), vec!["one", "two", "", "four"]);
            assert_eq!(t.line_end(0), Some(3));
            assert_eq!(t.line_of_offset(0), 0);
            assert_eq!(t.line_of_offset(4), 0);
            assert_eq!(t.line_of_offset(5), 1);
            assert_eq!(t.line_of_offset(999), 3);
        }

        #[test]
        fn trailing_newline_yields_an_empty_last_line() {
            let t = LineTable::new("a\n");
            assert_eq!(t.line_count(), 2);
            assert_eq!(t.line(1), Some(""));
            assert_eq!(LineTable::default().line_count(), 1);
        }

        #[test]
        fn replace_line_shifts_only_later_starts() {
            let mut t = LineTable::new("* TODO x\nbody\n* y");
            let rev = t.revision();
            assert_eq!(t.replace_line(0, "* DONE x CLOSED: [2025-01-01 Wed]"), Some(25));
            assert_eq!(t.line(1), Some("body"));
            assert_eq!(t.line(2), Some("* y"));
            assert_eq!(t.line_start(0), Some(0));
            assert!(t.revision() > rev);
            assert_eq!(t.replace_line(0, "a\nb"), None);
            assert_eq!(t.replace_line(9, "x"), None);
        }

        #[test]
        fn insert_and_remove_lines() {
            let mut t = LineTable::new("a\nc");
            assert!(t.insert_line(1, "b"));
            assert_eq!(t.text(), "a\nb\nc");
            assert!(t.insert_line(3, "d"));
            assert_eq!(t.text(), "a\nb\nc\nd");
            assert!(t.remove_lines(1..3));
            assert_eq!(t.text(), "a\nd");
            assert!(t.remove_lines(1..2));
            assert_eq!(t.text(), "a");
            assert!(!t.remove_lines(3..4));
        }

        #[test]
        fn inserted_lines_follow_crlf_neighbours() {
            let mut t = LineTable::new("a\r\nc");
            assert!(t.insert_line(1, "b"));
            assert_eq!(t.text(), "a\r\nb\r\nc");
            assert!(t.insert_line(3, "d"));
            assert_eq!(t.text(), "a\r\nb\r\nc\r\nd");
            assert!(t.remove_lines(3..4));
            assert_eq!(t.text(), "a\r\nb\r\nc");
            assert_eq!(t.lines().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        }

        #[test]
        fn clamp_offset_lands_on_char_boundaries() {
            let t = LineTable::new("héllo");
            assert_eq!(t.clamp_offset(2), 1);
            assert_eq!(t.clamp_offset(100), t.text().len());
        }

        #[test]
        fn apply_edit_reindexes() {
            let mut t = LineTable::new("a\nb");
            t.apply_edit(1..1, "\nx");
            assert_eq!(t.lines().collect::<Vec<_>>(), vec!["a", "x", "b"]);
        }
    }
}

pub mod tree {
    //! One linear pass over the buffer with a stack of open headings. A heading closes
    //! every open heading at its depth or deeper; everything else belongs to the most
    //! recent heading. Lines before the first heading are dropped, apart from
    //! `#+KEY: value` settings.

    use crate::catalog::StateCatalog;
    use crate::core::{Forest, NodeId, OutlineNode};
    use crate::headline::{self, HeadlineFields};
    use chrono::{Local, NaiveDateTime};
    use std::{
        collections::{HashMap, VecDeque},
        path::PathBuf,
    };
    use tracing::trace;

    pub struct OutlineTreeBuilder<'a> {
        catalog: &'a StateCatalog,
        now: NaiveDateTime,
        path: Option<PathBuf>,
    }

    /// Per-heading parse state while the heading is on the stack.
    #[derive(Default)]
    struct Section {
        past_header: bool,
        in_drawer: bool,
        body: Vec<String>,
    }

    impl Section {
        fn absorb(&mut self, node: &mut OutlineNode, line: &str, idx: usize) {
            node.last_line = Some(idx);

            if self.in_drawer {
                if headline::is_drawer_end(line) {
                    self.in_drawer = false;
                    node.drawer = node.drawer.map(|(start, _)| (start, idx));
                } else if let Some((key, value)) = headline::decode_property(line) {
                    node.properties.insert(key, value);
                }
                return;
            }

            if !self.past_header {
                if let Some(p) = headline::decode_planning(line) {
                    node.scheduled = p.scheduled.or(node.scheduled);
                    node.deadline = p.deadline.or(node.deadline);
                    node.closed = node.closed.or(p.closed);
                    node.planning_line.get_or_insert(idx);
                    return;
                }
                if node.drawer.is_none() && headline::is_drawer_start(line) {
                    self.in_drawer = true;
                    node.drawer = Some((idx, idx));
                    return;
                }
                self.past_header = true;
            }

            self.body.push(line.to_string());
        }

        fn finish(mut self, node: &mut OutlineNode) {
            if self.in_drawer {
                // unterminated drawer: keep the properties, forget the span
                node.drawer = None;
            }
            while self.body.last().is_some_and(|l| l.trim().is_empty()) {
                self.body.pop();
            }
            node.body = self.body.join("\n");
        }
    }

    impl<'a> OutlineTreeBuilder<'a> {
        pub fn new(catalog: &'a StateCatalog) -> Self {
            Self {
                catalog,
                now: Local::now().naive_local(),
                path: None,
            }
        }

        /// Timestamp used for creation stamps and for CLOSED stamps added while
        /// normalizing completed nodes.
        pub fn with_now(mut self, now: NaiveDateTime) -> Self {
            self.now = now;
            self
        }

        pub fn with_path(mut self, path: Option<PathBuf>) -> Self {
            self.path = path;
            self
        }

        /// Builds a fresh forest. Never fails: malformed lines become body text.
        pub fn parse(&self, text: &str) -> Forest {
            let mut forest = Forest::new(self.path.clone());
            let mut stack: Vec<(OutlineNode, Section)> = Vec::new();

            for (idx, raw) in text.split('\n').enumerate() {
                let line = raw.strip_suffix('\r').unwrap_or(raw);

                if let Some(fields) = headline::decode(line, self.catalog) {
                    let node = self.node_from(fields, idx);
                    while stack.last().is_some_and(|(top, _)| top.depth >= node.depth) {
                        close_top(&mut stack, &mut forest);
                    }
                    stack.push((node, Section::default()));
                    continue;
                }

                match stack.last_mut() {
                    Some((node, section)) => section.absorb(node, line, idx),
                    None => match setting(line) {
                        Some((key, value)) => {
                            forest.settings.insert(key, value);
                        }
                        None => trace!(line = idx, "dropping text before the first heading"),
                    },
                }
            }
            while !stack.is_empty() {
                close_top(&mut stack, &mut forest);
            }

            for_each_mut(&mut forest.roots, &mut |node| {
                node.reconcile_closed(self.catalog, self.now);
            });
            forest
        }

        fn node_from(&self, fields: HeadlineFields, idx: usize) -> OutlineNode {
            let mut node = OutlineNode::new(fields.depth, fields.title);
            node.state = fields.state;
            node.priority = fields.priority;
            node.tags = fields.tags;
            node.closed = fields.closed;
            node.created = self.now;
            node.last_modified = self.now;
            node.file_path = self.path.clone();
            node.line = Some(idx);
            node.last_line = Some(idx);
            node
        }
    }

    /// Parses with a builder stamped at the current local time.
    pub fn parse(text: &str, catalog: &StateCatalog) -> Forest {
        OutlineTreeBuilder::new(catalog).parse(text)
    }

    fn close_top(stack: &mut Vec<(OutlineNode, Section)>, forest: &mut Forest) {
        let Some((mut node, section)) = stack.pop() else {
            return;
        };
        section.finish(&mut node);
        match stack.last_mut() {
            Some((parent, _)) => parent.children.push(node),
            None => forest.roots.push(node),
        }
    }

    fn setting(line: &str) -> Option<(String, String)> {
        let (key, value) = line.trim().strip_prefix("#+")?.split_once(':')?;
        Some((key.trim().to_ascii_uppercase(), value.trim().to_string()))
    }

    /// Words of the first `#+TODO:` style line ahead of the first heading.
    pub fn declared_todo_keywords(text: &str) -> Option<Vec<String>> {
        text.lines()
            .take_while(|l| !headline::is_heading(l))
            .filter_map(setting)
            .find(|(key, _)| matches!(key.as_str(), "TODO" | "SEQ_TODO" | "TYP_TODO"))
            .map(|(_, value)| value.split_whitespace().map(str::to_string).collect())
    }

    pub(crate) fn for_each_mut(nodes: &mut [OutlineNode], f: &mut impl FnMut(&mut OutlineNode)) {
        for node in nodes {
            f(node);
            for_each_mut(&mut node.children, f);
        }
    }

    /* ---------------------------- reassociation ---------------------------- */

    /// Carries ids and creation stamps from `old` into a freshly parsed forest.
    ///
    /// Siblings are matched level by level on (depth, title, ordinal among siblings with
    /// the same depth and title); leftovers fall back to the same sibling position when
    /// the depth agrees, which keeps ids stable while a title is being typed. Returns
    /// the number of nodes that kept their id.
    pub fn reassociate_ids(old: &Forest, fresh: &mut Forest) -> usize {
        reassociate_level(&old.roots, &mut fresh.roots)
    }

    fn reassociate_level(old: &[OutlineNode], fresh: &mut [OutlineNode]) -> usize {
        let mut pool: HashMap<(usize, String), VecDeque<usize>> = HashMap::new();
        for (i, node) in old.iter().enumerate() {
            pool.entry((node.depth, node.title.clone()))
                .or_default()
                .push_back(i);
        }

        let mut claimed = vec![false; old.len()];
        let mut pairs: Vec<Option<usize>> = vec![None; fresh.len()];
        for (j, node) in fresh.iter().enumerate() {
            if let Some(i) = pool
                .get_mut(&(node.depth, node.title.clone()))
                .and_then(VecDeque::pop_front)
            {
                claimed[i] = true;
                pairs[j] = Some(i);
            }
        }
        for (j, node) in fresh.iter().enumerate() {
            if pairs[j].is_none() && j < old.len() && !claimed[j] && old[j].depth == node.depth {
                claimed[j] = true;
                pairs[j] = Some(j);
            }
        }

        let mut matched = 0;
        for (node, pair) in fresh.iter_mut().zip(pairs) {
            if let Some(i) = pair {
                let prev = &old[i];
                node.id = prev.id;
                node.created = prev.created;
                matched += 1 + reassociate_level(&prev.children, &mut node.children);
            }
        }
        matched
    }

    /// Carries ids across a parse where the caller knows exactly where each old heading
    /// line went. `map` takes an old heading line to its new line.
    pub fn reassociate_by_line(
        old: &Forest,
        fresh: &mut Forest,
        map: impl Fn(usize) -> Option<usize>,
    ) -> usize {
        let moved: HashMap<usize, (NodeId, NaiveDateTime)> = old
            .nodes()
            .into_iter()
            .filter_map(|n| Some((map(n.line?)?, (n.id, n.created))))
            .collect();
        let mut matched = 0;
        for_each_mut(&mut fresh.roots, &mut |node| {
            if let Some((id, created)) = node.line.and_then(|l| moved.get(&l)) {
                node.id = *id;
                node.created = *created;
                matched += 1;
            }
        });
        matched
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;
        use proptest::prelude::*;

        fn catalog() -> StateCatalog {
            StateCatalog::from_names(&["TODO", "STARTED"], &["WAITING"], &["DONE"]).unwrap()
        }

        fn now() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2025, 3, 14)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap()
        }

        fn build(text: &str) -> Forest {
            OutlineTreeBuilder::new(&catalog()).with_now(now()).parse(text)
        }

        fn titles(nodes: &[OutlineNode]) -> Vec<&str> {
            nodes.iter().map(|n| n.title()).collect()
        }

        #[test]
        fn nests_by_depth() {
            let forest = build("* A\n** B\n* C");
            assert_eq!(titles(&forest.roots), vec!["A", "C"]);
            assert_eq!(titles(forest.roots[0].children()), vec!["B"]);
            assert_eq!(forest.len(), 3);
        }

        #[test]
        fn skipped_levels_still_nest_under_the_nearest_shallower_heading() {
            let forest = build("* a\n*** deep\n** mid\n* b");
            assert_eq!(titles(forest.roots[0].children()), vec!["deep", "mid"]);
            assert_eq!(forest.roots[0].children()[0].depth(), 3);
        }

        #[test]
        fn text_before_the_first_heading_is_dropped_except_settings() {
            let forest = build("#+TITLE: Groceries\nstray words\n* A\nbody line");
            assert_eq!(forest.roots.len(), 1);
            assert_eq!(forest.settings.get("TITLE").map(String::as_str), Some("Groceries"));
            assert_eq!(forest.roots[0].body(), "body line");
        }

        #[test]
        fn planning_and_drawer_are_lifted_out_of_the_body() {
            let text = "* TODO Plan\n  SCHEDULED: <2025-03-20 Thu> DEADLINE: <2025-03-21 Fri>\n  :PROPERTIES:\n  :ID: abc\n  :END:\nFirst body line\n\n";
            let forest = build(text);
            let node = &forest.roots[0];
            assert_eq!(node.scheduled().unwrap().date, NaiveDate::from_ymd_opt(2025, 3, 20).unwrap());
            assert!(node.deadline().is_some());
            assert_eq!(node.property("ID"), Some("abc"));
            assert_eq!(node.body(), "First body line");
            assert_eq!(node.line, Some(0));
            assert_eq!(node.planning_line, Some(1));
            assert_eq!(node.drawer, Some((2, 4)));
            assert_eq!(node.last_line, Some(7));
        }

        #[test]
        fn planning_after_body_text_is_body() {
            let forest = build("* x\nnote\nSCHEDULED: <2025-03-20 Thu>");
            assert!(forest.roots[0].scheduled().is_none());
            assert_eq!(forest.roots[0].body(), "note\nSCHEDULED: <2025-03-20 Thu>");
        }

        #[test]
        fn completed_nodes_are_normalized_on_parse() {
            let forest = build("* DONE finished\n* TODO reopened CLOSED: [2025-01-01 Wed 10:00]\n* DONE kept CLOSED: [2025-01-02 Thu 11:00]");
            let [finished, reopened, kept] = &forest.roots[..] else {
                panic!("three roots expected");
            };
            assert_eq!(finished.closed().unwrap().start(), now());
            assert!(reopened.closed().is_none());
            assert_eq!(kept.closed().unwrap().date, NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
            assert!(forest.completion_invariant_holds(&catalog()));
        }

        #[test]
        fn declared_keywords_come_from_the_preamble_only() {
            let text = "#+TODO: OPEN | FIXED\n* OPEN bug\n#+TODO: NOPE";
            assert_eq!(
                declared_todo_keywords(text),
                Some(vec!["OPEN".to_string(), "|".to_string(), "FIXED".to_string()])
            );
            assert_eq!(declared_todo_keywords("* a\n#+TODO: X"), None);
        }

        #[test]
        fn reassociation_survives_insertions_and_title_edits() {
            let old = build("* A\n** child\n* B\n* B");
            let mut fresh = build("* New\n* A!\n** child\n* B\n* B");
            reassociate_ids(&old, &mut fresh);

            // the inserted heading lands in A's slot and inherits its id; both Bs keep theirs
            assert_eq!(fresh.roots[3].id(), old.roots[1].id());
            assert_eq!(fresh.roots[4].id(), old.roots[2].id());
            assert_ne!(fresh.roots[1].id(), fresh.roots[0].id());

            let old = build("* Draft\n** keep me");
            let mut fresh = build("* Draft title\n** keep me");
            assert_eq!(reassociate_ids(&old, &mut fresh), 2);
            assert_eq!(fresh.roots[0].id(), old.roots[0].id());
            assert_eq!(
                fresh.roots[0].children()[0].id(),
                old.roots[0].children()[0].id()
            );
        }

        #[test]
        fn reassociation_by_line_follows_the_mapping() {
            let old = build("* a\n* b");
            let mut fresh = build("* a\n** b");
            assert_eq!(reassociate_by_line(&old, &mut fresh, Some), 2);
            assert_eq!(fresh.roots[0].children()[0].id(), old.roots[1].id());
        }

        fn outline_line() -> impl Strategy<Value = String> {
            prop_oneof![
                (1usize..5, "[a-z ]{0,8}").prop_map(|(d, t)| format!("{} {t}", "*".repeat(d))),
                "[a-z*: ]{0,10}",
                Just("SCHEDULED: <2025-01-01 Wed>".to_string()),
                Just(":PROPERTIES:".to_string()),
                Just(":END:".to_string()),
            ]
        }

        fn check_depths(nodes: &[OutlineNode], parent: usize) -> bool {
            nodes
                .iter()
                .all(|n| n.depth() > parent && check_depths(n.children(), n.depth()))
        }

        proptest! {
            #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

            #[test]
            fn children_are_always_deeper_than_parents(lines in proptest::collection::vec(outline_line(), 0..30)) {
                let forest = build(&lines.join("\n"));
                prop_assert!(check_depths(&forest.roots, 0));
                let heading_count = lines.iter().filter(|l| headline::is_heading(l)).count();
                prop_assert_eq!(forest.len(), heading_count);
            }
        }
    }
}

pub mod links {
    use crate::core::OutlineNode;
    use nom::{
        IResult,
        bytes::complete::{is_not, tag, take_till},
        character::complete::char,
        combinator::opt,
        error::VerboseError,
        sequence::delimited,
    };
    use serde::{Deserialize, Serialize};
    use std::path::Path;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum LinkKind {
        Web,
        File,
        Internal,
        Id,
        FileWithTarget,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Link {
        pub target: String,
        pub description: Option<String>,
        pub kind: LinkKind,
        /// Byte offset of the opening `[[` in the scanned text.
        pub offset: usize,
    }

    impl Link {
        /// Display text: the description, or the target when there is none.
        pub fn label(&self) -> &str {
            self.description.as_deref().unwrap_or(&self.target)
        }

        /// `path::anchor` halves of a file-with-target link.
        pub fn file_and_anchor(&self) -> Option<(&str, &str)> {
            if self.kind != LinkKind::FileWithTarget {
                return None;
            }
            self.target.split_once("::")
        }
    }

    /// First matching rule wins: web, `file:`, `#anchor`, `id:`, `path::target`,
    /// anything with a file extension, otherwise an internal heading reference.
    pub fn classify(target: &str) -> LinkKind {
        let t = target.trim();
        if t.starts_with("http://") || t.starts_with("https://") {
            LinkKind::Web
        } else if t.starts_with("file:") {
            LinkKind::File
        } else if t.starts_with('#') {
            LinkKind::Internal
        } else if t.starts_with("id:") {
            LinkKind::Id
        } else if t.contains("::") {
            LinkKind::FileWithTarget
        } else if Path::new(t).extension().is_some() {
            LinkKind::File
        } else {
            LinkKind::Internal
        }
    }

    /// Every `[[target]]` and `[[target][description]]` in `text`, in order.
    pub fn extract_links(text: &str) -> Vec<Link> {
        let mut out = Vec::new();
        let mut cursor = 0;
        while let Some(found) = text[cursor..].find("[[") {
            let at = cursor + found;
            match bracket_link(&text[at..]) {
                Ok((rest, (target, description))) => {
                    out.push(Link {
                        target: target.to_string(),
                        description: description.filter(|d| !d.is_empty()).map(str::to_string),
                        kind: classify(target),
                        offset: at,
                    });
                    cursor = text.len() - rest.len();
                }
                Err(_) => cursor = at + 1,
            }
        }
        out
    }

    /// Links in a node's title followed by its body, scanned as `title + " " + body`.
    pub fn node_links(node: &OutlineNode) -> Vec<Link> {
        extract_links(&format!("{} {}", node.title(), node.body()))
    }

    fn bracket_link(i: &str) -> PResult<'_, (&str, Option<&str>)> {
        let (i, _) = tag("[[")(i)?;
        let (i, target) = is_not("]\n")(i)?;
        let (i, _) = char(']')(i)?;
        let (i, description) = opt(delimited(
            char('['),
            take_till(|c: char| c == ']' || c == '\n'),
            char(']'),
        ))(i)?;
        let (i, _) = char(']')(i)?;
        Ok((i, (target, description)))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn classifies_in_precedence_order() {
            assert_eq!(classify("https://example.com/a.html"), LinkKind::Web);
            assert_eq!(classify("file:notes.org::*Heading"), LinkKind::File);
            assert_eq!(classify("#custom-id"), LinkKind::Internal);
            assert_eq!(classify("id:7f9c"), LinkKind::Id);
            assert_eq!(classify("projects::Roadmap"), LinkKind::FileWithTarget);
            assert_eq!(classify("notes.org"), LinkKind::File);
            assert_eq!(classify("Some Heading"), LinkKind::Internal);
        }

        #[test]
        fn extracts_plain_and_described_links() {
            let text = "See [[https://example.com][the site]] and [[notes.org]] or [[broken] here, [[][x]]";
            let links = extract_links(text);
            assert_eq!(links.len(), 2);
            assert_eq!(links[0].label(), "the site");
            assert_eq!(links[0].kind, LinkKind::Web);
            assert_eq!(links[0].offset, 4);
            assert_eq!(links[1].label(), "notes.org");
            assert_eq!(links[1].description, None);
            assert_eq!(links[1].kind, LinkKind::File);
        }

        #[test]
        fn empty_description_falls_back_to_target() {
            let links = extract_links("[[id:42][]]");
            assert_eq!(links[0].description, None);
            assert_eq!(links[0].label(), "id:42");
        }

        #[test]
        fn node_links_scan_title_then_body() {
            let mut node = OutlineNode::new(1, "Read [[file:a.org][A]]");
            node.set_body("then [[projects::Roadmap]]");
            let links = node_links(&node);
            assert_eq!(links.len(), 2);
            assert_eq!(links[1].file_and_anchor(), Some(("projects", "Roadmap")));
        }
    }
}

pub mod fold {
    use crate::buffer::LineTable;
    use crate::catalog::StateCatalog;
    use crate::core::{Forest, NodeId};
    use serde::{Deserialize, Serialize};

    /// Collapsible byte span under a heading: from the end of the heading line to the
    /// end of the last line of its subtree.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FoldRegion {
        pub node_id: NodeId,
        pub depth: usize,
        pub start: usize,
        pub end: usize,
    }

    /// Regions for every heading with something below it, sorted by start offset.
    pub fn compute_regions(forest: &Forest, buffer: &LineTable) -> Vec<FoldRegion> {
        let mut regions: Vec<FoldRegion> = forest
            .nodes()
            .into_iter()
            .filter_map(|node| {
                let start = buffer.line_end(node.line?)?;
                let end = buffer.line_end(node.subtree_last_line()?)?;
                (end > start).then_some(FoldRegion {
                    node_id: node.id(),
                    depth: node.depth(),
                    start,
                    end,
                })
            })
            .collect();
        regions.sort_by_key(|r| r.start);
        regions
    }

    pub fn regions_for_text(text: &str, catalog: &StateCatalog) -> Vec<FoldRegion> {
        let buffer = LineTable::new(text);
        let forest = crate::tree::parse(text, catalog);
        compute_regions(&forest, &buffer)
    }

}

pub mod format {
    //! Canonical rendering of a whole forest. The live buffer is edited line by line and
    //! never passes through here; this is for export and for checking that parsing is
    //! stable.

    use crate::core::{Forest, OutlineNode};
    use crate::headline::{self, HeadlineFields, Planning};

    pub fn headline_fields(node: &OutlineNode) -> HeadlineFields {
        HeadlineFields {
            depth: node.depth(),
            state: node.state().map(str::to_string),
            priority: node.priority(),
            title: node.title().to_string(),
            tags: node.tags().clone(),
            closed: node.closed(),
        }
    }

    pub fn serialize(forest: &Forest) -> String {
        let mut out = String::new();
        for (key, value) in &forest.settings {
            out.push_str(&format!("#+{key}: {value}\n"));
        }
        for root in &forest.roots {
            render_node(root, &mut out);
        }
        out
    }

    fn render_node(node: &OutlineNode, out: &mut String) {
        out.push_str(&headline::encode(&headline_fields(node)));
        out.push('\n');

        let planning = Planning {
            scheduled: node.scheduled(),
            deadline: node.deadline(),
            closed: None,
        };
        if let Some(line) = headline::encode_planning(&planning, "") {
            out.push_str(&line);
            out.push('\n');
        }
        render_properties(node, out);
        if !node.body().is_empty() {
            out.push_str(node.body());
            out.push('\n');
        }
        for child in node.children() {
            render_node(child, out);
        }
    }

    fn render_properties(node: &OutlineNode, out: &mut String) {
        if node.properties().is_empty() {
            return;
        }
        out.push_str(":PROPERTIES:\n");
        for (key, value) in node.properties() {
            out.push_str(&headline::encode_property(key, value));
            out.push('\n');
        }
        out.push_str(":END:\n");
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::catalog::StateCatalog;
        use crate::tree::OutlineTreeBuilder;
        use chrono::{NaiveDate, NaiveDateTime};
        use proptest::prelude::*;

        fn now() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2025, 3, 14)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap()
        }

        fn build(text: &str) -> Forest {
            OutlineTreeBuilder::new(&StateCatalog::default())
                .with_now(now())
                .parse(text)
        }

        fn shape(forest: &Forest) -> Vec<(usize, String, Option<String>, usize)> {
            forest
                .nodes()
                .into_iter()
                .map(|n| {
                    (
                        n.depth(),
                        n.title().to_string(),
                        n.state().map(str::to_string),
                        n.children().len(),
                    )
                })
                .collect()
        }

        #[test]
        fn renders_canonical_text() {
            let text = "#+title: Week\n* TODO [#B]   Plan week   :work:\nDEADLINE: <2025-03-21 Fri>\n:PROPERTIES:\n:EFFORT: 2h\n:END:\nnotes here\n** DONE Book room\n";
            let out = serialize(&build(text));
            assert_eq!(
                out,
                "#+TITLE: Week\n* TODO [#B] Plan week :work:\nDEADLINE: <2025-03-21 Fri>\n:PROPERTIES:\n:EFFORT: 2h\n:END:\nnotes here\n** DONE Book room CLOSED: [2025-03-14 Fri 12:00]\n"
            );
        }

        #[test]
        fn serialize_then_parse_is_stable() {
            let text = "* A\n** B\nbody\n*** C\n* TODO D :x:\n";
            let first = build(text);
            let second = build(&serialize(&first));
            assert_eq!(shape(&first), shape(&second));
            assert_eq!(serialize(&first), serialize(&second));
        }

        fn outline_line() -> impl Strategy<Value = String> {
            prop_oneof![
                (1usize..4, "(TODO |DONE |WAITING )?[a-z ]{0,8}")
                    .prop_map(|(d, t)| format!("{} {t}", "*".repeat(d))),
                "[a-z*: ]{0,10}",
                Just(String::new()),
                Just("SCHEDULED: <2025-01-01 Wed>".to_string()),
                Just(":PROPERTIES:".to_string()),
                Just(":K: v".to_string()),
                Just(":END:".to_string()),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

            #[test]
            fn reparsing_serialized_output_keeps_the_shape(lines in proptest::collection::vec(outline_line(), 0..30)) {
                let first = build(&lines.join("\n"));
                let second = build(&serialize(&first));
                prop_assert_eq!(shape(&first), shape(&second));
            }
        }
    }
}

pub mod clock {
    use chrono::{Local, NaiveDateTime, TimeDelta};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Source of "now" for stamps and debounce deadlines.
    pub trait Clock: Send + Sync {
        fn now(&self) -> NaiveDateTime;
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> NaiveDateTime {
            Local::now().naive_local()
        }
    }

    /// Clock that only moves when told to. Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        now: Arc<Mutex<NaiveDateTime>>,
    }

    impl ManualClock {
        pub fn new(start: NaiveDateTime) -> Self {
            Self {
                now: Arc::new(Mutex::new(start)),
            }
        }

        pub fn advance(&self, by: TimeDelta) {
            let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
            *now = now.checked_add_signed(by).unwrap_or(*now);
        }

        pub fn set(&self, to: NaiveDateTime) {
            *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> NaiveDateTime {
            *self.now.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Single-shot timer. Arming again pushes the deadline out; firing disarms it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebounceTimer {
        window: TimeDelta,
        deadline: Option<NaiveDateTime>,
    }

    impl DebounceTimer {
        pub fn new(window: TimeDelta) -> Self {
            Self {
                window,
                deadline: None,
            }
        }

        pub fn window(&self) -> TimeDelta {
            self.window
        }

        pub fn deadline(&self) -> Option<NaiveDateTime> {
            self.deadline
        }

        pub fn is_armed(&self) -> bool {
            self.deadline.is_some()
        }

        pub fn arm(&mut self, now: NaiveDateTime) {
            self.deadline = Some(now.checked_add_signed(self.window).unwrap_or(NaiveDateTime::MAX));
        }

        pub fn cancel(&mut self) {
            self.deadline = None;
        }

        /// True exactly once per arming, on the first call at or after the deadline.
        pub fn fire_if_due(&mut self, now: NaiveDateTime) -> bool {
            match self.deadline {
                Some(deadline) if now >= deadline => {
                    self.deadline = None;
                    true
                }
                _ => false,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        fn start() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2025, 1, 1)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap()
        }

        #[test]
        fn rearming_pushes_the_deadline_out() {
            let clock = ManualClock::new(start());
            let mut timer = DebounceTimer::new(TimeDelta::milliseconds(1500));
            timer.arm(clock.now());
            clock.advance(TimeDelta::milliseconds(1000));
            assert!(!timer.fire_if_due(clock.now()));
            timer.arm(clock.now());
            clock.advance(TimeDelta::milliseconds(1000));
            assert!(!timer.fire_if_due(clock.now()));
            clock.advance(TimeDelta::milliseconds(500));
            assert!(timer.fire_if_due(clock.now()));
            assert!(!timer.fire_if_due(clock.now()));
            assert!(!timer.is_armed());
        }

        #[test]
        fn cancelled_timer_never_fires() {
            let mut timer = DebounceTimer::new(TimeDelta::seconds(1));
            timer.arm(start());
            timer.cancel();
            assert!(!timer.fire_if_due(start() + TimeDelta::seconds(5)));
        }

        #[test]
        fn manual_clock_clones_share_time() {
            let a = ManualClock::new(start());
            let b = a.clone();
            a.advance(TimeDelta::minutes(3));
            assert_eq!(b.now(), start() + TimeDelta::minutes(3));
        }
    }
}

pub mod storage {
    use crate::catalog::StateCatalog;
    use crate::core::Forest;
    use crate::tree::OutlineTreeBuilder;
    use anyhow::{Context, Result, anyhow};
    use std::{
        collections::HashMap,
        fs,
        path::{Path, PathBuf},
        sync::{
            Arc, Mutex, PoisonError,
            atomic::{AtomicUsize, Ordering},
        },
    };

    /// Where document text lives. The engine reads once on load and writes after each
    /// settled close decision.
    pub trait DocumentStore: Send {
        fn read_text(&self, path: &Path) -> Result<String>;
        fn write_text(&self, path: &Path, text: &str) -> Result<()>;
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct FsDocumentStore;

    impl DocumentStore for FsDocumentStore {
        fn read_text(&self, path: &Path) -> Result<String> {
            fs::read_to_string(path).with_context(|| format!("reading {:?}", path))
        }

        fn write_text(&self, path: &Path, text: &str) -> Result<()> {
            fs::write(path, text).with_context(|| format!("writing {:?}", path))
        }
    }

    /// In-memory store. Clones share the same files.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryDocumentStore {
        files: Arc<Mutex<HashMap<PathBuf, String>>>,
        writes: Arc<AtomicUsize>,
    }

    impl MemoryDocumentStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_file(self, path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
            self.files
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(path.into(), text.into());
            self
        }

        pub fn get(&self, path: &Path) -> Option<String> {
            self.files
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(path)
                .cloned()
        }

        pub fn write_count(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    impl DocumentStore for MemoryDocumentStore {
        fn read_text(&self, path: &Path) -> Result<String> {
            self.get(path)
                .ok_or_else(|| anyhow!("no document at {:?}", path))
        }

        fn write_text(&self, path: &Path, text: &str) -> Result<()> {
            self.files
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(path.to_path_buf(), text.to_string());
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Reads and parses one document.
    pub fn load_forest(store: &dyn DocumentStore, path: &Path, catalog: &StateCatalog) -> Result<Forest> {
        let text = store.read_text(path)?;
        Ok(OutlineTreeBuilder::new(catalog)
            .with_path(Some(path.to_path_buf()))
            .parse(&text))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use tempfile::tempdir;

        #[test]
        fn fs_store_round_trips_text() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("inbox.org");
            FsDocumentStore.write_text(&path, "* TODO x\n").unwrap();
            assert_eq!(FsDocumentStore.read_text(&path).unwrap(), "* TODO x\n");
            let err = FsDocumentStore.read_text(&dir.path().join("missing.org")).unwrap_err();
            assert!(format!("{err:#}").contains("missing.org"));
        }

        #[test]
        fn load_forest_stamps_the_path_on_every_node() {
            let store = MemoryDocumentStore::new().with_file("/notes/a.org", "* A\n** B\n");
            let forest = load_forest(&store, Path::new("/notes/a.org"), &StateCatalog::default()).unwrap();
            assert!(forest
                .nodes()
                .iter()
                .all(|n| n.file_path() == Some(Path::new("/notes/a.org"))));
            assert!(load_forest(&store, Path::new("/nope.org"), &StateCatalog::default()).is_err());
        }
    }
}

pub mod config {
    use crate::catalog::{CatalogError, StateCatalog, StateClass, StateDefinition};
    use crate::sync::SyncConfig;
    use serde::{Deserialize, Serialize};
    use serde_with::{DurationMilliSeconds, serde_as};
    use std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    };
    use tracing::debug;

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("reading config {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("parsing config")]
        Parse(#[from] toml::de::Error),
        #[error("rendering config")]
        Render(#[from] toml::ser::Error),
        #[error("invalid state catalog in config")]
        Catalog(#[from] CatalogError),
    }

    /// Engine settings, read from `config.toml`:
    ///
    /// ```toml
    /// reparse_debounce_ms = 1000
    /// close_decision_debounce_ms = 1500
    ///
    /// [[states.action]]
    /// name = "TODO"
    /// color = "#FF6B6B"
    /// ```
    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct EngineConfig {
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        #[serde(rename = "reparse_debounce_ms", default = "default_reparse_debounce")]
        pub reparse_debounce: Duration,

        #[serde_as(as = "DurationMilliSeconds<u64>")]
        #[serde(
            rename = "close_decision_debounce_ms",
            default = "default_close_decision_debounce"
        )]
        pub close_decision_debounce: Duration,

        #[serde(default)]
        pub states: StatesConfig,
    }

    fn default_reparse_debounce() -> Duration {
        Duration::from_millis(1000)
    }

    fn default_close_decision_debounce() -> Duration {
        Duration::from_millis(1500)
    }

    impl Default for EngineConfig {
        fn default() -> Self {
            Self {
                reparse_debounce: default_reparse_debounce(),
                close_decision_debounce: default_close_decision_debounce(),
                states: StatesConfig::default(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StateEntry {
        pub name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub color: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub description: Option<String>,
    }

    /// The three state groups, each in cycle order.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StatesConfig {
        #[serde(default)]
        pub action: Vec<StateEntry>,
        #[serde(default)]
        pub no_action: Vec<StateEntry>,
        #[serde(default)]
        pub completed: Vec<StateEntry>,
    }

    impl Default for StatesConfig {
        fn default() -> Self {
            let catalog = StateCatalog::default();
            let group = |class: StateClass| {
                catalog
                    .iter()
                    .filter(|d| d.class == class)
                    .map(|d| StateEntry {
                        name: d.name.clone(),
                        color: d.color.clone(),
                        description: d.description.clone(),
                    })
                    .collect()
            };
            Self {
                action: group(StateClass::ActionRequired),
                no_action: group(StateClass::NoAction),
                completed: group(StateClass::Completed),
            }
        }
    }

    impl StatesConfig {
        pub fn to_catalog(&self) -> Result<StateCatalog, CatalogError> {
            let entries = |list: &[StateEntry], class: StateClass| {
                list.iter()
                    .map(|e| StateDefinition {
                        name: e.name.clone(),
                        class,
                        color: e.color.clone(),
                        description: e.description.clone(),
                    })
                    .collect::<Vec<_>>()
            };
            StateCatalog::new(
                entries(&self.action, StateClass::ActionRequired)
                    .into_iter()
                    .chain(entries(&self.no_action, StateClass::NoAction))
                    .chain(entries(&self.completed, StateClass::Completed)),
            )
        }
    }

    impl EngineConfig {
        /// `<config dir>/outline/config.toml`.
        pub fn default_path() -> Option<PathBuf> {
            dirs::config_dir().map(|p| p.join("outline").join("config.toml"))
        }

        pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
            Ok(toml::from_str(text)?)
        }

        pub fn to_toml_string(&self) -> Result<String, ConfigError> {
            Ok(toml::to_string_pretty(self)?)
        }

        pub fn load(path: &Path) -> Result<Self, ConfigError> {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let config = Self::from_toml_str(&text)?;
            debug!(?path, "loaded engine config");
            Ok(config)
        }

        /// Loads the config file at the default location, or the defaults when there
        /// is none.
        pub fn discover() -> Result<Self, ConfigError> {
            match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path),
                _ => {
                    debug!("no config file found; using defaults");
                    Ok(Self::default())
                }
            }
        }

        pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
            let io = |source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            };
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(io)?;
            }
            fs::write(path, self.to_toml_string()?).map_err(io)
        }

        pub fn catalog(&self) -> Result<StateCatalog, ConfigError> {
            Ok(self.states.to_catalog()?)
        }

        pub fn sync_config(&self) -> SyncConfig {
            SyncConfig {
                reparse_debounce: self.reparse_debounce,
                close_decision_debounce: self.close_decision_debounce,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use tempfile::tempdir;

        #[test]
        fn empty_file_means_defaults() {
            let config = EngineConfig::from_toml_str("").unwrap();
            assert_eq!(config, EngineConfig::default());
            assert_eq!(config.catalog().unwrap(), StateCatalog::default());
        }

        #[test]
        fn durations_and_states_are_read() {
            let config = EngineConfig::from_toml_str(
                r#"
                reparse_debounce_ms = 250
                close_decision_debounce_ms = 2000

                [[states.action]]
                name = "OPEN"

                [[states.completed]]
                name = "SHIPPED"
                color = "green"
                "#,
            )
            .unwrap();
            assert_eq!(config.reparse_debounce, Duration::from_millis(250));
            assert_eq!(config.close_decision_debounce, Duration::from_secs(2));
            let catalog = config.catalog().unwrap();
            assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["OPEN", "SHIPPED"]);
            assert_eq!(catalog.get("SHIPPED").unwrap().color.as_deref(), Some("green"));
        }

        #[test]
        fn duplicate_states_surface_as_catalog_errors() {
            let config = EngineConfig::from_toml_str(
                "[[states.action]]\nname = \"X\"\n[[states.completed]]\nname = \"X\"\n",
            )
            .unwrap();
            assert!(matches!(config.catalog(), Err(ConfigError::Catalog(_))));
        }

        #[test]
        fn save_then_load() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("nested").join("config.toml");
            let mut config = EngineConfig::default();
            config.reparse_debounce = Duration::from_millis(400);
            config.save(&path).unwrap();
            assert_eq!(EngineConfig::load(&path).unwrap(), config);
            assert!(matches!(
                EngineConfig::load(&dir.path().join("absent.toml")),
                Err(ConfigError::Io { .. })
            ));
        }
    }
}

pub mod sync {
    //! Live coordinator for one open document.
    //!
    //! The buffer is the source of truth. Targeted operations (state cycling, tags,
    //! planning dates, children) rewrite only the lines they touch and update the tree
    //! in place. Edits made by the host arm a reparse timer; state cycling arms a
    //! separate close-decision timer so that CLOSED is stamped once per gesture, after
    //! the user stops cycling.

    use crate::buffer::LineTable;
    use crate::catalog::{CatalogSnapshot, StateClass};
    use crate::clock::{Clock, DebounceTimer, SystemClock};
    use crate::core::{ClosedChange, DomainError, Forest, NodeId, NodeStats, OutlineNode, Priority, Timestamp};
    use crate::fold::{self, FoldRegion};
    use crate::format;
    use crate::headline::{self, HeadlineFields};
    use crate::links::{self, Link};
    use crate::storage::DocumentStore;
    use crate::tree::{self, OutlineTreeBuilder};
    use chrono::{NaiveDate, TimeDelta};
    use indexmap::IndexMap;
    use serde::Serialize;
    use std::{
        ops::Range,
        path::{Path, PathBuf},
        sync::{
            Arc,
            mpsc::{Receiver, TryRecvError},
        },
        thread::{self, JoinHandle},
        time::Duration,
    };
    use tracing::{debug, info, warn};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncConfig {
        pub reparse_debounce: Duration,
        pub close_decision_debounce: Duration,
    }

    impl Default for SyncConfig {
        fn default() -> Self {
            Self {
                reparse_debounce: Duration::from_millis(1000),
                close_decision_debounce: Duration::from_millis(1500),
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum SyncError {
        #[error(transparent)]
        Domain(#[from] DomainError),
        #[error("no document store or path configured")]
        NoStore,
        #[error("loading {path:?}: {message}")]
        Load { path: PathBuf, message: String },
        #[error("persisting {path:?}: {message}")]
        Persist { path: PathBuf, message: String },
        #[error("background parse worker panicked")]
        WorkerPanicked,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub enum CoordinatorState {
        Idle,
        PendingReparse,
        PendingCloseDecision,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum CycleOutcome {
        /// The cursor line is not a heading; nothing changed.
        NotAHeading,
        /// `persist_error` is set when an earlier heading's close decision was applied
        /// on the way but could not be written out.
        Cycled {
            node_id: NodeId,
            from: Option<String>,
            to: Option<String>,
            cursor: usize,
            persist_error: Option<String>,
        },
        /// The line was rewritten but no node could be matched to it, even after a
        /// reparse. The tree catches up on the next reparse.
        ///
        /// A reparse gives every heading line a node with the decoded depth and title,
        /// so this only happens if the tree builder and the heading codec disagree on
        /// a line.
        TextOnly {
            from: Option<String>,
            to: Option<String>,
            cursor: usize,
            persist_error: Option<String>,
        },
    }

    /// What one `tick` (or `flush`) did.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct TickReport {
        pub reparsed: bool,
        pub closed_stamped: Vec<NodeId>,
        pub closed_cleared: Vec<NodeId>,
        pub catalog_version: Option<u64>,
        pub persisted: bool,
    }

    /// Derived per-node values for display. Recomputed lazily after any change.
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct NodeSummary {
        pub class: Option<StateClass>,
        pub color: Option<String>,
        pub is_completed: bool,
        pub requires_action: bool,
        pub is_overdue: bool,
        pub stats: NodeStats,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize)]
    pub struct Presentation {
        pub summaries: IndexMap<NodeId, NodeSummary>,
        pub fold_regions: Vec<FoldRegion>,
    }

    /// A parse running on a worker thread against a copy of the buffer.
    pub struct ParseJob {
        revision: u64,
        handle: JoinHandle<Forest>,
    }

    impl ParseJob {
        /// Buffer revision the job parsed.
        pub fn revision(&self) -> u64 {
            self.revision
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum PlanningField {
        Scheduled,
        Deadline,
    }

    fn window(d: Duration) -> TimeDelta {
        TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
    }

    fn leading_ws(s: &str) -> &str {
        &s[..s.len() - s.trim_start().len()]
    }

    pub struct SyncCoordinator {
        buffer: LineTable,
        forest: Arc<Forest>,
        catalog: CatalogSnapshot,
        catalog_updates: Option<Receiver<CatalogSnapshot>>,
        clock: Arc<dyn Clock>,
        reparse: DebounceTimer,
        close_decision: DebounceTimer,
        pending_close: Option<NodeId>,
        cursor: usize,
        path: Option<PathBuf>,
        store: Option<Box<dyn DocumentStore>>,
        presentation: Option<Presentation>,
    }

    impl SyncCoordinator {
        pub fn new(catalog: CatalogSnapshot, config: SyncConfig) -> Self {
            Self {
                buffer: LineTable::default(),
                forest: Arc::new(Forest::default()),
                catalog,
                catalog_updates: None,
                clock: Arc::new(SystemClock),
                reparse: DebounceTimer::new(window(config.reparse_debounce)),
                close_decision: DebounceTimer::new(window(config.close_decision_debounce)),
                pending_close: None,
                cursor: 0,
                path: None,
                store: None,
                presentation: None,
            }
        }

        pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
            self.clock = clock;
            self
        }

        pub fn with_store(mut self, store: Box<dyn DocumentStore>, path: impl Into<PathBuf>) -> Self {
            self.store = Some(store);
            self.path = Some(path.into());
            self
        }

        /// Catalog replacements arriving here are picked up on the next `tick`.
        pub fn with_catalog_updates(mut self, updates: Receiver<CatalogSnapshot>) -> Self {
            self.catalog_updates = Some(updates);
            self
        }

        /* ------------------------------- loading ------------------------------- */

        /// Replaces the buffer and builds a fresh tree. Pending work is dropped.
        pub fn load_from_text(&mut self, text: impl Into<String>) {
            self.buffer.set_text(text);
            self.reparse.cancel();
            self.close_decision.cancel();
            self.pending_close = None;
            self.cursor = 0;
            self.forest = Arc::new(self.build());
            self.invalidate();
            info!(nodes = self.forest.len(), path = ?self.path, "document loaded");
        }

        pub fn load(&mut self) -> Result<(), SyncError> {
            let (Some(store), Some(path)) = (&self.store, &self.path) else {
                return Err(SyncError::NoStore);
            };
            let text = store.read_text(path).map_err(|e| SyncError::Load {
                path: path.clone(),
                message: format!("{e:#}"),
            })?;
            self.load_from_text(text);
            Ok(())
        }

        /// Writes the buffer to the configured store.
        pub fn save(&self) -> Result<(), SyncError> {
            if self.persist()? {
                Ok(())
            } else {
                Err(SyncError::NoStore)
            }
        }

        fn build(&self) -> Forest {
            OutlineTreeBuilder::new(&self.catalog.catalog)
                .with_now(self.clock.now())
                .with_path(self.path.clone())
                .parse(self.buffer.text())
        }

        /* ------------------------------ accessors ------------------------------ */

        pub fn text(&self) -> &str {
            self.buffer.text()
        }

        pub fn buffer(&self) -> &LineTable {
            &self.buffer
        }

        /// Snapshot of the current tree. Later changes never alter a snapshot.
        pub fn forest(&self) -> Arc<Forest> {
            Arc::clone(&self.forest)
        }

        pub fn node(&self, id: NodeId) -> Option<&OutlineNode> {
            self.forest.find(id)
        }

        pub fn catalog(&self) -> &CatalogSnapshot {
            &self.catalog
        }

        pub fn cursor(&self) -> usize {
            self.cursor
        }

        pub fn set_cursor(&mut self, offset: usize) {
            self.cursor = self.buffer.clamp_offset(offset);
        }

        pub fn path(&self) -> Option<&Path> {
            self.path.as_deref()
        }

        /// Renames the document (save-as). Metadata only: nothing is written.
        pub fn set_path(&mut self, path: Option<PathBuf>) {
            Arc::make_mut(&mut self.forest).set_path(path.clone());
            self.path = path;
        }

        pub fn state(&self) -> CoordinatorState {
            if self.close_decision.is_armed() {
                CoordinatorState::PendingCloseDecision
            } else if self.reparse.is_armed() {
                CoordinatorState::PendingReparse
            } else {
                CoordinatorState::Idle
            }
        }

        /// Node whose close decision is waiting on the debounce timer.
        pub fn pending_close(&self) -> Option<NodeId> {
            self.pending_close
        }

        /// The node whose section (heading through body) contains `offset`.
        pub fn node_at_offset(&self, offset: usize) -> Option<&OutlineNode> {
            let line = self.buffer.line_of_offset(self.buffer.clamp_offset(offset));
            self.forest.node_containing_line(line)
        }

        pub fn serialize(&self) -> String {
            format::serialize(&self.forest)
        }

        /* ---------------------------- external edits ---------------------------- */

        /// Host-side edit of the buffer. The tree catches up when the reparse timer fires.
        pub fn apply_external_edit(&mut self, range: Range<usize>, replacement: &str) {
            self.buffer.apply_edit(range, replacement);
            self.after_external_edit();
        }

        /// Host hands over the whole new text.
        pub fn replace_text(&mut self, text: impl Into<String>) {
            self.buffer.set_text(text);
            self.after_external_edit();
        }

        fn after_external_edit(&mut self) {
            self.cursor = self.buffer.clamp_offset(self.cursor);
            self.reparse.arm(self.clock.now());
            self.invalidate();
            debug!(revision = self.buffer.revision(), "external edit; reparse armed");
        }

        /* -------------------------------- timers -------------------------------- */

        /// Picks up catalog replacements and runs whichever timers are due.
        pub fn tick(&mut self) -> Result<TickReport, SyncError> {
            let mut report = TickReport {
                catalog_version: self.drain_catalog_updates(),
                ..TickReport::default()
            };
            let now = self.clock.now();
            if self.reparse.fire_if_due(now) {
                self.reparse_now();
                report.reparsed = true;
            }
            if self.close_decision.fire_if_due(now) && self.pending_close.is_some() {
                self.settle(&mut report);
                report.persisted = self.persist()?;
            }
            Ok(report)
        }

        /// Settles the pending close decision and any pending reparse right away.
        pub fn flush(&mut self) -> Result<TickReport, SyncError> {
            let mut report = TickReport {
                catalog_version: self.drain_catalog_updates(),
                ..TickReport::default()
            };
            if self.pending_close.is_some() {
                self.settle(&mut report);
                report.persisted = self.persist()?;
            }
            if self.reparse.is_armed() {
                self.reparse_now();
                report.reparsed = true;
            }
            Ok(report)
        }

        /// Cancels both timers. An outstanding close decision is discarded.
        pub fn shutdown(&mut self) {
            self.reparse.cancel();
            self.close_decision.cancel();
            if let Some(id) = self.pending_close.take() {
                if let Some(node) = Arc::make_mut(&mut self.forest).find_mut(id) {
                    node.suppress_auto_closed(false);
                }
                debug!(%id, "discarded pending close decision");
            }
        }

        /* ------------------------------- reparse ------------------------------- */

        /// Rebuilds the tree from the buffer now, carrying node ids over.
        pub fn reparse_now(&mut self) {
            let fresh = self.build();
            self.install(fresh, None);
        }

        /// Starts a parse of the current buffer on a worker thread.
        pub fn spawn_reparse(&self) -> ParseJob {
            let text = self.buffer.text().to_string();
            let catalog = Arc::clone(&self.catalog.catalog);
            let now = self.clock.now();
            let path = self.path.clone();
            let handle = thread::spawn(move || {
                OutlineTreeBuilder::new(&catalog)
                    .with_now(now)
                    .with_path(path)
                    .parse(&text)
            });
            ParseJob {
                revision: self.buffer.revision(),
                handle,
            }
        }

        /// Installs a finished background parse. A parse of an older buffer revision is
        /// discarded and `false` returned.
        pub fn install_reparse(&mut self, job: ParseJob) -> Result<bool, SyncError> {
            let fresh = job.handle.join().map_err(|_| SyncError::WorkerPanicked)?;
            if job.revision != self.buffer.revision() {
                debug!(
                    job = job.revision,
                    buffer = self.buffer.revision(),
                    "discarding stale background parse"
                );
                return Ok(false);
            }
            self.install(fresh, None);
            Ok(true)
        }

        fn install(&mut self, mut fresh: Forest, line_map: Option<&dyn Fn(usize) -> Option<usize>>) {
            let kept = match line_map {
                Some(map) => tree::reassociate_by_line(&self.forest, &mut fresh, map),
                None => tree::reassociate_ids(&self.forest, &mut fresh),
            };
            // a node inside its close window keeps the CLOSED value it had
            if let Some(id) = self.pending_close {
                let before = self.forest.find(id).map(OutlineNode::closed);
                if let (Some(closed), Some(node)) = (before, fresh.find_mut(id)) {
                    node.closed = closed;
                    node.suppress_auto_closed = true;
                }
            }
            self.reparse.cancel();
            debug!(nodes = fresh.len(), kept, "tree rebuilt");
            self.forest = Arc::new(fresh);
            self.invalidate();
        }

        fn ensure_fresh(&mut self) {
            if self.reparse.is_armed() {
                self.reparse_now();
            }
        }

        /* ------------------------------- catalog ------------------------------- */

        /// Swaps in a newer catalog. Older or equal versions are ignored. The buffer is
        /// not touched; classification and styling follow the new catalog from now on.
        pub fn replace_catalog(&mut self, snapshot: CatalogSnapshot) -> bool {
            if snapshot.version <= self.catalog.version {
                return false;
            }
            info!(
                version = snapshot.version,
                states = snapshot.catalog.len(),
                "state catalog replaced"
            );
            self.catalog = snapshot;
            self.invalidate();
            true
        }

        fn drain_catalog_updates(&mut self) -> Option<u64> {
            let mut latest = None;
            if let Some(rx) = &self.catalog_updates {
                loop {
                    match rx.try_recv() {
                        Ok(snapshot) => latest = Some(snapshot),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            debug!("catalog provider dropped");
                            break;
                        }
                    }
                }
            }
            let snapshot = latest?;
            let version = snapshot.version;
            self.replace_catalog(snapshot).then_some(version)
        }

        /* ----------------------------- state cycling ----------------------------- */

        /// Advances the workflow state of the heading under `offset`.
        ///
        /// Only the heading line is rewritten and CLOSED is left alone; the close
        /// decision runs once the close-decision timer expires without another cycle.
        pub fn cycle_state(&mut self, offset: usize) -> Result<CycleOutcome, SyncError> {
            // line numbers below are read against an up-to-date tree
            self.ensure_fresh();
            let catalog = Arc::clone(&self.catalog.catalog);
            let mut line_idx = self.buffer.line_of_offset(self.buffer.clamp_offset(offset));
            let Some(fields) = self
                .buffer
                .line(line_idx)
                .and_then(|l| headline::decode(l, &catalog))
            else {
                return Ok(CycleOutcome::NotAHeading);
            };

            let other_pending = self.pending_close.is_some_and(|id| {
                self.forest.find(id).and_then(OutlineNode::line) != Some(line_idx)
            });
            let mut persist_error = None;
            if other_pending {
                let mut report = TickReport::default();
                if let Some(removed) = self.settle(&mut report) {
                    if removed < line_idx {
                        line_idx -= 1;
                    }
                }
                // the earlier decision is already in the text; the new cycle still runs
                if let Err(e) = self.persist() {
                    persist_error = Some(e.to_string());
                }
            }

            let now = self.clock.now();
            let from = fields.state.clone();
            let to = catalog.next_state(from.as_deref()).map(|d| d.name.clone());
            let mut next = fields.clone();
            next.state = to.clone();

            let node_id = self.resolve_heading(line_idx, &fields);
            self.buffer.replace_line(line_idx, &headline::encode(&next));
            self.cursor = self.title_cursor(line_idx, &next);
            self.invalidate();

            let Some(node_id) = node_id else {
                warn!(line = line_idx, "no node for this heading; cycled the text only");
                self.reparse.arm(now);
                return Ok(CycleOutcome::TextOnly {
                    from,
                    to,
                    cursor: self.cursor,
                    persist_error,
                });
            };

            if let Some(node) = Arc::make_mut(&mut self.forest).find_mut(node_id) {
                node.suppress_auto_closed(true);
                node.set_state(to.clone(), &catalog, now);
            }
            self.pending_close = Some(node_id);
            self.close_decision.arm(now);
            debug!(%node_id, ?from, ?to, "state cycled; close decision armed");

            Ok(CycleOutcome::Cycled {
                node_id,
                from,
                to,
                cursor: self.cursor,
                persist_error,
            })
        }

        fn title_cursor(&self, line: usize, fields: &HeadlineFields) -> usize {
            let start = self.buffer.line_start(line).unwrap_or(0);
            let end = self.buffer.line_end(line).unwrap_or(start);
            (start + headline::title_column(fields)).min(end)
        }

        /// The node for the heading on `line`, reparsing once if the tree disagrees.
        fn resolve_heading(&mut self, line: usize, fields: &HeadlineFields) -> Option<NodeId> {
            let lookup = |forest: &Forest| {
                forest
                    .node_at_line(line)
                    .filter(|n| n.depth == fields.depth && n.title == fields.title)
                    .map(OutlineNode::id)
            };
            if let Some(id) = lookup(self.forest.as_ref()) {
                return Some(id);
            }
            warn!(line, "tree out of step with the buffer; reparsing");
            self.reparse_now();
            lookup(self.forest.as_ref())
        }

        /// Stamps or clears CLOSED on the pending node to match its settled state. The
        /// caller persists. Returns the buffer line removed along the way, if any.
        fn settle(&mut self, report: &mut TickReport) -> Option<usize> {
            let id = self.pending_close?;
            self.close_decision.cancel();
            let catalog = Arc::clone(&self.catalog.catalog);
            let now = self.clock.now();
            // still pending while locating, so a reparse keeps the node's window state
            let located = self.locate(id);
            self.pending_close = None;
            let Ok(line) = located else {
                debug!(%id, "node vanished before its close decision");
                return None;
            };
            let node = Arc::make_mut(&mut self.forest).find_mut(id)?;
            node.suppress_auto_closed(false);
            let change = node.reconcile_closed(&catalog, now);
            let closed = node.closed;
            let planning_line = node.planning_line;

            let mut removed = None;
            match change {
                ClosedChange::Unchanged => debug!(%id, "close decision: CLOSED already matches"),
                ClosedChange::Stamped => {
                    debug!(%id, "close decision: stamped");
                    report.closed_stamped.push(id);
                    self.rewrite_heading(line, |f| f.closed = closed);
                }
                ClosedChange::Cleared => {
                    debug!(%id, "close decision: cleared");
                    report.closed_cleared.push(id);
                    self.rewrite_heading(line, |f| f.closed = None);
                    removed = self.strip_planning_closed(planning_line);
                }
            }
            self.invalidate();
            removed
        }

        /// Drops a CLOSED stamp from a planning line; removes the line when nothing is
        /// left on it and returns its index.
        fn strip_planning_closed(&mut self, planning_line: Option<usize>) -> Option<usize> {
            let idx = planning_line?;
            let text = self.buffer.line(idx)?;
            let mut planning = headline::decode_planning(text)?;
            planning.closed.take()?;
            let indent = leading_ws(text).to_string();
            match headline::encode_planning(&planning, &indent) {
                Some(line) => {
                    self.buffer.replace_line(idx, &line);
                    None
                }
                None => {
                    self.remove_buffer_lines(idx, 1);
                    Some(idx)
                }
            }
        }

        fn persist(&self) -> Result<bool, SyncError> {
            let (Some(store), Some(path)) = (&self.store, &self.path) else {
                return Ok(false);
            };
            store.write_text(path, self.buffer.text()).map_err(|e| {
                warn!(?path, error = %format!("{e:#}"), "persisting document failed");
                SyncError::Persist {
                    path: path.clone(),
                    message: format!("{e:#}"),
                }
            })?;
            debug!(?path, "document persisted");
            Ok(true)
        }

        /* --------------------------- targeted edits --------------------------- */

        pub fn cycle_priority(&mut self, id: NodeId) -> Result<Option<Priority>, SyncError> {
            let line = self.locate(id)?;
            let next = self.node_mut(id)?.cycle_priority();
            self.rewrite_heading(line, |f| f.priority = next);
            self.invalidate();
            Ok(next)
        }

        /// Returns `false` when the tag was already there.
        pub fn add_tag(&mut self, id: NodeId, tag: &str) -> Result<bool, SyncError> {
            let line = self.locate(id)?;
            let node = self.node_mut(id)?;
            if !node.add_tag(tag)? {
                return Ok(false);
            }
            let tags = node.tags.clone();
            self.rewrite_heading(line, |f| f.tags = tags);
            self.invalidate();
            Ok(true)
        }

        pub fn remove_tag(&mut self, id: NodeId, tag: &str) -> Result<bool, SyncError> {
            let line = self.locate(id)?;
            let node = self.node_mut(id)?;
            if !node.remove_tag(tag) {
                return Ok(false);
            }
            let tags = node.tags.clone();
            self.rewrite_heading(line, |f| f.tags = tags);
            self.invalidate();
            Ok(true)
        }

        pub fn set_scheduled(&mut self, id: NodeId, date: Option<NaiveDate>) -> Result<(), SyncError> {
            self.set_planning(id, PlanningField::Scheduled, date.map(Timestamp::active))
        }

        pub fn set_deadline(&mut self, id: NodeId, date: Option<NaiveDate>) -> Result<(), SyncError> {
            self.set_planning(id, PlanningField::Deadline, date.map(Timestamp::active))
        }

        fn set_planning(
            &mut self,
            id: NodeId,
            field: PlanningField,
            value: Option<Timestamp>,
        ) -> Result<(), SyncError> {
            self.ensure_fresh();
            let line = self.locate(id)?;
            let node = self.node_mut(id)?;
            match field {
                PlanningField::Scheduled => node.set_scheduled(value),
                PlanningField::Deadline => node.set_deadline(value),
            }
            let planning_line = node.planning_line;

            let mut planning = planning_line
                .and_then(|l| self.buffer.line(l))
                .and_then(headline::decode_planning)
                .unwrap_or_default();
            match field {
                PlanningField::Scheduled => planning.scheduled = value,
                PlanningField::Deadline => planning.deadline = value,
            }

            match planning_line {
                Some(idx) => {
                    let indent = self.buffer.line(idx).map(leading_ws).unwrap_or_default().to_string();
                    match headline::encode_planning(&planning, &indent) {
                        Some(text) => {
                            self.buffer.replace_line(idx, &text);
                        }
                        None => self.remove_buffer_lines(idx, 1),
                    }
                }
                None => {
                    if let Some(text) = headline::encode_planning(&planning, "") {
                        let at = line + 1;
                        self.insert_buffer_line(at, &text);
                        let node = self.node_mut(id)?;
                        node.planning_line = Some(at);
                        node.last_line = Some(node.last_line.map_or(at, |l| l.max(at)));
                    }
                }
            }
            self.invalidate();
            Ok(())
        }

        /// Sets one property, creating the drawer when the node has none.
        pub fn set_property(&mut self, id: NodeId, key: &str, value: &str) -> Result<(), SyncError> {
            let key = key.trim();
            if key.is_empty() || key.contains(':') || key.chars().any(char::is_whitespace) {
                return Err(DomainError::InvalidPropertyKey(key.to_string()).into());
            }
            self.ensure_fresh();
            let line = self.locate(id)?;
            let node = self.node_mut(id)?;
            node.set_property(key, value.trim());
            let (drawer, planning_line) = (node.drawer, node.planning_line);
            let entry = headline::encode_property(key, value.trim());

            match drawer {
                Some((start, end)) => {
                    let existing = (start + 1..end).find(|&l| {
                        self.buffer
                            .line(l)
                            .and_then(headline::decode_property)
                            .is_some_and(|(k, _)| k == key)
                    });
                    match existing {
                        Some(l) => {
                            self.buffer.replace_line(l, &entry);
                        }
                        None => self.insert_buffer_line(end, &entry),
                    }
                }
                None => {
                    let at = planning_line.map_or(line, |p| p.max(line)) + 1;
                    self.insert_buffer_line(at, ":PROPERTIES:");
                    self.insert_buffer_line(at + 1, &entry);
                    self.insert_buffer_line(at + 2, ":END:");
                    let node = self.node_mut(id)?;
                    node.drawer = Some((at, at + 2));
                    node.last_line = Some(node.last_line.map_or(at + 2, |l| l.max(at + 2)));
                }
            }
            self.invalidate();
            Ok(())
        }

        /// Appends a new heading as the last child of `parent`.
        pub fn add_child(&mut self, parent: NodeId, title: &str) -> Result<NodeId, SyncError> {
            self.ensure_fresh();
            self.locate(parent)?;
            let parent_node = self
                .forest
                .find(parent)
                .ok_or(DomainError::NodeNotFound(parent))?;
            let depth = parent_node.depth + 1;
            let last = parent_node.subtree_last_line().unwrap_or(0);

            // keep a final empty line (text ending in a newline) at the end of the buffer
            let trailing_blank = last + 1 == self.buffer.line_count()
                && Some(last) != parent_node.line
                && self.buffer.line(last).is_some_and(str::is_empty);
            let at = if trailing_blank { last } else { last + 1 };

            let text = headline::encode(&HeadlineFields::new(depth, title.replace(['\n', '\r'], " ")));
            let fields = headline::decode(&text, &self.catalog.catalog)
                .unwrap_or_else(|| HeadlineFields::new(depth, title));
            let now = self.clock.now();
            let mut child = OutlineNode::new(depth, fields.title);
            child.state = fields.state;
            child.priority = fields.priority;
            child.tags = fields.tags;
            child.closed = fields.closed;
            child.created = now;
            child.last_modified = now;
            child.reconcile_closed(&self.catalog.catalog, now);
            child.line = Some(at);
            child.last_line = Some(if trailing_blank { at + 1 } else { at });

            let child_text = headline::encode(&format::headline_fields(&child));
            self.insert_buffer_line(at, &child_text);
            let forest = Arc::make_mut(&mut self.forest);
            if trailing_blank {
                tree::for_each_mut(&mut forest.roots, &mut |n| {
                    if n.last_line == Some(at + 1) {
                        n.last_line = Some(at.saturating_sub(1).max(n.line.unwrap_or(0)));
                    }
                });
            }
            let id = forest
                .find_mut(parent)
                .ok_or(DomainError::NodeNotFound(parent))?
                .add_child(child);
            self.invalidate();
            debug!(%parent, %id, line = at, "child added");
            Ok(id)
        }

        /// Removes a node and its whole subtree from the tree and the buffer.
        pub fn remove_child(&mut self, id: NodeId) -> Result<OutlineNode, SyncError> {
            self.ensure_fresh();
            let line = self.locate(id)?;
            let last = self.forest.subtree_last_line(id).unwrap_or(line);
            let keep_trailing_blank = last + 1 == self.buffer.line_count()
                && last > line
                && self.buffer.line(last).is_some_and(str::is_empty);
            let end = if keep_trailing_blank { last } else { last + 1 };

            let removed = Arc::make_mut(&mut self.forest)
                .remove(id)
                .ok_or(DomainError::NodeNotFound(id))?;
            self.remove_buffer_lines(line, end - line);
            if keep_trailing_blank {
                if let Some(before) = line.checked_sub(1) {
                    tree::for_each_mut(&mut Arc::make_mut(&mut self.forest).roots, &mut |n| {
                        if n.last_line == Some(before) {
                            n.last_line = Some(line);
                        }
                    });
                }
            }
            if self.pending_close.is_some_and(|p| removed.find(p).is_some()) {
                self.pending_close = None;
                self.close_decision.cancel();
            }
            self.invalidate();
            debug!(%id, lines = end - line, "subtree removed");
            Ok(removed)
        }

        pub fn promote(&mut self, id: NodeId) -> Result<(), SyncError> {
            self.shift_subtree_depth(id, -1)
        }

        pub fn demote(&mut self, id: NodeId) -> Result<(), SyncError> {
            self.shift_subtree_depth(id, 1)
        }

        /// Rewrites the heading markers of a whole subtree, then rebuilds the tree,
        /// since neighbours may change parents. Ids follow the heading lines.
        fn shift_subtree_depth(&mut self, id: NodeId, delta: isize) -> Result<(), SyncError> {
            self.ensure_fresh();
            self.locate(id)?;
            let node = self.forest.find(id).ok_or(DomainError::NodeNotFound(id))?;
            if delta < 0 && node.depth <= 1 {
                return Err(DomainError::CannotPromote(id).into());
            }
            let mut subtree = Vec::new();
            node.walk(&mut subtree);
            let lines: Vec<usize> = subtree.iter().filter_map(|n| n.line).collect();

            for line in lines {
                let Some(text) = self.buffer.line(line) else {
                    continue;
                };
                let stars = text.chars().take_while(|c| *c == '*').count();
                let depth = (stars as isize + delta).max(1) as usize;
                let updated = format!("{}{}", "*".repeat(depth), &text[stars..]);
                self.buffer.replace_line(line, &updated);
            }
            let fresh = self.build();
            let same_line = |line: usize| Some(line);
            self.install(fresh, Some(&same_line));
            Ok(())
        }

        /* ------------------------------- queries ------------------------------- */

        pub fn extract_links(&self, id: NodeId) -> Result<Vec<Link>, SyncError> {
            let node = self.forest.find(id).ok_or(DomainError::NodeNotFound(id))?;
            Ok(links::node_links(node))
        }

        pub fn compute_fold_regions(&mut self) -> Vec<FoldRegion> {
            self.presentation().fold_regions.clone()
        }

        pub fn node_summary(&mut self, id: NodeId) -> Option<NodeSummary> {
            self.presentation().summaries.get(&id).cloned()
        }

        /// Cached derived values; rebuilt on first access after any change.
        pub fn presentation(&mut self) -> &Presentation {
            if self.presentation.is_none() {
                let built = self.build_presentation();
                self.presentation = Some(built);
            }
            self.presentation.get_or_insert_with(Presentation::default)
        }

        fn build_presentation(&self) -> Presentation {
            let catalog = &self.catalog.catalog;
            let today = self.clock.now().date();
            let summaries = self
                .forest
                .nodes()
                .into_iter()
                .map(|n| {
                    let definition = n.state().and_then(|s| catalog.get(s));
                    let summary = NodeSummary {
                        class: definition.map(|d| d.class),
                        color: definition.and_then(|d| d.color.clone()),
                        is_completed: n.is_completed(catalog),
                        requires_action: n.requires_action(catalog),
                        is_overdue: n.is_overdue(catalog, today),
                        stats: n.stats(catalog, today),
                    };
                    (n.id(), summary)
                })
                .collect();
            Presentation {
                summaries,
                fold_regions: fold::compute_regions(&self.forest, &self.buffer),
            }
        }

        /* ------------------------------- helpers ------------------------------- */

        fn invalidate(&mut self) {
            self.presentation = None;
        }

        fn node_mut(&mut self, id: NodeId) -> Result<&mut OutlineNode, SyncError> {
            Arc::make_mut(&mut self.forest)
                .find_mut(id)
                .ok_or(SyncError::Domain(DomainError::NodeNotFound(id)))
        }

        /// Heading line of `id`, checked against the buffer.
        fn verified_line(&self, id: NodeId) -> Option<usize> {
            let node = self.forest.find(id)?;
            let line = node.line?;
            let fields = headline::decode(self.buffer.line(line)?, &self.catalog.catalog)?;
            (fields.depth == node.depth && fields.title == node.title).then_some(line)
        }

        fn locate(&mut self, id: NodeId) -> Result<usize, SyncError> {
            if let Some(line) = self.verified_line(id) {
                return Ok(line);
            }
            warn!(%id, "node not where the tree says it is; reparsing");
            self.reparse_now();
            self.verified_line(id)
                .ok_or(SyncError::Domain(DomainError::NodeNotFound(id)))
        }

        fn rewrite_heading(&mut self, line: usize, edit: impl FnOnce(&mut HeadlineFields)) -> bool {
            let Some(current) = self.buffer.line(line) else {
                return false;
            };
            let Some(updated) = headline::rewrite(current, &self.catalog.catalog, edit) else {
                return false;
            };
            if updated == current {
                return false;
            }
            self.buffer.replace_line(line, &updated).is_some()
        }

        fn insert_buffer_line(&mut self, at: usize, content: &str) {
            if self.buffer.insert_line(at, content) {
                Arc::make_mut(&mut self.forest).shift_lines_inserted(at, 1);
            }
        }

        fn remove_buffer_lines(&mut self, start: usize, count: usize) {
            if self.buffer.remove_lines(start..start + count) {
                Arc::make_mut(&mut self.forest).shift_lines_removed(start, count);
            }
        }
    }

}

pub use format::serialize;
pub use sync::{SyncConfig, SyncCoordinator};
pub use tree::{OutlineTreeBuilder, parse};
