//! Predicates over accessibility-tree nodes.
//!
//! A [`Finder`] never holds a node. It is a conjunction of constraints that is
//! evaluated against a tree snapshot; ancestor and descendant constraints
//! refer to other finders by value.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use super::node::{NodeInfo, NodeRef, Role};
use crate::error::{CujError, Result};

#[derive(Clone, Debug)]
enum TextMatch {
    Exact(String),
    Contains(String),
    Prefix(String),
    Pattern(Regex),
    /// Whitespace-separated token, as for HTML class lists.
    Token(String),
}

impl TextMatch {
    fn matches(&self, text: &str) -> bool {
        match self {
            TextMatch::Exact(expected) => text == expected,
            TextMatch::Contains(needle) => text.contains(needle.as_str()),
            TextMatch::Prefix(prefix) => text.starts_with(prefix.as_str()),
            TextMatch::Pattern(pattern) => pattern.is_match(text),
            TextMatch::Token(token) => text.split_whitespace().any(|part| part == token),
        }
    }

    fn describe(&self) -> String {
        match self {
            TextMatch::Exact(expected) => format!("{expected:?}"),
            TextMatch::Contains(needle) => format!("containing {needle:?}"),
            TextMatch::Prefix(prefix) => format!("starting with {prefix:?}"),
            TextMatch::Pattern(pattern) => format!("/{}/", pattern.as_str()),
            TextMatch::Token(token) => format!("with class token {token:?}"),
        }
    }
}

type StrPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Constraint on a single node attribute.
#[derive(Clone)]
pub enum AttrMatch {
    Bool(bool),
    Str(String),
    Predicate { label: String, test: StrPredicate },
}

impl AttrMatch {
    pub fn predicate<F>(label: impl Into<String>, test: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        AttrMatch::Predicate {
            label: label.into(),
            test: Arc::new(test),
        }
    }

    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            // Missing boolean attributes read as false.
            AttrMatch::Bool(expected) => {
                value.and_then(Value::as_bool).unwrap_or(false) == *expected
            }
            AttrMatch::Str(expected) => value.and_then(Value::as_str) == Some(expected.as_str()),
            AttrMatch::Predicate { test, .. } => match value {
                Some(Value::String(text)) => test(text),
                Some(other) => test(&other.to_string()),
                None => false,
            },
        }
    }
}

impl fmt::Debug for AttrMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrMatch::Bool(value) => write!(f, "{value}"),
            AttrMatch::Str(value) => write!(f, "{value:?}"),
            AttrMatch::Predicate { label, .. } => write!(f, "<{label}>"),
        }
    }
}

impl From<bool> for AttrMatch {
    fn from(value: bool) -> Self {
        AttrMatch::Bool(value)
    }
}

impl From<&str> for AttrMatch {
    fn from(value: &str) -> Self {
        AttrMatch::Str(value.to_string())
    }
}

impl From<String> for AttrMatch {
    fn from(value: String) -> Self {
        AttrMatch::Str(value)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Selection {
    #[default]
    Unique,
    Nth(usize),
}

#[derive(Clone, Debug, Default)]
pub struct Finder {
    role: Option<Role>,
    name: Option<TextMatch>,
    class_name: Option<TextMatch>,
    attributes: Vec<(String, AttrMatch)>,
    ancestor: Option<Box<Finder>>,
    descendant: Option<Box<Finder>>,
    selection: Selection,
    root: bool,
}

impl Finder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches only the root of the tree.
    pub fn root() -> Self {
        Self {
            root: true,
            ..Self::default()
        }
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(TextMatch::Exact(name.into()));
        self
    }

    pub fn name_containing(mut self, needle: impl Into<String>) -> Self {
        self.name = Some(TextMatch::Contains(needle.into()));
        self
    }

    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name = Some(TextMatch::Prefix(prefix.into()));
        self
    }

    pub fn name_regex(mut self, pattern: Regex) -> Self {
        self.name = Some(TextMatch::Pattern(pattern));
        self
    }

    pub fn class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(TextMatch::Exact(class_name.into()));
        self
    }

    pub fn class_regex(mut self, pattern: Regex) -> Self {
        self.class_name = Some(TextMatch::Pattern(pattern));
        self
    }

    pub fn has_class(mut self, token: impl Into<String>) -> Self {
        self.class_name = Some(TextMatch::Token(token.into()));
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, expected: impl Into<AttrMatch>) -> Self {
        self.attributes.push((key.into(), expected.into()));
        self
    }

    pub fn focused(self) -> Self {
        self.attribute("focused", true)
    }

    pub fn visible(self) -> Self {
        self.attribute("invisible", false)
    }

    pub fn onscreen(self) -> Self {
        self.attribute("offscreen", false)
    }

    /// Some proper ancestor must match `ancestor`.
    pub fn ancestor(mut self, ancestor: Finder) -> Self {
        self.ancestor = Some(Box::new(ancestor));
        self
    }

    /// Some proper descendant must match `descendant`.
    pub fn descendant(mut self, descendant: Finder) -> Self {
        self.descendant = Some(Box::new(descendant));
        self
    }

    /// Pick the `n`th match in document order; `nth(0)` is `first()`.
    pub fn nth(mut self, n: usize) -> Self {
        self.selection = Selection::Nth(n);
        self
    }

    pub fn first(self) -> Self {
        self.nth(0)
    }

    /// Innermost finder along the ancestor chain.
    pub fn final_ancestor(&self) -> &Finder {
        let mut current = self;
        while let Some(ancestor) = current.ancestor.as_deref() {
            current = ancestor;
        }
        current
    }

    /// Local constraints only: role, name, class and attributes.
    pub fn matches_node(&self, node: &NodeInfo) -> bool {
        if let Some(role) = self.role {
            if node.role != role {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if !name.matches(&node.name) {
                return false;
            }
        }
        if let Some(class_name) = &self.class_name {
            if !class_name.matches(&node.class_name) {
                return false;
            }
        }
        self.attributes
            .iter()
            .all(|(key, expected)| expected.matches(node.attributes.get(key)))
    }

    /// Full match of the last node on `lineage` (root first).
    fn matches_lineage(&self, lineage: &[&NodeInfo]) -> bool {
        let Some((node, ancestors)) = lineage.split_last() else {
            return false;
        };
        if self.root && !ancestors.is_empty() {
            return false;
        }
        if !self.matches_node(node) {
            return false;
        }
        if let Some(ancestor) = &self.ancestor {
            let found = (0..ancestors.len()).any(|end| ancestor.matches_lineage(&lineage[..=end]));
            if !found {
                return false;
            }
        }
        if let Some(descendant) = &self.descendant {
            let mut stack = lineage.to_vec();
            if !subtree_has_match(descendant, &mut stack) {
                return false;
            }
        }
        true
    }

    /// Every node in `root` (including `root` itself) that matches, in
    /// depth-first document order.
    pub fn find_all(&self, root: &NodeInfo) -> Vec<NodeRef> {
        let mut matches = Vec::new();
        let mut lineage = vec![root];
        let mut path = Vec::new();
        self.collect(&mut lineage, &mut path, &mut matches);
        matches
    }

    fn collect<'a>(
        &self,
        lineage: &mut Vec<&'a NodeInfo>,
        path: &mut Vec<usize>,
        matches: &mut Vec<NodeRef>,
    ) {
        let Some(node) = lineage.last().copied() else {
            return;
        };
        if self.matches_lineage(lineage) {
            matches.push(NodeRef {
                path: path.clone(),
                info: node.shallow(),
            });
        }
        for (index, child) in node.children.iter().enumerate() {
            lineage.push(child);
            path.push(index);
            self.collect(lineage, path, matches);
            path.pop();
            lineage.pop();
        }
    }

    /// Resolve this finder against a tree snapshot.
    pub fn select(&self, root: &NodeInfo) -> Result<NodeRef> {
        let mut matches = self.find_all(root);
        match self.selection {
            Selection::Nth(n) => {
                if n < matches.len() {
                    Ok(matches.swap_remove(n))
                } else {
                    Err(CujError::NotFound(self.pretty()))
                }
            }
            Selection::Unique => match matches.len() {
                0 => Err(CujError::NotFound(self.pretty())),
                1 => Ok(matches.remove(0)),
                _ => Err(CujError::TooGeneric(self.pretty())),
            },
        }
    }

    /// Human-readable rendering used in failure messages.
    pub fn pretty(&self) -> String {
        let mut parts = Vec::new();
        if self.root {
            parts.push("root".to_string());
        }
        if let Some(role) = self.role {
            parts.push(format!("role: {role}"));
        }
        if let Some(name) = &self.name {
            parts.push(format!("name: {}", name.describe()));
        }
        if let Some(class_name) = &self.class_name {
            parts.push(format!("class: {}", class_name.describe()));
        }
        for (key, expected) in &self.attributes {
            parts.push(format!("{key}: {expected:?}"));
        }
        if let Some(ancestor) = &self.ancestor {
            parts.push(format!("ancestor: {{{}}}", ancestor.pretty()));
        }
        if let Some(descendant) = &self.descendant {
            parts.push(format!("descendant: {{{}}}", descendant.pretty()));
        }
        match self.selection {
            Selection::Nth(0) => parts.push("first".to_string()),
            Selection::Nth(n) => parts.push(format!("nth: {n}")),
            Selection::Unique => {}
        }
        if parts.is_empty() {
            "any node".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl fmt::Display for Finder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty())
    }
}

fn subtree_has_match<'a>(finder: &Finder, lineage: &mut Vec<&'a NodeInfo>) -> bool {
    let Some(node) = lineage.last().copied() else {
        return false;
    };
    for child in &node.children {
        lineage.push(child);
        let hit = finder.matches_lineage(lineage) || subtree_has_match(finder, lineage);
        lineage.pop();
        if hit {
            return true;
        }
    }
    false
}

pub fn role(role: Role) -> Finder {
    Finder::new().role(role)
}

pub fn name(name: impl Into<String>) -> Finder {
    Finder::new().name(name)
}

pub fn class_name(class_name: impl Into<String>) -> Finder {
    Finder::new().class_name(class_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::uiauto::node::Rect;

    fn shelf_tree() -> NodeInfo {
        NodeInfo::new(Role::Window, "desktop").with_children(vec![
            NodeInfo::new(Role::Toolbar, "Shelf")
                .with_class("ShelfView")
                .with_children(vec![
                    NodeInfo::new(Role::Button, "Launcher")
                        .with_class("ash/HomeButton")
                        .at(Rect::new(0, 700, 48, 48)),
                    NodeInfo::new(Role::Button, "Chrome")
                        .with_class("ShelfAppButton")
                        .with_attribute("focused", true),
                    NodeInfo::new(Role::Button, "Files").with_class("ShelfAppButton"),
                ]),
            NodeInfo::new(Role::Dialog, "Settings").with_children(vec![
                NodeInfo::new(Role::Button, "Chrome").with_class("MdTextButton primary"),
            ]),
        ])
    }

    #[test]
    fn empty_tree_is_not_found() {
        let err = role(Role::Button).select(&NodeInfo::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("role: button"));
    }

    #[test]
    fn multiple_matches_are_too_generic_unless_first() {
        let tree = shelf_tree();
        let err = role(Role::Button).class_name("ShelfAppButton").select(&tree).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TooGeneric);

        let first = role(Role::Button)
            .class_name("ShelfAppButton")
            .first()
            .select(&tree)
            .unwrap();
        assert_eq!(first.info.name, "Chrome");
        assert_eq!(first.path, vec![0, 1]);
    }

    #[test]
    fn nth_indexes_document_order() {
        let tree = shelf_tree();
        let third = role(Role::Button).nth(2).select(&tree).unwrap();
        assert_eq!(third.info.name, "Files");
        assert!(role(Role::Button).nth(9).select(&tree).is_err());
    }

    #[test]
    fn ancestor_constraint_disambiguates() {
        let tree = shelf_tree();
        let in_dialog = name("Chrome")
            .ancestor(role(Role::Dialog))
            .select(&tree)
            .unwrap();
        assert_eq!(in_dialog.path, vec![1, 0]);
        let in_shelf = name("Chrome")
            .ancestor(class_name("ShelfView"))
            .select(&tree)
            .unwrap();
        assert_eq!(in_shelf.path, vec![0, 1]);
    }

    #[test]
    fn descendant_constraint_selects_container() {
        let tree = shelf_tree();
        let container = Finder::new()
            .descendant(class_name("ash/HomeButton"))
            .nth(1)
            .select(&tree)
            .unwrap();
        assert_eq!(container.info.name, "Shelf");
    }

    #[test]
    fn attributes_and_text_matchers() {
        let tree = shelf_tree();
        assert_eq!(role(Role::Button).focused().select(&tree).unwrap().info.name, "Chrome");
        assert_eq!(
            Finder::new().name_prefix("Laun").select(&tree).unwrap().info.name,
            "Launcher"
        );
        assert_eq!(
            Finder::new().has_class("primary").select(&tree).unwrap().path,
            vec![1, 0]
        );
        let pattern = Regex::new("^F.les$").unwrap();
        assert_eq!(Finder::new().name_regex(pattern).select(&tree).unwrap().info.name, "Files");
        let by_predicate = Finder::new()
            .role(Role::Button)
            .attribute("focused", AttrMatch::predicate("truthy", |v| v == "true"));
        assert_eq!(by_predicate.select(&tree).unwrap().info.name, "Chrome");
    }

    #[test]
    fn root_matches_only_top_node() {
        let tree = shelf_tree();
        let root = Finder::root().select(&tree).unwrap();
        assert!(root.path.is_empty());
    }

    #[test]
    fn pretty_renders_nested_constraints() {
        let finder = role(Role::Button)
            .name("OK")
            .ancestor(role(Role::Dialog).name_containing("Save"))
            .first();
        assert_eq!(
            finder.pretty(),
            "role: button, name: \"OK\", ancestor: {role: dialog, name: containing \"Save\"}, first"
        );
        assert_eq!(finder.final_ancestor().pretty(), "role: dialog, name: containing \"Save\"");
    }
}
