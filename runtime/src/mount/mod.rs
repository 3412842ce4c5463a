//! The bounded container effects render into.
//!
//! A [`MountPoint`] is a small host-side element tree (rooted at the container)
//! plus the [`scheduler`] of recurring callbacks registered against it. The
//! supervisor owns the mount point; effects only ever receive a [`MountRef`],
//! a weak reference that cannot keep the container alive.

pub mod scheduler;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

use serde::Serialize;

pub use crate::mount::scheduler::CallbackId;
use crate::mount::scheduler::Scheduler;

/// Identifier of an element inside a mount point. The container itself is [`NodeId::ROOT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Default)]
struct Element {
    tag: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    style: BTreeMap<String, String>,
    attributes: BTreeMap<String, String>,
    text: String,
    /// Some handle outside the tree (a script wrapper) still refers to the node.
    held: bool,
}

#[derive(Debug)]
struct Surface {
    width: f64,
    height: f64,
    next_node: u32,
    nodes: HashMap<NodeId, Element>,
    scheduler: Scheduler,
}

/// Owning handle to the container. Cloning shares the same container.
#[derive(Debug, Clone)]
pub struct MountPoint {
    surface: Rc<RefCell<Surface>>,
}

/// Non-owning reference handed to running effects.
#[derive(Debug, Clone)]
pub struct MountRef {
    surface: Weak<RefCell<Surface>>,
}

impl MountRef {
    /// Run `f` against the mount point if its owner still holds it.
    pub fn with<R>(&self, f: impl FnOnce(&MountPoint) -> R) -> Option<R> {
        let surface = self.surface.upgrade()?;
        Some(f(&MountPoint { surface }))
    }

    pub fn is_alive(&self) -> bool {
        self.surface.strong_count() > 0
    }
}

impl MountPoint {
    /// Empty container of the given size in CSS pixels.
    pub fn new(width: f64, height: f64) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            NodeId::ROOT,
            Element {
                tag: "div".to_string(),
                ..Element::default()
            },
        );
        Self {
            surface: Rc::new(RefCell::new(Surface {
                width,
                height,
                next_node: 1,
                nodes,
                scheduler: Scheduler::default(),
            })),
        }
    }

    pub fn downgrade(&self) -> MountRef {
        MountRef {
            surface: Rc::downgrade(&self.surface),
        }
    }

    pub fn size(&self) -> (f64, f64) {
        let surface = self.surface.borrow();
        (surface.width, surface.height)
    }

    /// Number of direct children of the container.
    pub fn child_count(&self) -> usize {
        self.children(NodeId::ROOT).len()
    }

    pub fn is_empty(&self) -> bool {
        self.child_count() == 0
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.surface.borrow().nodes.contains_key(&node)
    }

    pub fn create_element(&self, tag: &str) -> NodeId {
        let mut surface = self.surface.borrow_mut();
        let id = NodeId(surface.next_node);
        surface.next_node += 1;
        surface.nodes.insert(
            id,
            Element {
                tag: tag.to_string(),
                held: true,
                ..Element::default()
            },
        );
        id
    }

    /// Number of elements in the arena, detached ones included, not counting
    /// the container.
    pub fn node_count(&self) -> usize {
        self.surface.borrow().nodes.len().saturating_sub(1)
    }

    /// Mark `node` as referenced from outside the tree again.
    pub fn retain(&self, node: NodeId) {
        if let Some(element) = self.surface.borrow_mut().nodes.get_mut(&node) {
            element.held = true;
        }
    }

    /// Drop the outside reference to `node`.
    ///
    /// A detached subtree is removed from the arena once no node in it is held.
    /// Returns how many elements were dropped.
    pub fn release(&self, node: NodeId) -> usize {
        let mut surface = self.surface.borrow_mut();
        match surface.nodes.get_mut(&node) {
            Some(element) => element.held = false,
            None => return 0,
        }
        surface.collect(node)
    }

    pub fn tag(&self, node: NodeId) -> Option<String> {
        self.surface
            .borrow()
            .nodes
            .get(&node)
            .map(|element| element.tag.clone())
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.surface.borrow().nodes.get(&node)?.parent
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.surface
            .borrow()
            .nodes
            .get(&node)
            .map(|element| element.children.clone())
            .unwrap_or_default()
    }

    /// Move `child` to the end of `parent`'s children.
    ///
    /// Returns false for unknown nodes, for the container itself, and when the
    /// move would make a node its own ancestor.
    pub fn append_child(&self, parent: NodeId, child: NodeId) -> bool {
        self.insert_child(parent, child, None)
    }

    /// Move `child` before `reference` among `parent`'s children.
    pub fn insert_before(&self, parent: NodeId, child: NodeId, reference: NodeId) -> bool {
        self.insert_child(parent, child, Some(reference))
    }

    pub fn remove_child(&self, parent: NodeId, child: NodeId) -> bool {
        let mut surface = self.surface.borrow_mut();
        let is_child = surface
            .nodes
            .get(&child)
            .is_some_and(|element| element.parent == Some(parent));
        if !is_child {
            return false;
        }
        surface.detach(child);
        surface.collect(child);
        true
    }

    /// Set an inline style property; an empty value removes it.
    pub fn set_style(&self, node: NodeId, property: &str, value: &str) {
        let mut surface = self.surface.borrow_mut();
        let Some(element) = surface.nodes.get_mut(&node) else {
            return;
        };
        if value.is_empty() {
            element.style.remove(property);
        } else {
            element.style.insert(property.to_string(), value.to_string());
        }
    }

    pub fn style(&self, node: NodeId, property: &str) -> Option<String> {
        self.surface
            .borrow()
            .nodes
            .get(&node)?
            .style
            .get(property)
            .cloned()
    }

    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) {
        if let Some(element) = self.surface.borrow_mut().nodes.get_mut(&node) {
            element.attributes.insert(name.to_string(), value.to_string());
        }
    }

    pub fn remove_attribute(&self, node: NodeId, name: &str) {
        if let Some(element) = self.surface.borrow_mut().nodes.get_mut(&node) {
            element.attributes.remove(name);
        }
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.surface
            .borrow()
            .nodes
            .get(&node)?
            .attributes
            .get(name)
            .cloned()
    }

    /// Replace `node`'s children with plain text (`textContent` semantics).
    pub fn set_text(&self, node: NodeId, text: &str) {
        let mut surface = self.surface.borrow_mut();
        if !surface.nodes.contains_key(&node) {
            return;
        }
        surface.remove_descendants(node);
        if let Some(element) = surface.nodes.get_mut(&node) {
            element.text = text.to_string();
        }
    }

    /// Own text followed by the text of all descendants, in document order.
    pub fn text(&self, node: NodeId) -> String {
        let surface = self.surface.borrow();
        let mut out = String::new();
        surface.collect_text(node, &mut out);
        out
    }

    /// Layout size of `node`: the container's size for the root, otherwise
    /// the pixel values of its `width`/`height` styles (0 when absent).
    pub fn node_size(&self, node: NodeId) -> (f64, f64) {
        if node == NodeId::ROOT {
            return self.size();
        }
        let surface = self.surface.borrow();
        let Some(element) = surface.nodes.get(&node) else {
            return (0.0, 0.0);
        };
        (
            parse_px(element.style.get("width")),
            parse_px(element.style.get("height")),
        )
    }

    /// Remove every child of the container. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut surface = self.surface.borrow_mut();
        let removed = surface
            .nodes
            .get(&NodeId::ROOT)
            .map_or(0, |root| root.children.len());
        surface.remove_descendants(NodeId::ROOT);
        removed
    }

    /// Restore the pristine container: no elements, detached ones included,
    /// no pending callbacks, and no style, attributes or text on the container.
    pub fn reset(&self) -> MountReset {
        let mut surface = self.surface.borrow_mut();
        let children_removed = surface
            .nodes
            .get(&NodeId::ROOT)
            .map_or(0, |root| root.children.len());
        surface.nodes.retain(|id, _| *id == NodeId::ROOT);
        if let Some(root) = surface.nodes.get_mut(&NodeId::ROOT) {
            root.children.clear();
            root.style.clear();
            root.attributes.clear();
            root.text.clear();
        }
        let callbacks_cancelled = surface.scheduler.cancel_all();
        MountReset {
            children_removed,
            callbacks_cancelled,
        }
    }

    pub fn now(&self) -> f64 {
        self.surface.borrow().scheduler.now()
    }

    pub fn request_frame(&self) -> CallbackId {
        self.surface.borrow_mut().scheduler.request_frame()
    }

    pub fn schedule_timer(&self, delay_ms: f64, repeat: bool) -> CallbackId {
        self.surface
            .borrow_mut()
            .scheduler
            .schedule_timer(delay_ms, repeat)
    }

    pub fn cancel_callback(&self, id: CallbackId) -> bool {
        self.surface.borrow_mut().scheduler.cancel(id)
    }

    pub fn cancel_all_callbacks(&self) -> usize {
        self.surface.borrow_mut().scheduler.cancel_all()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.surface.borrow().scheduler.pending()
    }

    /// Advance the mount clock and return the callbacks now due.
    pub fn advance(&self, now_ms: f64) -> Vec<CallbackId> {
        self.surface.borrow_mut().scheduler.advance(now_ms)
    }

    /// Serializable copy of the container's element tree.
    pub fn snapshot(&self) -> MountSnapshot {
        let surface = self.surface.borrow();
        let children = surface
            .nodes
            .get(&NodeId::ROOT)
            .map(|root| {
                root.children
                    .iter()
                    .filter_map(|child| surface.snapshot_node(*child))
                    .collect()
            })
            .unwrap_or_default();
        MountSnapshot {
            width: surface.width,
            height: surface.height,
            children,
            pending_callbacks: surface.scheduler.pending(),
        }
    }

    fn insert_child(&self, parent: NodeId, child: NodeId, reference: Option<NodeId>) -> bool {
        let mut surface = self.surface.borrow_mut();
        if child == NodeId::ROOT
            || !surface.nodes.contains_key(&parent)
            || !surface.nodes.contains_key(&child)
            || surface.is_ancestor_or_self(child, parent)
        {
            return false;
        }
        let misplaced_reference = reference.is_some_and(|reference| {
            surface.nodes.get(&reference).and_then(|r| r.parent) != Some(parent)
        });
        if misplaced_reference {
            return false;
        }

        surface.detach(child);
        if let Some(element) = surface.nodes.get_mut(&child) {
            element.parent = Some(parent);
        }
        if let Some(element) = surface.nodes.get_mut(&parent) {
            let position = reference
                .and_then(|reference| element.children.iter().position(|c| *c == reference))
                .unwrap_or(element.children.len());
            element.children.insert(position, child);
        }
        true
    }
}

impl Surface {
    fn detach(&mut self, child: NodeId) {
        let Some(parent) = self.nodes.get(&child).and_then(|element| element.parent) else {
            return;
        };
        if let Some(element) = self.nodes.get_mut(&parent) {
            element.children.retain(|c| *c != child);
        }
        if let Some(element) = self.nodes.get_mut(&child) {
            element.parent = None;
        }
    }

    /// Remove the detached subtree containing `node` when nothing in it is held.
    fn collect(&mut self, node: NodeId) -> usize {
        let mut top = node;
        while let Some(parent) = self.nodes.get(&top).and_then(|element| element.parent) {
            top = parent;
        }
        if top == NodeId::ROOT || !self.nodes.contains_key(&top) {
            return 0;
        }

        let mut subtree = Vec::new();
        let mut stack = vec![top];
        while let Some(id) = stack.pop() {
            let Some(element) = self.nodes.get(&id) else {
                continue;
            };
            if element.held {
                return 0;
            }
            stack.extend(element.children.iter().copied());
            subtree.push(id);
        }
        for id in &subtree {
            self.nodes.remove(id);
        }
        subtree.len()
    }

    /// Drop every descendant of `node` from the arena.
    fn remove_descendants(&mut self, node: NodeId) {
        let mut stack = match self.nodes.get_mut(&node) {
            Some(element) => std::mem::take(&mut element.children),
            None => return,
        };
        while let Some(id) = stack.pop() {
            if let Some(element) = self.nodes.remove(&id) {
                stack.extend(element.children);
            }
        }
    }

    fn is_ancestor_or_self(&self, candidate: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == candidate {
                return true;
            }
            current = self.nodes.get(&id).and_then(|element| element.parent);
        }
        false
    }

    fn collect_text(&self, node: NodeId, out: &mut String) {
        let Some(element) = self.nodes.get(&node) else {
            return;
        };
        out.push_str(&element.text);
        for child in &element.children {
            self.collect_text(*child, out);
        }
    }

    fn snapshot_node(&self, id: NodeId) -> Option<ElementSnapshot> {
        let element = self.nodes.get(&id)?;
        Some(ElementSnapshot {
            tag: element.tag.clone(),
            style: element.style.clone(),
            attributes: element.attributes.clone(),
            text: element.text.clone(),
            children: element
                .children
                .iter()
                .filter_map(|child| self.snapshot_node(*child))
                .collect(),
        })
    }
}

fn parse_px(value: Option<&String>) -> f64 {
    value
        .map(|v| v.trim().trim_end_matches("px").trim())
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// What [`MountPoint::reset`] removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MountReset {
    pub children_removed: usize,
    pub callbacks_cancelled: usize,
}

/// Serializable view of a mount point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MountSnapshot {
    pub width: f64,
    pub height: f64,
    pub children: Vec<ElementSnapshot>,
    pub pending_callbacks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementSnapshot {
    pub tag: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub style: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ElementSnapshot>,
}
