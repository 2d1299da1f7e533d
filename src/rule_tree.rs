//! The addressable binary rule tree and its `LogWatch<id>.json`
//! persistence schema.

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{PersistError, TreeError};
use crate::predicate::Predicate;
use crate::record::SyslogRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// A path from the root, `()` addressing the root itself.
pub type Address = Vec<Side>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connector {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

impl Connector {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AND" => Some(Connector::And),
            "OR" => Some(Connector::Or),
            _ => None,
        }
    }
}

/// One node of the rule tree. `Empty` is a distinguished leaf meaning
/// "match everything"; every other leaf carries a [`Predicate`].
/// Internal nodes always have two children, leaves always have none.
/// [`RuleTree`]'s mutators are the only way to build a tree, and each one
/// preserves that invariant.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Empty,
    Leaf(Predicate),
    Internal {
        connector: Connector,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    /// Evaluates the boolean tree against a record with AND/OR
    /// short-circuiting, left child first.
    pub fn evaluate(&self, record: &SyslogRecord) -> Result<bool, crate::error::EvalError> {
        match self {
            Node::Empty => Ok(true),
            Node::Leaf(predicate) => crate::predicate::evaluate(predicate, record),
            Node::Internal { connector, left, right } => match connector {
                Connector::And => Ok(left.evaluate(record)? && right.evaluate(record)?),
                Connector::Or => Ok(left.evaluate(record)? || right.evaluate(record)?),
            },
        }
    }
}

/// The JSON wire shape:
/// `{"value": Leaf | "AND" | "OR" | null, "left": Node | null, "right": Node | null}`.
impl Serialize for Node {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut out = serializer.serialize_struct("Node", 3)?;
        match self {
            Node::Empty => {
                out.serialize_field("value", &Option::<()>::None)?;
                out.serialize_field("left", &Option::<()>::None)?;
                out.serialize_field("right", &Option::<()>::None)?;
            }
            Node::Leaf(predicate) => {
                out.serialize_field("value", &Some(predicate))?;
                out.serialize_field("left", &Option::<()>::None)?;
                out.serialize_field("right", &Option::<()>::None)?;
            }
            Node::Internal { connector, left, right } => {
                out.serialize_field("value", connector)?;
                out.serialize_field("left", &Some(left.as_ref()))?;
                out.serialize_field("right", &Some(right.as_ref()))?;
            }
        }
        out.end()
    }
}

/// Intermediate, loosely-typed deserialization target; [`Node::try_from`]
/// enforces the leaf/internal invariant that serde's type system alone
/// can't express for this schema.
#[derive(Deserialize)]
struct RawNode {
    value: serde_json::Value,
    left: Option<Box<RawNode>>,
    right: Option<Box<RawNode>>,
}

impl TryFrom<RawNode> for Node {
    type Error = PersistError;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        match raw.value {
            serde_json::Value::Null => {
                if raw.left.is_some() || raw.right.is_some() {
                    return Err(PersistError::InvalidTree);
                }
                Ok(Node::Empty)
            }
            serde_json::Value::String(s) if s == "AND" || s == "OR" => {
                let connector = Connector::parse(&s).expect("checked above");
                let (Some(left), Some(right)) = (raw.left, raw.right) else {
                    return Err(PersistError::InvalidTree);
                };
                Ok(Node::Internal {
                    connector,
                    left: Box::new(Node::try_from(*left)?),
                    right: Box::new(Node::try_from(*right)?),
                })
            }
            serde_json::Value::Array(_) => {
                if raw.left.is_some() || raw.right.is_some() {
                    return Err(PersistError::InvalidTree);
                }
                Ok(Node::Leaf(Predicate::from_json_tuple(raw.value)?))
            }
            _ => Err(PersistError::InvalidTree),
        }
    }
}

/// The binary rule tree owned by one LogWatch worker.
///
/// # Why
/// - A worker needs a structure clients can grow and reshape one
///   address at a time, command by command, without ever re-sending the
///   whole filter. Addressing nodes by left/right path from the root
///   does that: every mutator takes an [`Address`] plus whatever it's
///   installing there.
///
/// # What (contract)
/// - `root` is always in the leaf/internal shape [`Node`] documents: an
///   internal node always has two non-null children, a leaf or `Empty`
///   node always has none. Every method on this type either preserves
///   that invariant or returns a [`TreeError`] and leaves the tree
///   untouched.
/// - A fresh tree ([`RuleTree::new`]) evaluates to `true` for every
///   record, since it is a single `Empty` root.
///
/// # How
/// - `get_node`/`get_node_mut` walk `addr` from the root, failing with
///   `TreeError::InvalidAddress` the moment a step would have to
///   descend through a leaf or `Empty` node (those have no children to
///   descend into).
///
/// # Trade-offs
/// - The whole tree lives behind one `Node` tree of `Box`es, not an
///   arena or a flat vector; mutation is plain pointer rewriting, which
///   keeps every mutator a handful of lines at the cost of one
///   allocation per inserted node.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleTree {
    root: Node,
}

impl Default for RuleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleTree {
    pub fn new() -> Self {
        RuleTree { root: Node::Empty }
    }

    pub fn evaluate(&self, record: &SyslogRecord) -> Result<bool, crate::error::EvalError> {
        self.root.evaluate(record)
    }

    pub fn get_node(&self, addr: &[Side]) -> Result<&Node, TreeError> {
        get_ref(&self.root, addr, addr)
    }

    fn get_node_mut(&mut self, addr: &[Side]) -> Result<&mut Node, TreeError> {
        get_mut(&mut self.root, addr, addr)
    }

    /// Replaces the node at `addr` with a single leaf.
    ///
    /// # Why
    /// - A client that got a leaf wrong needs to be able to swap it out
    ///   without first tearing down and rebuilding a whole subtree.
    ///
    /// # What (contract)
    /// - `addr` must resolve to an existing node (`TreeError` otherwise);
    ///   that node, and everything under it, is discarded.
    /// - On success the addressed node is `Node::Leaf(predicate)` with
    ///   no children; every address that pointed past the old subtree is
    ///   now invalid.
    ///
    /// # Trade-offs
    /// - No undo: whatever used to be under `addr` is gone. A client
    ///   that wants to keep the old subtree around should read it with
    ///   `get_node` before calling this.
    pub fn set_match(&mut self, addr: &[Side], predicate: Predicate) -> Result<(), TreeError> {
        let node = self.get_node_mut(addr)?;
        *node = Node::Leaf(predicate);
        Ok(())
    }

    /// Wraps the node at `addr` in a new internal node, ANDing or ORing
    /// it with `predicate`.
    ///
    /// # Why
    /// - A client builds up compound rules incrementally: start with one
    ///   predicate, then keep combining more onto it. For that to work
    ///   across repeated calls, the address a client already has for the
    ///   subtree it just combined has to keep pointing at the same
    ///   logical subtree afterward, not at a flattened or truncated copy
    ///   of it.
    ///
    /// # What (contract)
    /// - `addr` must resolve to an existing node; on success it becomes
    ///   `Node::Internal { connector, left, right }` where `left` is the
    ///   entire former subtree rooted at `addr` (leaf, `Empty`, or
    ///   already-internal, unchanged) and `right` is `Node::Leaf(predicate)`.
    /// - Consequently the former subtree's root is now reachable one
    ///   level down, at `addr` + `Side::Left`, with every address inside
    ///   it shifted the same way.
    ///
    /// # How
    /// - `std::mem::replace(node, Node::Empty)` lifts the former subtree
    ///   out without cloning it, then both halves move into the new
    ///   `Internal` node.
    ///
    /// # Trade-offs
    /// - Combining `n` times nests `n` internal nodes instead of
    ///   flattening same-connector chains into one wide node; simpler to
    ///   implement and reason about, at the cost of walking `n` levels
    ///   on every subsequent evaluation of that branch.
    pub fn combine_match(
        &mut self,
        addr: &[Side],
        predicate: Predicate,
        connector: Connector,
    ) -> Result<(), TreeError> {
        let node = self.get_node_mut(addr)?;
        let previous = std::mem::replace(node, Node::Empty);
        *node = Node::Internal {
            connector,
            left: Box::new(previous),
            right: Box::new(Node::Leaf(predicate)),
        };
        Ok(())
    }

    /// Removes the node at `addr`, promoting its sibling into its
    /// parent's place.
    ///
    /// # Why
    /// - `combine_match` is the only way to grow the tree past one leaf,
    ///   so deletion has to be its inverse: undo one combine by
    ///   collapsing the internal node it created back down to the
    ///   sibling that's left.
    ///
    /// # What (contract)
    /// - `addr` must resolve to an existing node whose parent is
    ///   internal, with one exception: `del_match(&[])` (deleting the
    ///   root) is only accepted when the root is a leaf or `Empty`.
    ///   Deleting an internal root would silently discard the whole
    ///   tree with no sibling to promote in its place, so that call
    ///   returns `TreeError::InvalidAddress` instead.
    /// - On success, `addr`'s parent becomes whichever child `addr`
    ///   wasn't (left survives a right deletion and vice versa),
    ///   recursively carrying that child's own subtree with it.
    ///
    /// # Trade-offs
    /// - Rejecting root deletion on an internal tree means a client that
    ///   actually wants to clear everything has to do it explicitly with
    ///   `set_match(&[], ...)` or by deleting down to a single leaf
    ///   first; there's no single "wipe the tree" call.
    pub fn del_match(&mut self, addr: &[Side]) -> Result<(), TreeError> {
        match addr.split_last() {
            None => match &self.root {
                Node::Empty | Node::Leaf(_) => {
                    self.root = Node::Empty;
                    Ok(())
                }
                Node::Internal { .. } => Err(TreeError::InvalidAddress(Vec::new())),
            },
            Some((last, prefix)) => {
                let parent = self.get_node_mut(prefix)?;
                match parent {
                    Node::Internal { left, right, .. } => {
                        let survivor = match last {
                            Side::Left => std::mem::replace(right.as_mut(), Node::Empty),
                            Side::Right => std::mem::replace(left.as_mut(), Node::Empty),
                        };
                        *parent = survivor;
                        Ok(())
                    }
                    _ => Err(TreeError::InvalidAddress(addr.to_vec())),
                }
            }
        }
    }

    pub fn to_json(&self) -> Result<String, PersistError> {
        Ok(serde_json::to_string_pretty(&self.root)?)
    }

    pub fn from_json(text: &str) -> Result<Self, PersistError> {
        let raw: RawNode = serde_json::from_str(text)?;
        Ok(RuleTree { root: Node::try_from(raw)? })
    }
}

fn get_ref<'a>(node: &'a Node, remaining: &[Side], full_addr: &[Side]) -> Result<&'a Node, TreeError> {
    match remaining.split_first() {
        None => Ok(node),
        Some((side, rest)) => match node {
            Node::Internal { left, right, .. } => {
                let child = match side {
                    Side::Left => left.as_ref(),
                    Side::Right => right.as_ref(),
                };
                get_ref(child, rest, full_addr)
            }
            _ => Err(TreeError::InvalidAddress(full_addr.to_vec())),
        },
    }
}

fn get_mut<'a>(node: &'a mut Node, remaining: &[Side], full_addr: &[Side]) -> Result<&'a mut Node, TreeError> {
    match remaining.split_first() {
        None => Ok(node),
        Some((side, rest)) => match node {
            Node::Internal { left, right, .. } => {
                let child = match side {
                    Side::Left => left.as_mut(),
                    Side::Right => right.as_mut(),
                };
                get_mut(child, rest, full_addr)
            }
            _ => Err(TreeError::InvalidAddress(full_addr.to_vec())),
        },
    }
}
