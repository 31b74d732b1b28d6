//! Octree color quantization.
//!
//! Colors descend the tree one bit of (R, G, B) per level, so a node at
//! level L groups colors sharing their top L bits per channel. Building a
//! palette is ingest → reduce → finalize; afterwards the tree doubles as the
//! lookup structure mapping any color to its palette index.

use crate::error::{CatResult, Error};
use crate::image::PixelView;
use rgb::RGB8;

const NONE: u32 = u32::MAX;

/// Siblings to try when the wanted child is missing, nearest bit-pattern
/// first.
const SIBLING_ORDER: [[usize; 7]; 8] = [
    [2, 1, 4, 3, 6, 5, 7],
    [3, 0, 5, 2, 7, 4, 6],
    [0, 3, 6, 1, 4, 7, 5],
    [1, 2, 7, 6, 5, 0, 4],
    [6, 5, 0, 7, 2, 1, 3],
    [7, 4, 1, 6, 3, 0, 2],
    [4, 7, 2, 5, 0, 3, 1],
    [5, 6, 3, 4, 1, 2, 0],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeColor {
    /// The root; never treated as a leaf while ingesting
    Root,
    Internal,
    /// Leaf whose representative comes from the channel sums
    Mixed,
    /// Leaf that has only ever seen this one color
    Exact(RGB8),
}

struct Node {
    children: [u32; 8],
    level: u8,
    /// Palette index, valid after finalize (leaves only)
    id: u8,
    /// Pixels that passed through this node
    count: u32,
    red: u32,
    green: u32,
    blue: u32,
    color: NodeColor,
}

impl Node {
    fn new(level: u8, color: NodeColor) -> Self {
        Self {
            children: [NONE; 8],
            level,
            id: 0,
            count: 0,
            red: 0,
            green: 0,
            blue: 0,
            color,
        }
    }

    #[inline]
    fn is_leaf(&self) -> bool {
        matches!(self.color, NodeColor::Mixed | NodeColor::Exact(_))
    }

    #[inline]
    fn add_one(&mut self, c: RGB8) {
        self.red += u32::from(c.r);
        self.green += u32::from(c.g);
        self.blue += u32::from(c.b);
    }
}

#[inline]
fn child_index(c: RGB8, level: u8) -> usize {
    let bit = 7 - level;
    usize::from((c.r >> bit) & 1) << 2 | usize::from((c.g >> bit) & 1) << 1 | usize::from((c.b >> bit) & 1)
}

pub struct Octree {
    nodes: Vec<Node>,
    /// Nodes that became internal through a leaf split, in creation order
    candidates: Vec<u32>,
    num_leaves: usize,
    finalized: bool,
}

impl Octree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(0, NodeColor::Root)],
            candidates: Vec::new(),
            num_leaves: 0,
            finalized: false,
        }
    }

    #[inline]
    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    pub fn add_color(&mut self, color: RGB8) -> CatResult<()> {
        if self.finalized {
            return Err(Error::InvalidState("add_color"));
        }
        let mut cur = 0usize;
        loop {
            self.nodes[cur].count += 1;
            let level = self.nodes[cur].level;
            if level == 8 || self.nodes[cur].is_leaf() {
                match self.nodes[cur].color {
                    NodeColor::Exact(old) if old != color => {
                        // A single-color leaf splits: the accumulated color
                        // moves into a fresh child and descent continues.
                        debug_assert!(level < 8);
                        let mut moved = Node::new(level + 1, NodeColor::Exact(old));
                        moved.count = self.nodes[cur].count - 1;
                        moved.red = self.nodes[cur].red;
                        moved.green = self.nodes[cur].green;
                        moved.blue = self.nodes[cur].blue;
                        let slot = child_index(old, level);
                        let moved_id = self.push(moved);
                        let node = &mut self.nodes[cur];
                        node.red = 0;
                        node.green = 0;
                        node.blue = 0;
                        node.color = NodeColor::Internal;
                        node.children[slot] = moved_id;
                        self.candidates.push(cur as u32);
                    },
                    _ => {
                        self.nodes[cur].add_one(color);
                        return Ok(());
                    },
                }
            }
            let slot = child_index(color, self.nodes[cur].level);
            let next = self.nodes[cur].children[slot];
            if next != NONE {
                cur = next as usize;
            } else {
                let mut leaf = Node::new(self.nodes[cur].level + 1, NodeColor::Exact(color));
                leaf.count = 1;
                leaf.add_one(color);
                let leaf_id = self.push(leaf);
                self.nodes[cur].children[slot] = leaf_id;
                self.num_leaves += 1;
                return Ok(());
            }
        }
    }

    /// Collapse lowest-count subtrees until at most `max_leaves` remain.
    pub fn reduce(&mut self, max_leaves: usize) -> CatResult<()> {
        if max_leaves == 0 {
            return Err(Error::InvalidArgument("palette size"));
        }
        if self.finalized {
            return Err(Error::InvalidState("reduce"));
        }
        // Newest-first, then a stable sort by count. Among equal counts this
        // keeps children ahead of their parents, so every node reached here
        // has only leaf children left.
        let mut order = self.candidates.clone();
        order.reverse();
        order.sort_by_key(|&id| self.nodes[id as usize].count);
        let mut order = order.into_iter();
        while self.num_leaves > max_leaves {
            match order.next() {
                Some(id) => self.collapse(id as usize),
                None => {
                    // Only the root's own leaves remain; fold them into one.
                    self.collapse(0);
                    break;
                },
            }
        }
        Ok(())
    }

    fn collapse(&mut self, idx: usize) {
        debug_assert!(!self.nodes[idx].is_leaf());
        for slot in 0..8 {
            let child = self.nodes[idx].children[slot];
            if child == NONE {
                continue;
            }
            let child = &self.nodes[child as usize];
            debug_assert!(child.is_leaf());
            let (r, g, b) = (child.red, child.green, child.blue);
            let node = &mut self.nodes[idx];
            node.red += r;
            node.green += g;
            node.blue += b;
            node.children[slot] = NONE;
            self.num_leaves -= 1;
        }
        self.nodes[idx].color = NodeColor::Mixed;
        self.num_leaves += 1;
    }

    /// Assign palette ids in depth-first child order and fix every leaf's
    /// representative color. Returns the palette table in id order.
    pub fn finalize(&mut self) -> Vec<RGB8> {
        let mut table = Vec::with_capacity(self.num_leaves);
        let mut stack = vec![0u32];
        while let Some(idx) = stack.pop() {
            let node = &mut self.nodes[idx as usize];
            if node.is_leaf() {
                let color = match node.color {
                    NodeColor::Exact(c) => c,
                    _ => RGB8::new(
                        ((node.red + node.count / 2) / node.count) as u8,
                        ((node.green + node.count / 2) / node.count) as u8,
                        ((node.blue + node.count / 2) / node.count) as u8,
                    ),
                };
                node.color = NodeColor::Exact(color);
                node.id = table.len() as u8;
                table.push(color);
            } else {
                for slot in (0..8).rev() {
                    if node.children[slot] != NONE {
                        stack.push(node.children[slot]);
                    }
                }
            }
        }
        debug_assert!(table.len() <= 256);
        self.finalized = true;
        table
    }

    /// Approximate nearest palette entry for `color`.
    ///
    /// Descends by the same child-index rule as ingest; a missing child is
    /// substituted by the nearest present sibling. Only valid after
    /// `finalize`.
    pub fn lookup(&self, color: RGB8) -> (u8, RGB8) {
        debug_assert!(self.finalized);
        let mut idx = 0usize;
        loop {
            let node = &self.nodes[idx];
            if let NodeColor::Exact(c) = node.color {
                return (node.id, c);
            }
            let wanted = child_index(color, node.level);
            let mut next = node.children[wanted];
            if next == NONE {
                for &alt in &SIBLING_ORDER[wanted] {
                    if node.children[alt] != NONE {
                        next = node.children[alt];
                        break;
                    }
                }
            }
            if next == NONE {
                // internal nodes keep at least one child
                debug_assert!(false);
                return (0, color);
            }
            idx = next as usize;
        }
    }

    fn push(&mut self, node: Node) -> u32 {
        let id = self.nodes.len() as u32;
        self.nodes.push(node);
        id
    }
}

/// A finalized palette of at most 256 colors, with the octree kept around to
/// answer lookups. When `alpha` is set, index `num_colors` is reserved as the
/// transparent color and is never produced by `lookup`.
pub struct Palette {
    tree: Octree,
    colors: Vec<RGB8>,
    alpha: bool,
}

impl Palette {
    /// Quantize every pixel of `image` down to at most `max_colors` palette
    /// entries (including the transparent slot when `alpha`).
    pub fn quantize(image: PixelView<'_>, max_colors: u16, alpha: bool) -> CatResult<Self> {
        if !(2..=256).contains(&max_colors) {
            return Err(Error::InvalidArgument("max_colors"));
        }
        let mut tree = Octree::new();
        for px in image.pixels() {
            tree.add_color(px)?;
        }
        tree.reduce(max_colors as usize - usize::from(alpha))?;
        let colors = tree.finalize();
        log::debug!("quantized to {} colors (alpha: {})", colors.len(), alpha);
        Ok(Self { tree, colors, alpha })
    }

    #[inline]
    pub fn num_colors(&self) -> usize {
        self.colors.len()
    }

    #[inline]
    pub fn alpha(&self) -> bool {
        self.alpha
    }

    /// Palette index reserved for transparent pixels.
    pub fn transparent_index(&self) -> Option<u8> {
        self.alpha.then(|| self.colors.len() as u8)
    }

    /// Entries the color table must carry, including the transparent slot.
    pub fn table_len(&self) -> usize {
        self.colors.len() + usize::from(self.alpha)
    }

    #[inline]
    pub fn colors(&self) -> &[RGB8] {
        &self.colors
    }

    #[inline]
    pub fn lookup(&self, color: RGB8) -> (u8, RGB8) {
        self.tree.lookup(color)
    }
}
