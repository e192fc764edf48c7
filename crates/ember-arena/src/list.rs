//! Offset-addressed intrusive doubly-linked lists.
//!
//! A list lives entirely inside the [`Arena`]. It is named by a *root
//! slot*: one arena field holding the offset of the first item (or null).
//! Every item starts with the [`list`](ember_core::record::list) header and
//! points at the list's common block, which in turn points back at the root
//! slot:
//!
//! ```text
//! root slot ──► item ◄──► item ◄──► item
//!                 │         │         │
//!                 └─────────┴────┬────┘ COMMON
//!                                ▼
//!                   [ITEM_SIZE][ROOT][FIRST][LAST][N_ITEMS][DIRECT]
//! ```
//!
//! The common block is created by the first [`new_tail`] on an empty root
//! and reached afterwards through the first item, so linking into an empty
//! list is only possible through [`new_tail`].
//!
//! [`close`] materialises a direct-index array so [`item_at`] is O(1).
//! A closed list rejects [`append`], [`insert_after`], [`sorted_insert`] and
//! [`remove`]; it may still be reordered by [`split`], [`swap`] and
//! [`sort`], which keep the direct array in step.
//!
//! Link operations take `&Arena`: they only touch fields. Operations that
//! allocate (`new_tail`, `close`) take `&mut Arena` and need the growth
//! gate open.

use ember_core::record::{common, list};
use ember_core::{fatal, Offset, Site};

use crate::store::Arena;

/// Ordering requested from [`sorted_insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest key first.
    Ascending,
    /// Largest key first. Not supported; requesting it is fatal.
    Descending,
}

/// Allocate an unlinked item of `size` fields with a null header.
pub fn allocate_item(arena: &mut Arena, size: usize) -> Offset {
    if size < list::HEADER_SIZE {
        fatal!(
            Site::here("list"),
            "item size {size} is smaller than the list header"
        );
    }
    let item = arena.allocate(size);
    clear_links(arena, item);
    arena.put_offset(item + list::COMMON, None);
    arena.put_offset(item + list::DIRECT, None);
    item
}

/// Allocate a new item and link it at the tail of the list at `root`.
///
/// On an empty root this also allocates the list's common block.
pub fn new_tail(arena: &mut Arena, root: Offset, item_size: usize) -> Offset {
    let common = match common_for_root(arena, root) {
        Some(c) => {
            let existing = arena.get(c + common::ITEM_SIZE) as usize;
            if existing != item_size {
                fatal!(
                    Site::here("list").at(root),
                    "item size {item_size} does not match list item size {existing}"
                );
            }
            c
        }
        None => {
            let c = arena.allocate(common::BLOCK_SIZE);
            arena.put(c + common::ITEM_SIZE, item_size as f64);
            arena.put_offset(c + common::ROOT, Some(root));
            arena.put_offset(c + common::FIRST, None);
            arena.put_offset(c + common::LAST, None);
            arena.put(c + common::N_ITEMS, 0.0);
            arena.put_offset(c + common::DIRECT, None);
            c
        }
    };
    reject_closed(arena, common);
    let item = allocate_item(arena, item_size);
    let last = arena.get_offset(common + common::LAST);
    link_after(arena, common, last, item);
    item
}

/// Link an already-allocated, unlinked `item` at the tail.
///
/// The list must be non-empty and open.
pub fn append(arena: &Arena, root: Offset, item: Offset) {
    let common = open_common(arena, root, "append");
    check_unlinked(arena, item);
    let last = arena.get_offset(common + common::LAST);
    link_after(arena, common, last, item);
}

/// Link an already-allocated, unlinked `item` directly after `anchor`.
///
/// Lists headed by a dummy item use this to return work to the front.
pub fn insert_after(arena: &Arena, anchor: Offset, item: Offset) {
    let common = common_of_item(arena, anchor);
    reject_closed(arena, common);
    check_unlinked(arena, item);
    link_after(arena, common, Some(anchor), item);
}

/// Insert `item` in ascending order of the field at `key`, starting the
/// search from `hint`.
///
/// Walks forward while the next key is `<=` the new key, or backward
/// while the previous key is greater, so equal keys keep insertion order.
pub fn sorted_insert(
    arena: &Arena,
    root: Offset,
    hint: Offset,
    item: Offset,
    key: usize,
    order: SortOrder,
) {
    if order == SortOrder::Descending {
        fatal!(
            Site::here("list").at(root),
            "descending sorted insert is not supported"
        );
    }
    let common = open_common(arena, root, "sorted_insert");
    check_unlinked(arena, item);
    if arena.get_offset(hint + list::COMMON) != Some(common) {
        fatal!(Site::here("list").at(hint), "insert hint is not in this list");
    }
    let value = arena.get(item + key);
    let mut pos = hint;
    if arena.get(pos + key) <= value {
        while let Some(next) = arena.get_offset(pos + list::NEXT) {
            if arena.get(next + key) > value {
                break;
            }
            pos = next;
        }
        link_after(arena, common, Some(pos), item);
    } else {
        while let Some(prev) = arena.get_offset(pos + list::PREV) {
            if arena.get(prev + key) <= value {
                break;
            }
            pos = prev;
        }
        let before = arena.get_offset(pos + list::PREV);
        link_after(arena, common, before, item);
    }
}

/// Unlink `item` from its list. The list must be open.
///
/// Removing the last item empties the root slot; the common block is then
/// unreachable and the next [`new_tail`] creates a fresh one.
pub fn remove(arena: &Arena, item: Offset) {
    let common = common_of_item(arena, item);
    reject_closed(arena, common);
    unlink(arena, common, item);
}

/// First item, or `None` if the list is empty.
#[inline]
pub fn first(arena: &Arena, root: Offset) -> Option<Offset> {
    arena.get_offset(root)
}

/// Last item, or `None` if the list is empty.
pub fn last(arena: &Arena, root: Offset) -> Option<Offset> {
    common_for_root(arena, root).and_then(|c| arena.get_offset(c + common::LAST))
}

/// Item after `item`.
#[inline]
pub fn next(arena: &Arena, item: Offset) -> Option<Offset> {
    arena.get_offset(item + list::NEXT)
}

/// Item before `item`.
#[inline]
pub fn prev(arena: &Arena, item: Offset) -> Option<Offset> {
    arena.get_offset(item + list::PREV)
}

/// Number of linked items.
pub fn count(arena: &Arena, root: Offset) -> usize {
    common_for_root(arena, root).map_or(0, |c| arena.get(c + common::N_ITEMS) as usize)
}

/// Whether the list has been closed into a direct array.
pub fn is_closed(arena: &Arena, root: Offset) -> bool {
    common_for_root(arena, root).is_some_and(|c| arena.get_offset(c + common::DIRECT).is_some())
}

/// Iterate items from first to last.
pub fn iter(arena: &Arena, root: Offset) -> ListIter<'_> {
    ListIter {
        arena,
        cursor: first(arena, root),
    }
}

/// Iterator over the items of one list.
pub struct ListIter<'a> {
    arena: &'a Arena,
    cursor: Option<Offset>,
}

impl Iterator for ListIter<'_> {
    type Item = Offset;

    fn next(&mut self) -> Option<Offset> {
        let item = self.cursor?;
        self.cursor = self.arena.get_offset(item + list::NEXT);
        Some(item)
    }
}

/// Build the direct-index array over the current items.
///
/// Idempotent. The list must be non-empty.
pub fn close(arena: &mut Arena, root: Offset) {
    let Some(common) = common_for_root(arena, root) else {
        fatal!(Site::here("list").at(root), "cannot close an empty list");
    };
    if arena.get_offset(common + common::DIRECT).is_some() {
        return;
    }
    let n = arena.get(common + common::N_ITEMS) as usize;
    let direct = arena.allocate(n);
    arena.put_offset(common + common::DIRECT, Some(direct));
    rebuild_direct(arena, common);
}

/// The `n`-th item, O(1) on a closed list and a walk otherwise.
pub fn item_at(arena: &Arena, root: Offset, n: usize) -> Option<Offset> {
    let common = common_for_root(arena, root)?;
    if n >= arena.get(common + common::N_ITEMS) as usize {
        return None;
    }
    match arena.get_offset(common + common::DIRECT) {
        Some(direct) => arena.get_offset(direct + n),
        None => iter(arena, root).nth(n),
    }
}

/// Partition the list in place: items whose `key` field is below
/// `threshold` stay in front in their original order, the rest move to the
/// tail in theirs. Returns the number of items below the threshold.
///
/// Allowed on closed lists.
pub fn split(arena: &Arena, root: Offset, key: usize, threshold: f64) -> usize {
    let Some(common) = common_for_root(arena, root) else {
        return 0;
    };
    let n = arena.get(common + common::N_ITEMS) as usize;
    let mut below = 0;
    let mut cursor = arena.get_offset(common + common::FIRST);
    for _ in 0..n {
        let Some(item) = cursor else {
            fatal!(Site::here("list").at(root), "list shorter than its item count {n}");
        };
        cursor = arena.get_offset(item + list::NEXT);
        if arena.get(item + key) < threshold {
            below += 1;
        } else {
            let last = arena.get_offset(common + common::LAST);
            if last != Some(item) {
                unlink(arena, common, item);
                let last = arena.get_offset(common + common::LAST);
                link_after(arena, common, last, item);
            }
        }
    }
    rebuild_direct(arena, common);
    below
}

/// Exchange the payloads (every field after the list header) of `a` and
/// `b`. Both stay linked where they are, so their direct-index slots keep
/// naming the same positions. Both must belong to the same list.
///
/// Allowed on closed lists.
pub fn swap(arena: &Arena, a: Offset, b: Offset) {
    if a == b {
        return;
    }
    let common = common_of_item(arena, a);
    if arena.get_offset(b + list::COMMON) != Some(common) {
        fatal!(Site::here("list").at(b), "swap across different lists");
    }
    let item_size = arena.get(common + common::ITEM_SIZE) as usize;
    for field in list::HEADER_SIZE..item_size {
        let va = arena.get(a + field);
        arena.put(a + field, arena.get(b + field));
        arena.put(b + field, va);
    }
}

/// Stable ascending sort by the field at `key`. Allowed on closed lists.
pub fn sort(arena: &Arena, root: Offset, key: usize) {
    let Some(common) = common_for_root(arena, root) else {
        return;
    };
    let mut items: Vec<Offset> = iter(arena, root).collect();
    items.sort_by(|&x, &y| arena.get(x + key).total_cmp(&arena.get(y + key)));
    for (i, &item) in items.iter().enumerate() {
        let prev = i.checked_sub(1).map(|j| items[j]);
        let next = items.get(i + 1).copied();
        arena.put_offset(item + list::PREV, prev);
        arena.put_offset(item + list::NEXT, next);
    }
    let head = items.first().copied();
    arena.put_offset(common + common::FIRST, head);
    arena.put_offset(common + common::LAST, items.last().copied());
    arena.put_offset(root, head);
    rebuild_direct(arena, common);
}

/// The common block of the list at `root`, or `None` if it is empty.
///
/// Fatal if the first item and the common block disagree about the root.
pub fn common_for_root(arena: &Arena, root: Offset) -> Option<Offset> {
    let head = arena.get_offset(root)?;
    let Some(common) = arena.get_offset(head + list::COMMON) else {
        fatal!(Site::here("list").at(head), "first item has no common block");
    };
    if arena.get_offset(common + common::ROOT) != Some(root) {
        fatal!(
            Site::here("list").at(common),
            "common block does not point back at root slot {root}"
        );
    }
    Some(common)
}

fn common_of_item(arena: &Arena, item: Offset) -> Offset {
    let Some(common) = arena.get_offset(item + list::COMMON) else {
        fatal!(Site::here("list").at(item), "item is not linked into a list");
    };
    let root = arena.get_offset(common + common::ROOT);
    let head = root.and_then(|r| arena.get_offset(r));
    if head.and_then(|h| arena.get_offset(h + list::COMMON)) != Some(common) {
        fatal!(
            Site::here("list").at(item),
            "item common {common} disagrees with its root slot"
        );
    }
    common
}

fn open_common(arena: &Arena, root: Offset, op: &str) -> Offset {
    let Some(common) = common_for_root(arena, root) else {
        fatal!(Site::here("list").at(root), "{op} on an empty list");
    };
    reject_closed(arena, common);
    common
}

fn reject_closed(arena: &Arena, common: Offset) {
    if arena.get_offset(common + common::DIRECT).is_some() {
        fatal!(
            Site::here("list").at(common),
            "structural mutation of a closed list"
        );
    }
}

fn check_unlinked(arena: &Arena, item: Offset) {
    if arena.get_offset(item + list::COMMON).is_some() {
        fatal!(Site::here("list").at(item), "item is already linked");
    }
}

fn clear_links(arena: &Arena, item: Offset) {
    arena.put_offset(item + list::PREV, None);
    arena.put_offset(item + list::NEXT, None);
}

/// Link `item` after `anchor`, or at the head when `anchor` is `None`.
fn link_after(arena: &Arena, common: Offset, anchor: Option<Offset>, item: Offset) {
    let next = match anchor {
        Some(a) => arena.get_offset(a + list::NEXT),
        None => arena.get_offset(common + common::FIRST),
    };
    arena.put_offset(item + list::PREV, anchor);
    arena.put_offset(item + list::NEXT, next);
    arena.put_offset(item + list::COMMON, Some(common));
    match anchor {
        Some(a) => arena.put_offset(a + list::NEXT, Some(item)),
        None => {
            arena.put_offset(common + common::FIRST, Some(item));
            if let Some(root) = arena.get_offset(common + common::ROOT) {
                arena.put_offset(root, Some(item));
            }
        }
    }
    match next {
        Some(n) => arena.put_offset(n + list::PREV, Some(item)),
        None => arena.put_offset(common + common::LAST, Some(item)),
    }
    arena.add(common + common::N_ITEMS, 1.0);
}

fn unlink(arena: &Arena, common: Offset, item: Offset) {
    let prev = arena.get_offset(item + list::PREV);
    let next = arena.get_offset(item + list::NEXT);
    match prev {
        Some(p) => arena.put_offset(p + list::NEXT, next),
        None => {
            arena.put_offset(common + common::FIRST, next);
            if let Some(root) = arena.get_offset(common + common::ROOT) {
                arena.put_offset(root, next);
            }
        }
    }
    match next {
        Some(n) => arena.put_offset(n + list::PREV, prev),
        None => arena.put_offset(common + common::LAST, prev),
    }
    clear_links(arena, item);
    arena.put_offset(item + list::COMMON, None);
    arena.add(common + common::N_ITEMS, -1.0);
}

fn rebuild_direct(arena: &Arena, common: Offset) {
    let Some(direct) = arena.get_offset(common + common::DIRECT) else {
        return;
    };
    let mut cursor = arena.get_offset(common + common::FIRST);
    let mut i = 0usize;
    while let Some(item) = cursor {
        arena.put_offset(direct + i, Some(item));
        arena.put(item + list::DIRECT, i as f64);
        cursor = arena.get_offset(item + list::NEXT);
        i += 1;
    }
}
