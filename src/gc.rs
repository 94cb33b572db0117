//! Tri-color mark-and-sweep garbage collector for the Buzz VM.
//!
//! # Architecture
//!
//! The collector is a precise **stop-the-world tri-color mark-and-sweep** with
//! an explicit gray worklist:
//!
//! 1. **Mark phase** — every root is marked *gray* and pushed onto the gray
//!    stack ([`GcHeap::mark`]).
//! 2. **Trace phase** — gray objects are popped, blackened, and their children
//!    marked gray in turn ([`GcHeap::trace_references`]). No recursion: the
//!    worklist bounds stack usage regardless of object-graph depth.
//! 3. **Sweep phase** — the intrusive allocation list is walked; white objects
//!    are reclaimed and survivors are reset to white ([`GcHeap::sweep`]).
//!
//! The phases are public so the VM can interleave its weak-table fixup (the
//! string intern table) between trace and sweep. [`GcHeap::collect`] runs all
//! three for callers that have no weak tables.
//!
//! # `GcPtr<T>`
//!
//! The primary handle type is [`GcPtr<T>`]: a thin, non-owning pointer to a
//! GC-managed heap object. It is `Copy` (like a raw pointer) but typed.
//! Dereferencing it is `unsafe` because the GC may collect the object if no
//! root retains a live reference. In practice, the VM guarantees that every
//! `GcPtr` on the stack, in a live closure, or in the globals array is a
//! valid root.
//!
//! Collection only runs between instruction dispatches, never inside one.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;

// ─────────────────────────────────────────────────────────────────────────────
// GcTrace trait
// ─────────────────────────────────────────────────────────────────────────────

/// Every GC-managed type must implement `GcTrace` so the collector can
/// discover all child `GcPtr`s during the trace phase.
pub trait GcTrace: Any + fmt::Debug {
    /// Mark all `GcPtr`s directly reachable from `self` by calling
    /// [`GcHeap::mark`] on each. Do not recurse; the gray worklist handles
    /// transitive reachability.
    fn trace(&self, heap: &mut GcHeap);

    /// Approximate heap bytes contributed by this object (not counting the
    /// `GcBox` header itself).
    fn heap_size(&self) -> usize;
}

/// The tri-color state of one heap object within a collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Color {
    /// Not yet reached this cycle (collectable at sweep).
    White,
    /// Reached, children not yet traced (on the gray stack).
    Gray,
    /// Reached and fully traced.
    Black,
}

// ─────────────────────────────────────────────────────────────────────────────
// GcBox — the on-heap header + payload
// ─────────────────────────────────────────────────────────────────────────────

/// The on-heap layout for a GC-managed object: a color header, an intrusive
/// linked-list link, and the payload.
struct GcBox<T: GcTrace + ?Sized> {
    color: Cell<Color>,
    next: Option<NonNull<GcBox<dyn GcTrace>>>,
    value: T,
}

// ─────────────────────────────────────────────────────────────────────────────
// GcPtr<T>
// ─────────────────────────────────────────────────────────────────────────────

/// A non-owning, `Copy` handle to a GC-managed object of type `T`.
///
/// Validity: a `GcPtr<T>` is valid as long as the pointed-to object has not
/// been collected. The VM guarantees this by keeping all live `GcPtr`s
/// reachable from its roots.
pub struct GcPtr<T: GcTrace + ?Sized> {
    ptr: NonNull<GcBox<T>>,
}

// Manual impls because the derive macros would require T: Clone / T: Copy.
impl<T: GcTrace + ?Sized> Clone for GcPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: GcTrace + ?Sized> Copy for GcPtr<T> {}

impl<T: GcTrace + ?Sized> fmt::Debug for GcPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcPtr({:p})", self.ptr.as_ptr())
    }
}

impl<T: GcTrace + ?Sized> PartialEq for GcPtr<T> {
    /// Two `GcPtr`s are equal if and only if they point to the same object.
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(self.ptr.as_ptr(), other.ptr.as_ptr())
    }
}
impl<T: GcTrace + ?Sized> Eq for GcPtr<T> {}

impl<T: GcTrace + ?Sized> std::hash::Hash for GcPtr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.ptr.as_ptr() as *const () as usize).hash(state);
    }
}

impl<T: GcTrace + ?Sized> GcPtr<T> {
    /// Dereference the pointer to get a shared reference.
    ///
    /// # Safety
    ///
    /// The caller must ensure the pointed-to object is still alive (i.e., has
    /// not been collected). This holds whenever this `GcPtr` is reachable
    /// from GC roots.
    #[inline]
    pub unsafe fn as_ref(&self) -> &T {
        // SAFETY: the caller guarantees liveness.
        unsafe { &(*self.ptr.as_ptr()).value }
    }

    /// Dereference the pointer to get a mutable reference.
    ///
    /// # Safety
    ///
    /// Same liveness requirement as [`GcPtr::as_ref`], plus the caller must
    /// guarantee exclusive access (no other borrows of this object exist).
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn as_mut(&self) -> &mut T {
        // SAFETY: caller guarantees liveness and exclusivity.
        unsafe { &mut (*self.ptr.as_ptr()).value }
    }

    fn color(&self) -> Color {
        // SAFETY: the GcBox header is valid while the object is allocated.
        unsafe { (*self.ptr.as_ptr()).color.get() }
    }

    fn set_color(&self, color: Color) {
        // SAFETY: same as above.
        unsafe { (*self.ptr.as_ptr()).color.set(color) }
    }

    /// Erase the type parameter to obtain a fat pointer to `dyn GcTrace`.
    pub fn as_dyn(self) -> GcPtr<dyn GcTrace>
    where
        T: Sized,
    {
        let dyn_ptr: NonNull<GcBox<dyn GcTrace>> =
            // SAFETY: unsized coercion of a thin pointer to the fat pointer.
            unsafe { NonNull::new_unchecked(self.ptr.as_ptr() as *mut GcBox<dyn GcTrace>) };
        GcPtr { ptr: dyn_ptr }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GcHeap
// ─────────────────────────────────────────────────────────────────────────────

/// The garbage-collected heap.
///
/// The heap owns all `GcBox` allocations through an intrusive singly-linked
/// list rooted at `first`. Call [`GcHeap::alloc`] to create objects and
/// [`GcHeap::collect`] (or the phased API) to run a cycle.
pub struct GcHeap {
    /// Head of the intrusive linked list of all allocated objects.
    first: Option<NonNull<GcBox<dyn GcTrace>>>,
    /// Gray worklist for the current collection.
    gray: Vec<GcPtr<dyn GcTrace>>,
    /// Total approximate heap bytes currently allocated.
    bytes_allocated: usize,
    /// Run a collection once `bytes_allocated` exceeds this.
    gc_threshold: usize,
    /// Above this watermark a cycle also releases the worklist's spare
    /// capacity, bounding collector-side memory after allocation spikes.
    full_threshold: usize,
    /// Completed GC cycles (for metrics / debugging).
    pub cycles: usize,
}

// SAFETY: the heap manages all pointers internally and is used from a single
// thread only; the VM never sends it across threads.
unsafe impl Send for GcHeap {}

impl Default for GcHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHeap {
    /// Initial GC threshold (1 MiB).
    const INITIAL_THRESHOLD: usize = 1024 * 1024;
    /// Threshold growth factor applied at each collection.
    const GROWTH_FACTOR: usize = 2;
    /// Initial full-collection watermark (8 MiB).
    const INITIAL_FULL_THRESHOLD: usize = 8 * 1024 * 1024;

    /// Create a new, empty GC heap.
    pub fn new() -> Self {
        Self {
            first: None,
            gray: Vec::new(),
            bytes_allocated: 0,
            gc_threshold: Self::INITIAL_THRESHOLD,
            full_threshold: Self::INITIAL_FULL_THRESHOLD,
            cycles: 0,
        }
    }

    /// Allocate a new GC-managed object and return a [`GcPtr<T>`] to it.
    ///
    /// New objects start white; the caller must make them reachable from a
    /// root before the next collection point.
    pub fn alloc<T: GcTrace + Sized + 'static>(&mut self, value: T) -> GcPtr<T> {
        let size = std::mem::size_of::<GcBox<T>>() + value.heap_size();

        let mut boxed = Box::new(GcBox {
            color: Cell::new(Color::White),
            next: self.first,
            value,
        });

        let thin_ptr: NonNull<GcBox<T>> = NonNull::new(boxed.as_mut() as *mut GcBox<T>).unwrap();
        let fat_ptr: NonNull<GcBox<dyn GcTrace>> =
            NonNull::new(Box::into_raw(boxed) as *mut GcBox<dyn GcTrace>).unwrap();

        self.first = Some(fat_ptr);
        self.bytes_allocated += size;

        GcPtr { ptr: thin_ptr }
    }

    // ── Collection phases ────────────────────────────────────────────────────

    /// Mark a pointer reachable: white objects turn gray and join the
    /// worklist. Gray/black objects are ignored, which breaks cycles.
    pub fn mark<T: GcTrace>(&mut self, ptr: GcPtr<T>) {
        self.mark_dyn(ptr.as_dyn());
    }

    /// Type-erased variant of [`GcHeap::mark`].
    pub fn mark_dyn(&mut self, ptr: GcPtr<dyn GcTrace>) {
        if ptr.color() == Color::White {
            ptr.set_color(Color::Gray);
            self.gray.push(ptr);
        }
    }

    /// Drain the gray worklist, blackening each object and marking its
    /// children gray.
    pub fn trace_references(&mut self) {
        while let Some(ptr) = self.gray.pop() {
            ptr.set_color(Color::Black);
            // SAFETY: the object was just marked, so it is alive.
            unsafe { ptr.as_ref() }.trace(self);
        }
    }

    /// Whether the object survived the mark/trace phases of the current
    /// cycle. Only meaningful between [`Self::trace_references`] and
    /// [`Self::sweep`] — used for weak-table fixup.
    pub fn is_marked<T: GcTrace + ?Sized>(&self, ptr: GcPtr<T>) -> bool {
        ptr.color() != Color::White
    }

    /// Sweep unreachable (white) objects off the allocation list, reset
    /// survivors to white, and grow the threshold.
    pub fn sweep(&mut self) {
        let before = self.bytes_allocated;
        let mut current = self.first;
        let mut prev: Option<NonNull<GcBox<dyn GcTrace>>> = None;

        while let Some(node_ptr) = current {
            // SAFETY: node_ptr is always a valid pointer produced by alloc().
            let node = unsafe { node_ptr.as_ref() };
            let next = node.next;

            if node.color.get() != Color::White {
                node.color.set(Color::White);
                prev = current;
                current = next;
            } else {
                if let Some(p) = prev {
                    // SAFETY: p is a valid, live node.
                    unsafe { (*p.as_ptr()).next = next };
                } else {
                    self.first = next;
                }
                // SAFETY: the node is unreachable; we are its sole owner.
                let size = {
                    let b = unsafe { Box::from_raw(node_ptr.as_ptr()) };
                    std::mem::size_of_val(&*b) + b.value.heap_size()
                };
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
                current = next;
            }
        }

        if before > self.full_threshold {
            self.gray.shrink_to_fit();
            self.full_threshold = self.full_threshold.saturating_mul(Self::GROWTH_FACTOR);
        }
        self.gc_threshold =
            (self.bytes_allocated * Self::GROWTH_FACTOR).max(Self::INITIAL_THRESHOLD);
        self.cycles += 1;

        log::debug!(
            "gc cycle {}: {} -> {} bytes, next threshold {}",
            self.cycles,
            before,
            self.bytes_allocated,
            self.gc_threshold
        );
    }

    /// Run a full cycle: mark roots, trace, sweep. `mark_roots` receives the
    /// heap and should call [`GcHeap::mark`] on every live root.
    pub fn collect<F>(&mut self, mark_roots: F)
    where
        F: FnOnce(&mut GcHeap),
    {
        mark_roots(self);
        self.trace_references();
        self.sweep();
    }

    // ── Introspection ────────────────────────────────────────────────────────

    /// Bytes currently tracked by the heap.
    #[inline]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// `true` if a collection should be triggered at the next safe point.
    #[inline]
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated >= self.gc_threshold
    }
}

impl fmt::Debug for GcHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcHeap")
            .field("bytes_allocated", &self.bytes_allocated)
            .field("gc_threshold", &self.gc_threshold)
            .field("cycles", &self.cycles)
            .finish()
    }
}

impl Drop for GcHeap {
    fn drop(&mut self) {
        let mut current = self.first;
        while let Some(node_ptr) = current {
            // SAFETY: node_ptr is a valid pointer we allocated.
            let next = unsafe { (*node_ptr.as_ptr()).next };
            // SAFETY: we are the sole owner; drop by re-boxing.
            unsafe { drop(Box::from_raw(node_ptr.as_ptr())) };
            current = next;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// A leaf object with no children.
    #[derive(Debug)]
    struct Leaf(i64);

    impl GcTrace for Leaf {
        fn trace(&self, _heap: &mut GcHeap) {}
        fn heap_size(&self) -> usize {
            0
        }
    }

    /// A node pointing at another object, for cycle/worklist tests.
    #[derive(Debug)]
    struct Node {
        child: Cell<Option<GcPtr<Node>>>,
    }

    impl GcTrace for Node {
        fn trace(&self, heap: &mut GcHeap) {
            if let Some(child) = self.child.get() {
                heap.mark(child);
            }
        }
        fn heap_size(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_alloc_and_deref() {
        let mut heap = GcHeap::new();
        let ptr = heap.alloc(Leaf(42));
        // SAFETY: ptr is still alive (no collection has run).
        let val = unsafe { ptr.as_ref() };
        assert_eq!(val.0, 42);
    }

    #[test]
    fn test_gc_collects_unreachable() {
        let mut heap = GcHeap::new();
        let kept = heap.alloc(Leaf(1));
        let _dropped = heap.alloc(Leaf(2));
        let before = heap.bytes_allocated();
        assert!(before > 0);

        heap.collect(|h| h.mark(kept));

        assert_eq!(heap.cycles, 1);
        assert!(heap.bytes_allocated() < before);
        let val = unsafe { kept.as_ref() };
        assert_eq!(val.0, 1);
    }

    #[test]
    fn test_cycle_does_not_loop_forever() {
        let mut heap = GcHeap::new();
        let a = heap.alloc(Node {
            child: Cell::new(None),
        });
        let b = heap.alloc(Node {
            child: Cell::new(Some(a)),
        });
        // a → b → a
        unsafe { a.as_ref() }.child.set(Some(b));

        heap.collect(|h| h.mark(a));
        // Both survive; colors reset to white for the next cycle.
        assert!(!heap.is_marked(a));
        assert!(!heap.is_marked(b));
        assert_eq!(heap.cycles, 1);
    }

    #[test]
    fn test_transitive_reachability_through_worklist() {
        let mut heap = GcHeap::new();
        let leafish = heap.alloc(Node {
            child: Cell::new(None),
        });
        let mid = heap.alloc(Node {
            child: Cell::new(Some(leafish)),
        });
        let root = heap.alloc(Node {
            child: Cell::new(Some(mid)),
        });
        let _garbage = heap.alloc(Leaf(0));
        let before = heap.bytes_allocated();

        heap.collect(|h| h.mark(root));

        // Only the Leaf was collected.
        assert!(heap.bytes_allocated() < before);
        assert_eq!(unsafe { mid.as_ref() }.child.get(), Some(leafish));
    }

    #[test]
    fn test_is_marked_between_trace_and_sweep() {
        let mut heap = GcHeap::new();
        let kept = heap.alloc(Leaf(1));
        let dropped = heap.alloc(Leaf(2));

        heap.mark(kept);
        heap.trace_references();
        assert!(heap.is_marked(kept));
        assert!(!heap.is_marked(dropped));
        heap.sweep();
    }

    #[test]
    fn test_ptr_equality() {
        let mut heap = GcHeap::new();
        let a = heap.alloc(Leaf(10));
        let b = heap.alloc(Leaf(10));
        let a2 = a;
        assert_eq!(a, a2, "copies of the same GcPtr should be equal");
        assert_ne!(a, b, "distinct GcPtrs should not be equal");
    }
}
