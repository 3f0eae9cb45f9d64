//! Object heap and tracing garbage collector
//!
//! A slot arena with a free list: object identity is the slot index, and
//! freed slots are recycled. Collection is precise mark-sweep with a gray
//! worklist. The string intern table lives here and is weak-keyed: it is
//! swept after marking rather than treated as a root.
//!
//! The heap never starts a collection on its own. Allocation sites check
//! [`Heap::should_collect`] and run a collection with their roots in hand
//! *before* allocating, so a newborn object can never be swept.

use crate::object::{
    Obj, ObjFunction, ObjRef, ObjString, UpvalueSlot,
};
use crate::table::{StrKey, Table};
use crate::value::Value;

/// First collection fires once a megabyte is live
const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;
/// Next threshold is the surviving heap times this factor
const HEAP_GROW_FACTOR: usize = 2;

/// Roots outside the VM proper (the compiler chain during compilation)
pub trait Trace {
    /// Mark every object reachable from this root set
    fn trace(&self, heap: &mut Heap);
}

/// The object arena plus collector state
pub struct Heap {
    /// Slot arena; `None` slots are free
    objects: Vec<Option<Obj>>,
    /// Mark bits, parallel to `objects`
    marked: Vec<bool>,
    /// Indices of free slots available for reuse
    free: Vec<usize>,
    /// Intern table: every live string, keyed weakly
    strings: Table,
    /// Gray worklist: marked but not yet scanned
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Collect at every allocation point
    stress: bool,
}

impl Heap {
    /// Create an empty heap
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            marked: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            stress: false,
        }
    }

    /// Enable or disable stress mode (collect at every allocation point)
    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    /// Should the next allocation site collect first?
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Currently accounted live bytes
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects (for tests and stats)
    pub fn object_count(&self) -> usize {
        self.objects.iter().filter(|slot| slot.is_some()).count()
    }

    /// Allocate an object. Never collects; see the module docs.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += object_footprint(&obj);
        let index = match self.free.pop() {
            Some(index) => {
                self.objects[index] = Some(obj);
                self.marked[index] = false;
                index
            }
            None => {
                self.objects.push(Some(obj));
                self.marked.push(false);
                self.objects.len() - 1
            }
        };
        ObjRef(index as u32)
    }

    /// Intern a string: identical byte sequences share one object
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = hash_string(chars);
        if let Some(existing) = self
            .strings
            .find_key(hash, |r| self.string(r).chars == chars)
        {
            return existing;
        }
        let r = self.alloc(Obj::String(ObjString {
            chars: chars.to_string(),
            hash,
        }));
        self.strings.set(StrKey { obj: r, hash }, Value::Nil);
        r
    }

    /// Build the table key for an interned string handle
    pub fn str_key(&self, r: ObjRef) -> StrKey {
        StrKey {
            obj: r,
            hash: self.string(r).hash,
        }
    }

    // === Typed accessors ===
    //
    // Handles are produced by type-checked paths, so a variant mismatch
    // is a VM invariant violation, not a user error.

    /// Borrow an object
    pub fn get(&self, r: ObjRef) -> &Obj {
        self.objects[r.index()].as_ref().expect("use of freed object")
    }

    /// Mutably borrow an object
    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.objects[r.index()].as_mut().expect("use of freed object")
    }

    pub fn string(&self, r: ObjRef) -> &ObjString {
        match self.get(r) {
            Obj::String(s) => s,
            _ => unreachable!("expected string object"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &ObjFunction {
        match self.get(r) {
            Obj::Function(f) => f,
            _ => unreachable!("expected function object"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &crate::object::ObjClosure {
        match self.get(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut crate::object::ObjClosure {
        match self.get_mut(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &crate::object::ObjClass {
        match self.get(r) {
            Obj::Class(c) => c,
            _ => unreachable!("expected class object"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut crate::object::ObjClass {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            _ => unreachable!("expected class object"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &crate::object::ObjInstance {
        match self.get(r) {
            Obj::Instance(i) => i,
            _ => unreachable!("expected instance object"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut crate::object::ObjInstance {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            _ => unreachable!("expected instance object"),
        }
    }

    pub fn list(&self, r: ObjRef) -> &crate::object::ObjList {
        match self.get(r) {
            Obj::List(l) => l,
            _ => unreachable!("expected list object"),
        }
    }

    pub fn list_mut(&mut self, r: ObjRef) -> &mut crate::object::ObjList {
        match self.get_mut(r) {
            Obj::List(l) => l,
            _ => unreachable!("expected list object"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &crate::object::ObjUpvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut crate::object::ObjUpvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn bound_method(&self, r: ObjRef) -> &crate::object::ObjBoundMethod {
        match self.get(r) {
            Obj::BoundMethod(b) => b,
            _ => unreachable!("expected bound method object"),
        }
    }

    // === Mark phase ===

    /// Mark a value if it references a heap object
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    /// Color an object gray
    pub fn mark_object(&mut self, r: ObjRef) {
        if self.marked[r.index()] {
            return;
        }
        self.marked[r.index()] = true;
        self.gray.push(r);
    }

    /// Mark every key and value of a table owned outside the heap
    /// (the VM's globals)
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key.obj);
            self.mark_value(value);
        }
    }

    /// Drain the gray worklist, blackening each object
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    /// Mark everything one object references
    fn blacken(&mut self, r: ObjRef) {
        // Split borrows: read the object out of `objects` while writing
        // mark bits and the worklist, which live in sibling fields.
        let Heap {
            objects,
            marked,
            gray,
            ..
        } = self;
        let obj = objects[r.index()].as_ref().expect("freed object on gray stack");
        match obj {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    mark(marked, gray, name);
                }
                for &constant in &f.chunk.constants {
                    mark_value(marked, gray, constant);
                }
            }
            Obj::Closure(c) => {
                mark(marked, gray, c.function);
                for &upvalue in &c.upvalues {
                    mark(marked, gray, upvalue);
                }
            }
            Obj::Upvalue(u) => {
                if let UpvalueSlot::Closed(value) = u.location {
                    mark_value(marked, gray, value);
                }
            }
            Obj::Class(c) => {
                mark(marked, gray, c.name);
                for (key, value) in c.methods.iter() {
                    mark(marked, gray, key.obj);
                    mark_value(marked, gray, value);
                }
            }
            Obj::Instance(i) => {
                mark(marked, gray, i.class);
                for (key, value) in i.fields.iter() {
                    mark(marked, gray, key.obj);
                    mark_value(marked, gray, value);
                }
            }
            Obj::BoundMethod(b) => {
                mark_value(marked, gray, b.receiver);
                mark(marked, gray, b.method);
            }
            Obj::List(l) => {
                for &item in &l.items {
                    mark_value(marked, gray, item);
                }
            }
        }
    }

    // === Sweep phase ===

    /// Drop intern entries whose string did not survive marking.
    ///
    /// Must run after [`trace_references`](Self::trace_references) and
    /// before [`sweep`](Self::sweep): the keys are weak.
    pub fn sweep_strings(&mut self) {
        let doomed: Vec<StrKey> = self
            .strings
            .iter()
            .filter(|(key, _)| !self.marked[key.obj.index()])
            .map(|(key, _)| key)
            .collect();
        for key in doomed {
            self.strings.delete(key);
        }
    }

    /// Free unmarked objects, clear mark bits, and set the next threshold.
    ///
    /// Live footprints are re-measured here so containers that grew since
    /// their allocation are accounted at their current size.
    pub fn sweep(&mut self) {
        let mut live_bytes = 0;
        for index in 0..self.objects.len() {
            match &self.objects[index] {
                None => {}
                Some(obj) if self.marked[index] => {
                    self.marked[index] = false;
                    live_bytes += object_footprint(obj);
                }
                Some(_) => {
                    self.objects[index] = None;
                    self.free.push(index);
                }
            }
        }
        self.bytes_allocated = live_bytes;
        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

fn mark(marked: &mut [bool], gray: &mut Vec<ObjRef>, r: ObjRef) {
    if !marked[r.index()] {
        marked[r.index()] = true;
        gray.push(r);
    }
}

fn mark_value(marked: &mut [bool], gray: &mut Vec<ObjRef>, value: Value) {
    if let Value::Obj(r) = value {
        mark(marked, gray, r);
    }
}

/// FNV-1a, 32-bit
pub fn hash_string(chars: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in chars.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Current heap footprint of an object: the variant itself plus the
/// capacity of its owned containers
fn object_footprint(obj: &Obj) -> usize {
    let base = std::mem::size_of::<Obj>();
    let extra = match obj {
        Obj::String(s) => s.chars.capacity(),
        Obj::Function(f) => {
            f.chunk.code.capacity()
                + f.chunk.lines.capacity() * std::mem::size_of::<u32>()
                + f.chunk.constants.capacity() * std::mem::size_of::<Value>()
        }
        Obj::Native(_) => 0,
        Obj::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjRef>(),
        Obj::Upvalue(_) => 0,
        Obj::Class(c) => c.methods.footprint(),
        Obj::Instance(i) => i.fields.footprint(),
        Obj::BoundMethod(_) => 0,
        Obj::List(l) => l.items.capacity() * std::mem::size_of::<Value>(),
    };
    base + extra
}
