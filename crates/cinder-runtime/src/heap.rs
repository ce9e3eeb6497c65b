//! Object heap and collector primitives
//!
//! Objects live in a slot arena; an [`ObjRef`] is an index into it and a
//! free list recycles swept slots. The heap owns the string-interning table
//! and the tri-color machinery (mark flags plus an explicit gray worklist);
//! root discovery belongs to the VM, which knows its stack and frames.
//!
//! Allocation keeps a byte count (object header plus owned container
//! capacities, recorded at allocation time); a collection is due once the
//! count passes `next_gc`, which doubles after every cycle.

use crate::object::{
    hash_string, BoundMethodObj, ClassObj, ClosureObj, FunctionObj, InstanceObj, NativeObj, Obj,
    ObjKind, ObjRef, StringObj, UpvalueObj, UpvalueState,
};
use crate::table::Table;
use crate::value::{format_immediate, Value};

const GC_HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug)]
struct Slot {
    /// Footprint recorded at allocation time; subtracted on sweep
    size: usize,
    obj: Obj,
}

/// The object heap
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Interning table; weakly held, swept via [`Heap::sweep_strings`]
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<ObjRef>,
}

impl Heap {
    /// Create an empty heap
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            gray: Vec::new(),
        }
    }

    /// Allocate a new object, reusing a swept slot when one is free
    pub fn alloc(&mut self, kind: ObjKind) -> ObjRef {
        let size = kind.heap_size();
        self.bytes_allocated += size;
        let slot = Slot {
            size,
            obj: Obj {
                marked: false,
                kind,
            },
        };

        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Intern a borrowed string, copying it only when it is new
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = hash_string(chars);
        if let Some(existing) = self
            .strings
            .find_string(hash, |r| self.string(r).chars.as_ref() == chars)
        {
            return existing;
        }
        self.insert_string(chars.to_owned(), hash)
    }

    /// Intern an owned string, taking the buffer when it is new
    pub fn intern_owned(&mut self, chars: String) -> ObjRef {
        let hash = hash_string(&chars);
        if let Some(existing) = self
            .strings
            .find_string(hash, |r| self.string(r).chars.as_ref() == chars.as_str())
        {
            return existing;
        }
        self.insert_string(chars, hash)
    }

    fn insert_string(&mut self, chars: String, hash: u32) -> ObjRef {
        let r = self.alloc(ObjKind::String(StringObj {
            chars: chars.into_boxed_str(),
            hash,
        }));
        self.strings.set(r, hash, Value::Nil);
        r
    }

    // ===== Accessors =====
    //
    // Handles are produced by this heap and verified against the variant tag;
    // a mismatch or a freed slot is a VM bug, not a user error.

    fn obj(&self, r: ObjRef) -> &Obj {
        &self.slots[r.0 as usize]
            .as_ref()
            .expect("use of freed object")
            .obj
    }

    fn obj_mut(&mut self, r: ObjRef) -> &mut Obj {
        &mut self.slots[r.0 as usize]
            .as_mut()
            .expect("use of freed object")
            .obj
    }

    /// Kind tag of the object behind `r`
    pub fn kind(&self, r: ObjRef) -> &ObjKind {
        &self.obj(r).kind
    }

    pub fn string(&self, r: ObjRef) -> &StringObj {
        match &self.obj(r).kind {
            ObjKind::String(s) => s,
            _ => unreachable!("expected string object"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &FunctionObj {
        match &self.obj(r).kind {
            ObjKind::Function(f) => f,
            _ => unreachable!("expected function object"),
        }
    }

    pub fn native(&self, r: ObjRef) -> &NativeObj {
        match &self.obj(r).kind {
            ObjKind::Native(n) => n,
            _ => unreachable!("expected native object"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &ClosureObj {
        match &self.obj(r).kind {
            ObjKind::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut ClosureObj {
        match &mut self.obj_mut(r).kind {
            ObjKind::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &UpvalueObj {
        match &self.obj(r).kind {
            ObjKind::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut UpvalueObj {
        match &mut self.obj_mut(r).kind {
            ObjKind::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &ClassObj {
        match &self.obj(r).kind {
            ObjKind::Class(c) => c,
            _ => unreachable!("expected class object"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut ClassObj {
        match &mut self.obj_mut(r).kind {
            ObjKind::Class(c) => c,
            _ => unreachable!("expected class object"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &InstanceObj {
        match &self.obj(r).kind {
            ObjKind::Instance(i) => i,
            _ => unreachable!("expected instance object"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut InstanceObj {
        match &mut self.obj_mut(r).kind {
            ObjKind::Instance(i) => i,
            _ => unreachable!("expected instance object"),
        }
    }

    pub fn bound_method(&self, r: ObjRef) -> &BoundMethodObj {
        match &self.obj(r).kind {
            ObjKind::BoundMethod(b) => b,
            _ => unreachable!("expected bound method object"),
        }
    }

    // ===== Collection =====

    /// Whether the allocation budget has been exceeded
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Bytes currently attributed to live objects
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects (test observability)
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.obj(r).marked
    }

    /// Mark an object gray. Strings and natives have no outgoing references
    /// and are darkened to black immediately instead of joining the worklist.
    pub fn mark_object(&mut self, r: ObjRef) {
        let obj = self.obj_mut(r);
        if obj.marked {
            return;
        }
        obj.marked = true;
        if !matches!(obj.kind, ObjKind::String(_) | ObjKind::Native(_)) {
            self.gray.push(r);
        }
    }

    /// Mark a value's object, if it holds one
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    /// Mark every key and value of a table
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Drain the gray worklist, blackening each object
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    /// Blacken one object: mark everything it references
    fn blacken(&mut self, r: ObjRef) {
        let mut children: Vec<Value> = Vec::new();
        match &self.obj(r).kind {
            // Leaf objects are darkened at mark time and never reach here
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    children.push(Value::Obj(name));
                }
                children.extend(f.chunk.constants.iter().copied());
            }
            ObjKind::Closure(c) => {
                children.push(Value::Obj(c.function));
                children.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
            }
            ObjKind::Upvalue(u) => {
                if let UpvalueState::Closed(value) = u.state {
                    children.push(value);
                }
            }
            ObjKind::Class(c) => {
                children.push(Value::Obj(c.name));
                for (key, value) in c.methods.iter() {
                    children.push(Value::Obj(key));
                    children.push(value);
                }
            }
            ObjKind::Instance(i) => {
                children.push(Value::Obj(i.class));
                for (key, value) in i.fields.iter() {
                    children.push(Value::Obj(key));
                    children.push(value);
                }
            }
            ObjKind::BoundMethod(b) => {
                children.push(b.receiver);
                children.push(Value::Obj(b.method));
            }
        }

        for child in children {
            self.mark_value(child);
        }
    }

    /// Drop interning entries whose strings were not marked.
    ///
    /// Must run after tracing and before [`Heap::sweep`] so the sweep can
    /// free those strings without leaving dangling interning entries.
    pub fn sweep_strings(&mut self) {
        let slots = &self.slots;
        self.strings.remove_white(|r| {
            slots[r.0 as usize]
                .as_ref()
                .is_some_and(|slot| slot.obj.marked)
        });
    }

    /// Free every unmarked object and clear marks on survivors
    pub fn sweep(&mut self) {
        for index in 0..self.slots.len() {
            let dead = match &mut self.slots[index] {
                Some(slot) => {
                    if slot.obj.marked {
                        slot.obj.marked = false;
                        false
                    } else {
                        true
                    }
                }
                None => false,
            };
            if dead {
                if let Some(slot) = self.slots[index].take() {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(slot.size);
                    self.free.push(index as u32);
                }
            }
        }

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
    }

    // ===== Rendering =====

    /// Render a value for `print` and the disassembler
    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Obj(r) => self.format_object(r),
            immediate => format_immediate(immediate).expect("immediate value"),
        }
    }

    fn format_object(&self, r: ObjRef) -> String {
        match &self.obj(r).kind {
            ObjKind::String(s) => s.chars.to_string(),
            ObjKind::Function(f) => self.format_function(f),
            ObjKind::Native(_) => "<native fn>".to_string(),
            ObjKind::Closure(c) => self.format_function(self.function(c.function)),
            ObjKind::Upvalue(_) => "upvalue".to_string(),
            ObjKind::Class(c) => self.string(c.name).chars.to_string(),
            ObjKind::Instance(i) => {
                format!("{} instance", self.string(self.class(i.class).name).chars)
            }
            ObjKind::BoundMethod(b) => {
                self.format_function(self.function(self.closure(b.method).function))
            }
        }
    }

    fn format_function(&self, function: &FunctionObj) -> String {
        match function.name {
            Some(name) => format!("<fn {}>", self.string(name).chars),
            None => "<script>".to_string(),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_dedups() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.string(a).chars.as_ref(), "hello");
    }

    #[test]
    fn test_intern_owned_matches_intern() {
        let mut heap = Heap::new();
        let a = heap.intern("concat");
        let b = heap.intern_owned("concat".to_string());
        assert_eq!(a, b);
    }

    #[test]
    fn test_unmarked_objects_are_swept() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        let _dropped = heap.intern("dropped");
        assert_eq!(heap.live_objects(), 2);

        heap.mark_object(kept);
        heap.trace_references();
        heap.sweep_strings();
        heap.sweep();

        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.string(kept).chars.as_ref(), "kept");
    }

    #[test]
    fn test_sweep_reclaims_interning_entries() {
        let mut heap = Heap::new();
        let _old = heap.intern("ghost");
        heap.trace_references();
        heap.sweep_strings();
        heap.sweep();

        // A fresh intern of the same text must produce a new live string,
        // not a dangling handle from the stale interning entry.
        let fresh = heap.intern("ghost");
        assert_eq!(heap.string(fresh).chars.as_ref(), "ghost");
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn test_marking_traces_closure_references() {
        let mut heap = Heap::new();
        let name = heap.intern("f");
        let function = heap.alloc(ObjKind::Function(FunctionObj::new(Some(name))));
        let closure = heap.alloc(ObjKind::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));

        heap.mark_object(closure);
        heap.trace_references();
        heap.sweep_strings();
        heap.sweep();

        assert_eq!(heap.live_objects(), 3);
        assert_eq!(heap.string(name).chars.as_ref(), "f");
    }

    #[test]
    fn test_slot_reuse_after_sweep() {
        let mut heap = Heap::new();
        let _garbage = heap.intern("garbage");
        heap.sweep_strings();
        heap.sweep();
        let reused = heap.intern("reused");
        // The freed slot is recycled
        assert_eq!(reused.0, 0);
    }

    #[test]
    fn test_interning_is_injective() {
        use proptest::prelude::*;

        // Byte-equal strings intern to the same handle; distinct bytes
        // never collide.
        proptest!(|(words in proptest::collection::vec("[a-z]{0,8}", 1..40))| {
            let mut heap = Heap::new();
            let mut handles = std::collections::HashMap::new();
            for word in &words {
                let handle = heap.intern(word);
                match handles.get(word) {
                    Some(&existing) => prop_assert_eq!(existing, handle),
                    None => {
                        prop_assert!(handles.values().all(|&other| other != handle));
                        handles.insert(word.clone(), handle);
                    }
                }
            }
            for (word, &handle) in &handles {
                prop_assert_eq!(heap.string(handle).chars.as_ref(), word.as_str());
            }
        });
    }

    #[test]
    fn test_byte_accounting_shrinks_on_sweep() {
        let mut heap = Heap::new();
        let before = heap.bytes_allocated();
        let _s = heap.intern("some transient string");
        assert!(heap.bytes_allocated() > before);
        heap.sweep_strings();
        heap.sweep();
        assert_eq!(heap.bytes_allocated(), before);
    }
}
