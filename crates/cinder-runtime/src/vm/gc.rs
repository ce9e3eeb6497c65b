//! Garbage collection orchestration
//!
//! Non-moving, precise, stop-the-world mark–sweep. The heap owns the
//! tri-color machinery; this module owns root discovery, which is why the
//! VM (not the heap) decides when to collect: every VM allocation goes
//! through the wrappers here, and at those points every live object is
//! reachable from the roots below.
//!
//! Roots: every value-stack slot, every frame's closure, the open-upvalue
//! list, the globals table, and the interned `"init"` name. The interning
//! table is deliberately not a root; it is swept weakly so unreferenced
//! strings can die.

use super::VM;
use crate::object::{ObjKind, ObjRef};

impl VM {
    /// Allocate through the collector trigger
    pub(super) fn alloc(&mut self, kind: ObjKind) -> ObjRef {
        self.collect_if_needed();
        self.heap.alloc(kind)
    }

    /// Intern through the collector trigger
    pub(super) fn intern(&mut self, chars: &str) -> ObjRef {
        self.collect_if_needed();
        self.heap.intern(chars)
    }

    /// Intern an owned buffer through the collector trigger
    pub(super) fn intern_owned(&mut self, chars: String) -> ObjRef {
        self.collect_if_needed();
        self.heap.intern_owned(chars)
    }

    fn collect_if_needed(&mut self) {
        // The stress build collects before every allocation to shake out
        // missing roots
        if cfg!(feature = "gc-stress") || self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Run one full collection cycle: mark roots, trace, sweep the interning
    /// table, then sweep the heap.
    pub fn collect_garbage(&mut self) {
        self.mark_roots();
        self.heap.trace_references();
        self.heap.sweep_strings();
        self.heap.sweep();
    }

    fn mark_roots(&mut self) {
        for index in 0..self.stack.len() {
            let value = self.stack[index];
            self.heap.mark_value(value);
        }

        for index in 0..self.frames.len() {
            let closure = self.frames[index].closure;
            self.heap.mark_object(closure);
        }

        let mut upvalue = self.open_upvalues;
        while let Some(r) = upvalue {
            self.heap.mark_object(r);
            upvalue = self.heap.upvalue(r).next;
        }

        self.heap.mark_table(&self.globals);

        self.heap.mark_object(self.init_string);
    }
}
