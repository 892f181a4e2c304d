//! Tri-color mark-sweep collector over the VM's intrusive object list.
//!
//! Unlike a collector that partitions objects into separate white/gray/black
//! sets, this one keeps color in the object header itself: `mark = false` is
//! white, `mark = true` and queued on `gray_stack` is gray, `mark = true` and
//! already processed is black. Sweep walks the singly-linked `vm.objects`
//! list, unlinking and freeing anything still white, then clears every
//! surviving object's mark bit back to white for the next cycle.

use crate::object::{Object, ObjectType};
use crate::table::Table;
use crate::value::Value;

/// Collector never runs below this many live bytes.
pub const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;
pub const GC_GROWTH_FACTOR: usize = 2;

#[derive(Default, Debug, Clone)]
pub struct GCStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GCStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc-trace] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace { ($($arg:tt)*) => {} }
pub(crate) use gc_trace;

pub struct GarbageCollector {
    gray_stack: Vec<*mut Object>,
    stats: GCStats,
}

impl GarbageCollector {
    pub fn new() -> Self {
        GarbageCollector {
            gray_stack: Vec::new(),
            stats: GCStats::default(),
        }
    }

    pub fn mark_object(&mut self, obj: *mut Object) {
        if obj.is_null() {
            return;
        }
        unsafe {
            if (*obj).mark {
                return;
            }
            (*obj).mark = true;
        }
        gc_trace!("mark ptr={:p}", obj);
        self.gray_stack.push(obj);
    }

    pub fn mark_value(&mut self, value: &Value) {
        if let Value::Obj(ptr) = value {
            self.mark_object(*ptr);
        }
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_value(key);
            self.mark_value(value);
        }
    }

    pub fn trace_references(&mut self) {
        while let Some(obj) = self.gray_stack.pop() {
            unsafe {
                gc_trace!("blacken ptr={:p}", obj);
                self.blacken_object(obj);
            }
        }
    }

    /// # Safety
    /// `object` must be a live, correctly-kinded pointer (guaranteed by
    /// every reachable object header matching its allocation).
    unsafe fn blacken_object(&mut self, object: *mut Object) {
        match (*object).kind {
            ObjectType::String | ObjectType::Native => {}
            ObjectType::Function => {
                let function = crate::object::as_function(object);
                for constant in &(*function).chunk.constants {
                    self.mark_value(constant);
                }
            }
            ObjectType::Closure => {
                let closure = crate::object::as_closure(object);
                self.mark_object((*closure).function as *mut Object);
                for &upvalue in &(*closure).upvalues {
                    self.mark_object(upvalue as *mut Object);
                }
            }
            ObjectType::Upvalue => {
                let upvalue = crate::object::as_upvalue(object);
                if (*upvalue).is_open() {
                    self.mark_value(&*(*upvalue).location);
                } else {
                    self.mark_value(&(*upvalue).closed);
                }
            }
            ObjectType::Class => {
                let class = crate::object::as_class(object);
                self.mark_object((*class).name as *mut Object);
                self.mark_table(&(*class).methods);
                if let Some(init) = (*class).init {
                    self.mark_object(init as *mut Object);
                }
            }
            ObjectType::Instance => {
                let instance = crate::object::as_instance(object);
                self.mark_object((*instance).class as *mut Object);
                self.mark_table(&(*instance).fields);
            }
            ObjectType::BoundMethod => {
                let bound = crate::object::as_bound_method(object);
                self.mark_value(&(*bound).receiver);
                self.mark_object((*bound).method as *mut Object);
            }
        }
    }

    /// Walks the intrusive object list rooted at `head`, freeing every
    /// unmarked object and clearing the mark bit on survivors. Returns the
    /// new head and the number of bytes freed.
    ///
    /// # Safety
    /// Every node reachable from `head` via `next` must be a live,
    /// correctly-kinded allocation.
    pub unsafe fn sweep(&mut self, head: *mut Object) -> (*mut Object, usize) {
        let mut freed_bytes = 0;
        let mut previous: *mut Object = std::ptr::null_mut();
        let mut current = head;
        let mut new_head = head;

        while !current.is_null() {
            let next = (*current).next;
            if (*current).mark {
                (*current).mark = false;
                previous = current;
            } else {
                freed_bytes += crate::object::deep_size(current);
                if previous.is_null() {
                    new_head = next;
                } else {
                    (*previous).next = next;
                }
                crate::object::debug_drop_trace(current);
                drop(Box::from_raw(current));
            }
            current = next;
        }

        gc_trace!("sweep freed_bytes={}", freed_bytes);
        (new_head, freed_bytes)
    }

    pub fn record_cycle(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.stats.record(before, freed, after, next_trigger);
        gc_trace!(
            "cycle cycles={} freed={} before={} after={} next_trigger={}",
            self.stats.cycles,
            freed,
            before,
            after,
            next_trigger
        );
    }

    pub fn stats(&self) -> &GCStats {
        &self.stats
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjString;

    unsafe fn link(head: *mut Object, s: Box<ObjString>) -> *mut Object {
        let ptr = Box::into_raw(s) as *mut Object;
        (*ptr).next = head;
        ptr
    }

    #[test]
    fn sweep_frees_unmarked_and_preserves_marked() {
        unsafe {
            let mut head: *mut Object = std::ptr::null_mut();
            head = link(head, ObjString::new("drop1"));
            head = link(head, ObjString::new("drop2"));
            let keep = link(head, ObjString::new("keep"));
            head = keep;

            let mut gc = GarbageCollector::new();
            gc.mark_object(keep);
            gc.trace_references();

            let (new_head, freed) = gc.sweep(head);
            assert!(freed > 0);
            // Only the marked node should remain in the list.
            assert_eq!(new_head, keep);
            assert!((*new_head).next.is_null());
        }
    }

    #[test]
    fn gc_stats_record_cycle() {
        let mut gc = GarbageCollector::new();
        assert_eq!(gc.stats().cycles, 0);
        gc.record_cycle(1000, 400, 600, 1200);
        assert_eq!(gc.stats().cycles, 1);
        assert_eq!(gc.stats().last_before_bytes, 1000);
        assert_eq!(gc.stats().last_freed_bytes, 400);
        assert_eq!(gc.stats().last_after_bytes, 600);
        assert_eq!(gc.stats().last_next_trigger_bytes, 1200);
        assert_eq!(gc.stats().total_freed_bytes, 400);
    }
}
