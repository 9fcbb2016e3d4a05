// (C) 2023 Brandon Lewis
//
// The per-applet value pool.
//
// Every applet declares a byte budget in its module metadata and all of
// its heap values (strings, arrays, objects, function references) are
// charged against that budget. The pool never grows and never reaches
// for the system allocator beyond it: a refused allocation is an
// ordinary None the interpreter turns into a GC-and-retry, then OOM.
//
// Collection is precise mark-and-sweep and runs only when the
// interpreter asks for it, between instructions. Nothing in the
// allocation paths below triggers a collection, which keeps the mark
// tables safe from re-entrant updates.
//
// Strings are interned: allocating the same content twice yields the
// same handle. The intern table doubles as the live-string registry, so
// a sweep can never leave it pointing at a freed cell.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::value::{Value, PoolId, StrRef, ArrayRef, ObjRef, FnRef};


// Byte cost formulas. The header charge stands in for the cell
// bookkeeping a real device pays per allocation.
const STR_HEADER: usize = 8;
const ARRAY_HEADER: usize = 8;
const ARRAY_SLOT: usize = 8;
const OBJECT_HEADER: usize = 16;
const FIELD_SLOT: usize = 8;
const FN_COST: usize = 8;

// GC request threshold: collect when more than 85% of the budget is in
// use.
const PRESSURE_NUM: usize = 85;
const PRESSURE_DEN: usize = 100;


static NEXT_POOL: AtomicU32 = AtomicU32::new(1);


struct StrCell {
    content: String,
    mark: bool
}

struct ArrayCell {
    elems: Vec<Value>,
    mark: bool
}

struct ObjCell {
    class_name: String,
    // insertion-ordered field mapping
    fields: Vec<(String, Value)>,
    mark: bool
}

struct FnCell {
    function_index: u16,
    param_count: u8,
    mark: bool
}


pub struct ValuePool {
    id: PoolId,
    heap_size: usize,
    allocated: usize,
    strings: Vec<Option<StrCell>>,
    string_free: Vec<u32>,
    intern: HashMap<String, u32>,
    arrays: Vec<Option<ArrayCell>>,
    array_free: Vec<u32>,
    objects: Vec<Option<ObjCell>>,
    object_free: Vec<u32>,
    functions: Vec<Option<FnCell>>,
    function_free: Vec<u32>,
}


// Slot recycling over a Vec<Option<Cell>> plus a free list.
macro_rules! insert_cell {
    ($cells:expr, $free:expr, $cell:expr) => {
        match $free.pop() {
            Some(index) => {
                $cells[index as usize] = Some($cell);
                index
            },
            None => {
                $cells.push(Some($cell));
                ($cells.len() - 1) as u32
            }
        }
    }
}

// Sweep one registry, refunding the byte cost of every unmarked cell.
macro_rules! sweep_cells {
    ($cells:expr, $free:expr, $allocated:expr, $cost:expr) => {
        for (index, slot) in $cells.iter_mut().enumerate() {
            let dead = match slot {
                Some(cell) => !cell.mark,
                None => false
            };
            if dead {
                if let Some(cell) = slot.take() {
                    $allocated -= $cost(&cell);
                }
                $free.push(index as u32);
            }
        }
    }
}


fn str_cost(cell: &StrCell) -> usize {
    STR_HEADER + cell.content.len()
}

fn array_cost(cell: &ArrayCell) -> usize {
    ARRAY_HEADER + ARRAY_SLOT * cell.elems.len()
}

fn object_cost(cell: &ObjCell) -> usize {
    OBJECT_HEADER + cell.fields
        .iter()
        .map(|(name, _)| name.len() + FIELD_SLOT)
        .sum::<usize>()
}

fn fn_cost(_cell: &FnCell) -> usize {
    FN_COST
}


impl ValuePool {
    pub fn new(heap_size: usize) -> ValuePool {
        ValuePool {
            id: PoolId(NEXT_POOL.fetch_add(1, Ordering::Relaxed)),
            heap_size,
            allocated: 0,
            strings: Vec::new(),
            string_free: Vec::new(),
            intern: HashMap::new(),
            arrays: Vec::new(),
            array_free: Vec::new(),
            objects: Vec::new(),
            object_free: Vec::new(),
            functions: Vec::new(),
            function_free: Vec::new(),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn available(&self) -> usize {
        self.heap_size - self.allocated
    }

    pub fn under_pressure(&self) -> bool {
        self.allocated * PRESSURE_DEN > self.heap_size * PRESSURE_NUM
    }

    // Charge `cost` against the budget, or refuse.
    fn charge(&mut self, cost: usize) -> Option<()> {
        if self.allocated + cost <= self.heap_size {
            self.allocated += cost;
            Some(())
        } else {
            None
        }
    }

    /*** strings ***/

    pub fn allocate_string(&mut self, content: &str) -> Option<StrRef> {
        if let Some(&index) = self.intern.get(content) {
            return Some(StrRef { pool: self.id, index });
        }
        let cell = StrCell { content: content.to_string(), mark: false };
        self.charge(str_cost(&cell))?;
        let index = insert_cell!(self.strings, self.string_free, cell);
        self.intern.insert(content.to_string(), index);
        Some(StrRef { pool: self.id, index })
    }

    pub fn str_content(&self, r: StrRef) -> &str {
        debug_assert_eq!(r.pool, self.id, "string handle crossed pools");
        match self.strings[r.index as usize] {
            Some(ref cell) => &cell.content,
            None => panic!("stale string handle")
        }
    }

    /*** arrays ***/

    pub fn allocate_array(&mut self, len: usize) -> Option<ArrayRef> {
        let cell = ArrayCell { elems: vec![Value::Null; len], mark: false };
        self.charge(array_cost(&cell))?;
        let index = insert_cell!(self.arrays, self.array_free, cell);
        Some(ArrayRef { pool: self.id, index })
    }

    fn array_cell(&self, r: ArrayRef) -> &ArrayCell {
        debug_assert_eq!(r.pool, self.id, "array handle crossed pools");
        match self.arrays[r.index as usize] {
            Some(ref cell) => cell,
            None => panic!("stale array handle")
        }
    }

    pub fn array_len(&self, r: ArrayRef) -> usize {
        self.array_cell(r).elems.len()
    }

    pub fn array_elems(&self, r: ArrayRef) -> &[Value] {
        &self.array_cell(r).elems
    }

    // Out-of-range reads observe Null.
    pub fn array_get(&self, r: ArrayRef, index: usize) -> Value {
        self.array_cell(r).elems.get(index).copied().unwrap_or(Value::Null)
    }

    // Writing past the end extends the array with Null; the growth is
    // charged and can refuse.
    pub fn array_set(&mut self, r: ArrayRef, index: usize, v: Value) -> Option<()> {
        debug_assert_eq!(r.pool, self.id, "array handle crossed pools");
        let len = self.array_len(r);
        if index >= len {
            self.charge(ARRAY_SLOT * (index + 1 - len))?;
        }
        match self.arrays[r.index as usize] {
            Some(ref mut cell) => {
                if index >= cell.elems.len() {
                    cell.elems.resize(index + 1, Value::Null);
                }
                cell.elems[index] = v;
                Some(())
            },
            None => panic!("stale array handle")
        }
    }

    pub fn array_push(&mut self, r: ArrayRef, v: Value) -> Option<usize> {
        debug_assert_eq!(r.pool, self.id, "array handle crossed pools");
        self.charge(ARRAY_SLOT)?;
        match self.arrays[r.index as usize] {
            Some(ref mut cell) => {
                cell.elems.push(v);
                Some(cell.elems.len())
            },
            None => panic!("stale array handle")
        }
    }

    pub fn array_pop(&mut self, r: ArrayRef) -> Value {
        debug_assert_eq!(r.pool, self.id, "array handle crossed pools");
        match self.arrays[r.index as usize] {
            Some(ref mut cell) => {
                match cell.elems.pop() {
                    Some(v) => {
                        self.allocated -= ARRAY_SLOT;
                        v
                    },
                    None => Value::Null
                }
            },
            None => panic!("stale array handle")
        }
    }

    /*** objects ***/

    pub fn allocate_object(&mut self, class_name: &str) -> Option<ObjRef> {
        let cell = ObjCell {
            class_name: class_name.to_string(),
            fields: Vec::new(),
            mark: false
        };
        self.charge(object_cost(&cell))?;
        let index = insert_cell!(self.objects, self.object_free, cell);
        Some(ObjRef { pool: self.id, index })
    }

    fn object_cell(&self, r: ObjRef) -> &ObjCell {
        debug_assert_eq!(r.pool, self.id, "object handle crossed pools");
        match self.objects[r.index as usize] {
            Some(ref cell) => cell,
            None => panic!("stale object handle")
        }
    }

    pub fn object_class(&self, r: ObjRef) -> &str {
        &self.object_cell(r).class_name
    }

    pub fn object_fields(&self, r: ObjRef) -> &[(String, Value)] {
        &self.object_cell(r).fields
    }

    pub fn field_get(&self, r: ObjRef, name: &str) -> Option<Value> {
        self.object_cell(r).fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    // A new field is charged; updating an existing one is free.
    pub fn field_set(&mut self, r: ObjRef, name: &str, v: Value) -> Option<()> {
        debug_assert_eq!(r.pool, self.id, "object handle crossed pools");
        let existing = self.object_cell(r).fields
            .iter()
            .position(|(n, _)| n == name);
        if existing.is_none() {
            self.charge(name.len() + FIELD_SLOT)?;
        }
        match self.objects[r.index as usize] {
            Some(ref mut cell) => {
                match existing {
                    Some(i) => cell.fields[i].1 = v,
                    None => cell.fields.push((name.to_string(), v))
                }
                Some(())
            },
            None => panic!("stale object handle")
        }
    }

    /*** function references ***/

    pub fn allocate_function(
        &mut self,
        function_index: u16,
        param_count: u8
    ) -> Option<FnRef> {
        let cell = FnCell { function_index, param_count, mark: false };
        self.charge(fn_cost(&cell))?;
        let index = insert_cell!(self.functions, self.function_free, cell);
        Some(FnRef { pool: self.id, index })
    }

    pub fn function_of(&self, r: FnRef) -> (u16, u8) {
        debug_assert_eq!(r.pool, self.id, "function handle crossed pools");
        match self.functions[r.index as usize] {
            Some(ref cell) => (cell.function_index, cell.param_count),
            None => panic!("stale function handle")
        }
    }

    /*** collection ***/

    pub fn collect(&mut self, roots: &[Value]) {
        trace!("gc: {} of {} bytes before", self.allocated, self.heap_size);

        // marks survive from the previous cycle until here
        for cell in self.strings.iter_mut().flatten() { cell.mark = false; }
        for cell in self.arrays.iter_mut().flatten() { cell.mark = false; }
        for cell in self.objects.iter_mut().flatten() { cell.mark = false; }
        for cell in self.functions.iter_mut().flatten() { cell.mark = false; }

        let mut worklist: Vec<Value> = roots.to_vec();
        while let Some(v) = worklist.pop() {
            match v {
                Value::Str(r) => {
                    debug_assert_eq!(r.pool, self.id, "root crossed pools");
                    if let Some(cell) = self.strings[r.index as usize].as_mut() {
                        cell.mark = true;
                    }
                },
                Value::Function(r) => {
                    debug_assert_eq!(r.pool, self.id, "root crossed pools");
                    if let Some(cell) = self.functions[r.index as usize].as_mut() {
                        cell.mark = true;
                    }
                },
                Value::Array(r) => {
                    debug_assert_eq!(r.pool, self.id, "root crossed pools");
                    // marked cells are not re-visited, which terminates cycles
                    let descend = match self.arrays[r.index as usize].as_mut() {
                        Some(cell) if !cell.mark => {
                            cell.mark = true;
                            true
                        },
                        _ => false
                    };
                    if descend {
                        if let Some(cell) = self.arrays[r.index as usize].as_ref() {
                            worklist.extend(cell.elems.iter().copied());
                        }
                    }
                },
                Value::Object(r) => {
                    debug_assert_eq!(r.pool, self.id, "root crossed pools");
                    let descend = match self.objects[r.index as usize].as_mut() {
                        Some(cell) if !cell.mark => {
                            cell.mark = true;
                            true
                        },
                        _ => false
                    };
                    if descend {
                        if let Some(cell) = self.objects[r.index as usize].as_ref() {
                            worklist.extend(cell.fields.iter().map(|(_, v)| *v));
                        }
                    }
                },
                _ => ()
            }
        }

        sweep_cells!(self.strings, self.string_free, self.allocated, str_cost);
        sweep_cells!(self.arrays, self.array_free, self.allocated, array_cost);
        sweep_cells!(self.objects, self.object_free, self.allocated, object_cost);
        sweep_cells!(self.functions, self.function_free, self.allocated, fn_cost);

        let strings = &self.strings;
        self.intern.retain(|_, index| strings[*index as usize].is_some());

        trace!("gc: {} of {} bytes after", self.allocated, self.heap_size);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_is_hard() {
        let mut pool = ValuePool::new(64);
        // 8 header + 32 content
        let a = pool.allocate_string(&"a".repeat(32));
        assert!(a.is_some());
        assert_eq!(pool.allocated(), 40);
        // a second distinct 32-byte string cannot fit
        let b = pool.allocate_string(&"b".repeat(32));
        assert!(b.is_none());
        assert_eq!(pool.allocated(), 40);
        // but the same content is an intern hit, not an allocation
        let c = pool.allocate_string(&"a".repeat(32));
        assert_eq!(c, a);
        assert_eq!(pool.allocated(), 40);
    }

    #[test]
    fn test_interning() {
        let mut pool = ValuePool::new(1024);
        let a = pool.allocate_string("hello").unwrap();
        let b = pool.allocate_string("hello").unwrap();
        let c = pool.allocate_string("world").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_gc_reclaims_garbage() {
        let mut pool = ValuePool::new(1024);
        pool.allocate_string("doomed").unwrap();
        let kept = pool.allocate_string("kept").unwrap();
        let before = pool.allocated();
        assert!(before > 0);

        pool.collect(&[Value::Str(kept)]);
        assert_eq!(pool.allocated(), STR_HEADER + 4);

        // the survivor keeps its identity through the cycle
        let again = pool.allocate_string("kept").unwrap();
        assert_eq!(again, kept);

        // with no roots at all, everything goes
        pool.collect(&[]);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn test_gc_traces_containers() {
        let mut pool = ValuePool::new(1024);
        let s = pool.allocate_string("element").unwrap();
        let arr = pool.allocate_array(1).unwrap();
        pool.array_set(arr, 0, Value::Str(s)).unwrap();

        let obj = pool.allocate_object("Holder").unwrap();
        pool.field_set(obj, "arr", Value::Array(arr)).unwrap();

        pool.collect(&[Value::Object(obj)]);
        // reachable through object -> array -> string
        assert_eq!(pool.str_content(s), "element");
        assert_eq!(pool.array_get(arr, 0), Value::Str(s));
    }

    #[test]
    fn test_gc_handles_cycles() {
        let mut pool = ValuePool::new(1024);
        let a = pool.allocate_array(1).unwrap();
        let b = pool.allocate_array(1).unwrap();
        pool.array_set(a, 0, Value::Array(b)).unwrap();
        pool.array_set(b, 0, Value::Array(a)).unwrap();

        // cycle is reachable: survives
        pool.collect(&[Value::Array(a)]);
        assert_eq!(pool.array_get(a, 0), Value::Array(b));

        // cycle is unreachable: fully reclaimed
        pool.collect(&[]);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn test_array_growth_is_charged() {
        let mut pool = ValuePool::new(64);
        let arr = pool.allocate_array(0).unwrap();
        assert_eq!(pool.allocated(), ARRAY_HEADER);

        // extends to 5 elements
        pool.array_set(arr, 4, Value::Int32(1)).unwrap();
        assert_eq!(pool.allocated(), ARRAY_HEADER + 5 * ARRAY_SLOT);
        assert_eq!(pool.array_get(arr, 3), Value::Null);

        // 8 + 5*8 = 48 used; a 2-slot extension fits, a 3-slot one does not
        assert!(pool.array_set(arr, 7, Value::Int32(2)).is_none());
        assert!(pool.array_set(arr, 6, Value::Int32(2)).is_some());

        let popped = pool.array_pop(arr);
        assert_eq!(popped, Value::Int32(2));
        assert_eq!(pool.allocated(), ARRAY_HEADER + 6 * ARRAY_SLOT);
    }

    #[test]
    fn test_object_fields() {
        let mut pool = ValuePool::new(1024);
        let obj = pool.allocate_object("Config").unwrap();
        pool.field_set(obj, "first", Value::Int32(1)).unwrap();
        pool.field_set(obj, "second", Value::Int32(2)).unwrap();
        pool.field_set(obj, "first", Value::Int32(3)).unwrap();

        assert_eq!(pool.field_get(obj, "first"), Some(Value::Int32(3)));
        assert_eq!(pool.field_get(obj, "missing"), None);

        // insertion order is preserved across updates
        let names: Vec<&str> = pool.object_fields(obj)
            .iter()
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_intern_table_survives_gc() {
        let mut pool = ValuePool::new(1024);
        let doomed = pool.allocate_string("doomed").unwrap();
        pool.collect(&[]);

        // the freed content must not resolve to the old cell
        let fresh = pool.allocate_string("doomed").unwrap();
        assert_eq!(pool.str_content(fresh), "doomed");
        let _ = doomed;
    }
}
