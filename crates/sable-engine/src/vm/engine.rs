//! The shared runtime the execution core consumes
//!
//! A context executes against an [`Engine`]: the id-indexed function
//! table, the type registry with per-type behaviours, the object heap,
//! the native function registry, engine-wide properties, and the
//! thread-local active-context stack.
//!
//! The compiler and the full type system live outside this crate; the
//! engine here is the consumer-facing shape of those collaborators — just
//! enough registry to resolve calls, allocate and destroy objects, and
//! route host functions.
//!
//! # Ownership
//!
//! The engine strongly owns registered types and functions. Contexts hold
//! an `Arc` of the engine and one strong function reference (the initial
//! function); everything else is borrowed through the engine for the
//! duration of a call. Script objects live in the handle-indexed heap and
//! are reference counted through [`Engine::add_ref`] / [`Engine::release`].

use super::generic::Generic;
use super::ptr::ObjectHandle;
use super::registers::Registers;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use sable_bytecode::{DataType, FunctionId, FunctionKind, ScriptFunction, TypeId};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Host function entry point; both calling conventions receive the
/// [`Generic`] bridge over the argument area
pub type NativeFn = Arc<dyn Fn(&mut Generic<'_>) + Send + Sync>;

/// Destructor behaviour for a registered type; receives the object's
/// cells, wherever they live (heap body or stack-constructed value)
pub type DestructFn = Arc<dyn Fn(&Engine, &mut [u32]) + Send + Sync>;

/// Constructor behaviour used when a type is constructed without a
/// registered constructor function
pub type ConstructFn = Arc<dyn Fn(&Engine, &mut [u32]) + Send + Sync>;

/// Attached JIT body for a function; receives the live register file and
/// leaves the program pointer where interpretation should resume
pub type JitFn = Arc<dyn Fn(&mut Registers) + Send + Sync>;

/// Callback translating a caught host panic into an exception string
pub type TranslateExceptionFn =
    Arc<dyn Fn(&(dyn std::any::Any + Send)) -> Option<String> + Send + Sync>;

/// Engine-wide tunables
#[derive(Debug, Clone)]
pub struct EngineProperties {
    /// Cells in a context's first stack block
    pub init_stack_size: u32,
    /// Cumulative operand stack cap in cells; 0 = unlimited
    pub max_stack_size: u32,
    /// Call stack record cap; 0 = unlimited
    pub max_call_stack_size: u32,
    /// Concurrent executions on one thread before `TooManyNestedCalls`
    pub max_nested_calls: u32,
    /// Run garbage collection steps after executions that allocated
    pub auto_garbage_collect: bool,
}

impl Default for EngineProperties {
    fn default() -> Self {
        Self {
            init_stack_size: 1024,
            max_stack_size: 0,
            max_call_stack_size: 0,
            max_nested_calls: 100,
            auto_garbage_collect: true,
        }
    }
}

/// A registered object type
///
/// Carries the layout and resolution data the interpreter needs:
/// reference/value kind, field layout for handle release, the virtual
/// function table, and the implemented interfaces with their vtable
/// chunk offsets.
pub struct TypeInfo {
    pub id: TypeId,
    pub name: String,
    /// Object size in cells
    pub size: u32,
    /// Reference-counted reference type (as opposed to a value type)
    pub is_reference: bool,
    pub is_script_object: bool,
    /// Reference type without reference counting
    pub is_nocount: bool,
    pub derives_from: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    /// Offset of each interface's chunk in the vtable, index-paired with
    /// `interfaces`
    pub interface_vft_offsets: Vec<u32>,
    pub virtual_function_table: Vec<FunctionId>,
    /// All methods, for interface signature scans
    pub methods: Vec<FunctionId>,
    /// Cell layout of script-object fields; counted fields are released
    /// when the object dies
    pub fields: Vec<DataType>,
    pub construct: Option<ConstructFn>,
    pub destruct: Option<DestructFn>,
}

impl TypeInfo {
    /// A bare value type of `size` cells
    pub fn value_type(name: &str, size: u32) -> Self {
        Self {
            id: TypeId(0),
            name: name.to_string(),
            size,
            is_reference: false,
            is_script_object: false,
            is_nocount: false,
            derives_from: None,
            interfaces: Vec::new(),
            interface_vft_offsets: Vec::new(),
            virtual_function_table: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            construct: None,
            destruct: None,
        }
    }

    /// A reference-counted script class of `size` cells
    pub fn script_class(name: &str, size: u32) -> Self {
        let mut t = Self::value_type(name, size);
        t.is_reference = true;
        t.is_script_object = true;
        t
    }
}

/// What a heap object holds
#[derive(Debug, Clone)]
pub enum ObjectBody {
    /// Ordinary object data cells
    Data(Vec<u32>),
    /// A function pointer value; with a receiver it is a delegate
    Function {
        target: FunctionId,
        receiver: Option<ObjectHandle>,
    },
    /// Raw initialization-list memory
    Buffer(Vec<u32>),
}

/// A reference-counted object in the engine heap
#[derive(Debug)]
pub struct HeapObject {
    pub type_id: TypeId,
    pub refcount: u32,
    pub body: ObjectBody,
}

/// Handle-indexed slab of script objects
///
/// Handles are slab index + 1, so the zero word stays the null pointer.
#[derive(Debug, Default)]
pub struct ObjectHeap {
    slots: Vec<Option<HeapObject>>,
    free: Vec<u32>,
    /// Total allocations over the heap's lifetime
    created: u64,
}

impl ObjectHeap {
    fn allocate(&mut self, obj: HeapObject) -> ObjectHandle {
        self.created += 1;
        let raw = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(obj);
                i + 1
            }
            None => {
                self.slots.push(Some(obj));
                self.slots.len() as u32
            }
        };
        ObjectHandle::new(raw).expect("slab produced zero handle")
    }

    /// Shared access to a live object
    pub fn get(&self, handle: ObjectHandle) -> Option<&HeapObject> {
        self.slots
            .get(handle.raw() as usize - 1)
            .and_then(|s| s.as_ref())
    }

    /// Mutable access to a live object
    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut HeapObject> {
        self.slots
            .get_mut(handle.raw() as usize - 1)
            .and_then(|s| s.as_mut())
    }

    fn remove(&mut self, handle: ObjectHandle) -> Option<HeapObject> {
        let slot = self.slots.get_mut(handle.raw() as usize - 1)?;
        let obj = slot.take();
        if obj.is_some() {
            self.free.push(handle.raw() - 1);
        }
        obj
    }

    /// Objects currently alive
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Total allocations made
    pub fn created_count(&self) -> u64 {
        self.created
    }
}

thread_local! {
    /// Per-thread stack of executing context ids, pushed on `execute`
    /// entry and popped on exit
    static ACTIVE_CONTEXTS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Id of the context currently executing on this thread, if any
pub fn active_context_id() -> Option<u64> {
    ACTIVE_CONTEXTS.with(|s| s.borrow().last().copied())
}

pub(crate) fn push_active_context(id: u64) -> usize {
    ACTIVE_CONTEXTS.with(|s| {
        let mut s = s.borrow_mut();
        s.push(id);
        s.len()
    })
}

pub(crate) fn pop_active_context(id: u64) {
    ACTIVE_CONTEXTS.with(|s| {
        let popped = s.borrow_mut().pop();
        debug_assert_eq!(popped, Some(id));
    });
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_context_id() -> u64 {
    NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// The shared runtime: registries, heap, globals and properties
pub struct Engine {
    properties: EngineProperties,
    functions: RwLock<Vec<Arc<ScriptFunction>>>,
    natives: RwLock<FxHashMap<FunctionId, NativeFn>>,
    types: RwLock<Vec<Arc<TypeInfo>>>,
    heap: Mutex<ObjectHeap>,
    globals: RwLock<Vec<u32>>,
    bound_imports: RwLock<FxHashMap<FunctionId, FunctionId>>,
    jit_bodies: RwLock<FxHashMap<FunctionId, JitFn>>,
    /// Interned function-pointer objects, one per function
    func_objects: Mutex<FxHashMap<FunctionId, ObjectHandle>>,
    /// Lazily registered type backing function-pointer objects
    builtin_funcdef: Mutex<Option<TypeId>>,
    /// Lazily registered type backing raw list buffers
    builtin_list: Mutex<Option<TypeId>>,
    translate_exception: RwLock<Option<TranslateExceptionFn>>,
}

impl Engine {
    pub fn new(properties: EngineProperties) -> Arc<Self> {
        Arc::new(Self {
            properties,
            functions: RwLock::new(Vec::new()),
            natives: RwLock::new(FxHashMap::default()),
            types: RwLock::new(Vec::new()),
            heap: Mutex::new(ObjectHeap::default()),
            globals: RwLock::new(Vec::new()),
            bound_imports: RwLock::new(FxHashMap::default()),
            jit_bodies: RwLock::new(FxHashMap::default()),
            func_objects: Mutex::new(FxHashMap::default()),
            builtin_funcdef: Mutex::new(None),
            builtin_list: Mutex::new(None),
            translate_exception: RwLock::new(None),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(EngineProperties::default())
    }

    #[inline]
    pub fn properties(&self) -> &EngineProperties {
        &self.properties
    }

    // ========================================================================
    // Function table
    // ========================================================================

    /// Register a function; its id is assigned from the table position
    pub fn register_function(&self, mut func: ScriptFunction) -> FunctionId {
        let mut table = self.functions.write();
        let id = FunctionId(table.len() as u32);
        func.id = id;
        table.push(Arc::new(func));
        id
    }

    /// Register a host function together with its native entry point
    pub fn register_system_function(&self, func: ScriptFunction, native: NativeFn) -> FunctionId {
        debug_assert!(matches!(
            func.kind,
            FunctionKind::System | FunctionKind::Generic
        ));
        let id = self.register_function(func);
        self.natives.write().insert(id, native);
        id
    }

    pub fn function(&self, id: FunctionId) -> Option<Arc<ScriptFunction>> {
        self.functions.read().get(id.0 as usize).cloned()
    }

    pub fn native(&self, id: FunctionId) -> Option<NativeFn> {
        self.natives.read().get(&id).cloned()
    }

    /// Bind an imported function to its implementation
    pub fn bind_imported_function(&self, import: FunctionId, target: FunctionId) {
        self.bound_imports.write().insert(import, target);
    }

    pub fn bound_import(&self, import: FunctionId) -> Option<FunctionId> {
        self.bound_imports.read().get(&import).copied()
    }

    /// Attach a JIT body to a script function
    pub fn set_jit_body(&self, id: FunctionId, body: JitFn) {
        self.jit_bodies.write().insert(id, body);
    }

    pub fn jit_body(&self, id: FunctionId) -> Option<JitFn> {
        self.jit_bodies.read().get(&id).cloned()
    }

    // ========================================================================
    // Type registry
    // ========================================================================

    /// Register a type; its id is assigned from the registry position
    pub fn register_type(&self, mut info: TypeInfo) -> TypeId {
        let mut types = self.types.write();
        let id = TypeId(types.len() as u32);
        info.id = id;
        types.push(Arc::new(info));
        id
    }

    pub fn type_info(&self, id: TypeId) -> Option<Arc<TypeInfo>> {
        self.types.read().get(id.0 as usize).cloned()
    }

    /// Whether `ty` is `target` or derives from it
    pub fn type_derives_from(&self, ty: TypeId, target: TypeId) -> bool {
        let mut cur = Some(ty);
        while let Some(t) = cur {
            if t == target {
                return true;
            }
            cur = self.type_info(t).and_then(|i| i.derives_from);
        }
        false
    }

    /// Whether `ty` implements the interface `target`
    pub fn type_implements(&self, ty: TypeId, target: TypeId) -> bool {
        self.type_info(ty)
            .map(|i| i.interfaces.contains(&target))
            .unwrap_or(false)
    }

    // ========================================================================
    // Object heap
    // ========================================================================

    /// Allocate a zeroed object of a registered type, refcount 1
    pub fn allocate_object(&self, type_id: TypeId) -> ObjectHandle {
        let size = self
            .type_info(type_id)
            .map(|t| t.size as usize)
            .unwrap_or(0);
        self.heap.lock().allocate(HeapObject {
            type_id,
            refcount: 1,
            body: ObjectBody::Data(vec![0u32; size]),
        })
    }

    /// The type backing raw list buffers, registered on first use
    fn list_buffer_type(&self) -> TypeId {
        let mut slot = self.builtin_list.lock();
        if let Some(id) = *slot {
            return id;
        }
        let mut info = TypeInfo::value_type("$list", 0);
        info.is_reference = true;
        let id = self.register_type(info);
        *slot = Some(id);
        id
    }

    /// Allocate a raw list buffer of `cells` cells, refcount 1
    pub fn allocate_buffer(&self, cells: u32) -> ObjectHandle {
        let type_id = self.list_buffer_type();
        self.heap.lock().allocate(HeapObject {
            type_id,
            refcount: 1,
            body: ObjectBody::Buffer(vec![0u32; cells as usize]),
        })
    }

    /// The type backing function-pointer objects, registered on first use
    pub fn funcdef_type(&self) -> TypeId {
        let mut slot = self.builtin_funcdef.lock();
        if let Some(id) = *slot {
            return id;
        }
        let mut info = TypeInfo::value_type("$func", 0);
        info.is_reference = true;
        let id = self.register_type(info);
        *slot = Some(id);
        id
    }

    /// Allocate a function-pointer object; with a receiver this is a
    /// delegate and the receiver gains a reference
    pub fn allocate_function_object(
        &self,
        target: FunctionId,
        receiver: Option<ObjectHandle>,
    ) -> ObjectHandle {
        let func_type = self.funcdef_type();
        if let Some(r) = receiver {
            self.add_ref(r);
        }
        self.heap.lock().allocate(HeapObject {
            type_id: func_type,
            refcount: 1,
            body: ObjectBody::Function { target, receiver },
        })
    }

    /// The interned function-pointer object for `id`, created on first use
    ///
    /// The intern table holds one reference, so the object survives
    /// individual pushes and pops.
    pub fn function_pointer_object(&self, id: FunctionId) -> ObjectHandle {
        let func_type = self.funcdef_type();
        let mut interned = self.func_objects.lock();
        if let Some(&h) = interned.get(&id) {
            self.add_ref(h);
            return h;
        }
        let h = self.heap.lock().allocate(HeapObject {
            type_id: func_type,
            refcount: 2, // one for the intern table, one for the caller
            body: ObjectBody::Function {
                target: id,
                receiver: None,
            },
        });
        interned.insert(id, h);
        h
    }

    /// Type of a live object
    pub fn object_type(&self, handle: ObjectHandle) -> Option<TypeId> {
        self.heap.lock().get(handle).map(|o| o.type_id)
    }

    /// Function and receiver of a function-pointer object
    pub fn function_object(
        &self,
        handle: ObjectHandle,
    ) -> Option<(FunctionId, Option<ObjectHandle>)> {
        match self.heap.lock().get(handle).map(|o| &o.body) {
            Some(&ObjectBody::Function { target, receiver }) => Some((target, receiver)),
            _ => None,
        }
    }

    /// Read a cell of an object's data
    pub fn read_object(&self, handle: ObjectHandle, offset: u32) -> Option<u32> {
        let heap = self.heap.lock();
        let obj = heap.get(handle)?;
        match &obj.body {
            ObjectBody::Data(cells) | ObjectBody::Buffer(cells) => {
                cells.get(offset as usize).copied()
            }
            ObjectBody::Function { .. } => None,
        }
    }

    /// Write a cell of an object's data
    pub fn write_object(&self, handle: ObjectHandle, offset: u32, v: u32) -> bool {
        let mut heap = self.heap.lock();
        let Some(obj) = heap.get_mut(handle) else {
            return false;
        };
        match &mut obj.body {
            ObjectBody::Data(cells) | ObjectBody::Buffer(cells) => {
                if let Some(c) = cells.get_mut(offset as usize) {
                    *c = v;
                    true
                } else {
                    false
                }
            }
            ObjectBody::Function { .. } => false,
        }
    }

    /// Increase an object's reference count
    pub fn add_ref(&self, handle: ObjectHandle) {
        let mut heap = self.heap.lock();
        if let Some(obj) = heap.get_mut(handle) {
            obj.refcount += 1;
        }
    }

    /// Decrease an object's reference count, destroying it at zero
    ///
    /// Destruction runs the type's destruct behaviour when one is
    /// registered, otherwise releases every counted field per the type's
    /// layout. Delegates release their receiver.
    pub fn release(&self, handle: ObjectHandle) {
        let removed = {
            let mut heap = self.heap.lock();
            match heap.get_mut(handle) {
                Some(obj) => {
                    debug_assert!(obj.refcount > 0);
                    obj.refcount -= 1;
                    if obj.refcount == 0 {
                        heap.remove(handle)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(obj) = removed {
            self.destroy_object(obj);
        }
    }

    fn destroy_object(&self, mut obj: HeapObject) {
        let info = self.type_info(obj.type_id);
        match &mut obj.body {
            ObjectBody::Data(cells) => {
                if let Some(info) = info {
                    if let Some(destruct) = &info.destruct {
                        destruct(self, cells);
                    } else {
                        self.release_counted_fields(&info, cells);
                    }
                }
            }
            ObjectBody::Function { receiver, .. } => {
                if let Some(r) = receiver.take() {
                    self.release(r);
                }
            }
            ObjectBody::Buffer(_) => {}
        }
    }

    /// Release handle-typed fields of an object laid out per `info.fields`
    pub fn release_counted_fields(&self, info: &TypeInfo, cells: &[u32]) {
        let mut offset = 0usize;
        for field in &info.fields {
            let size = field.value_size() as usize;
            if field.is_counted() && offset + 1 < cells.len() {
                let raw =
                    (cells[offset] as u64) | ((cells[offset + 1] as u64) << 32);
                if let Some(h) = super::ptr::VmPtr::from_raw(raw).as_object() {
                    self.release(h);
                }
            }
            offset += size;
        }
    }

    /// Run the destruct behaviour of a type over in-place object cells
    /// (used for stack-constructed value objects)
    pub fn destruct_in_place(&self, type_id: TypeId, cells: &mut [u32]) {
        if let Some(info) = self.type_info(type_id) {
            if let Some(destruct) = &info.destruct {
                destruct(self, cells);
            }
        }
    }

    /// Snapshot of heap statistics: (total created, currently live)
    pub fn heap_stats(&self) -> (u64, usize) {
        let heap = self.heap.lock();
        (heap.created_count(), heap.live_count())
    }

    /// Run `steps` incremental garbage collection steps
    ///
    /// The collector proper lives with the allocator outside this crate;
    /// executions report newly created objects here so collection keeps
    /// pace with allocation.
    pub fn garbage_collect_steps(&self, steps: u64) {
        log::debug!("gc: {} incremental steps requested", steps);
    }

    // ========================================================================
    // Globals
    // ========================================================================

    /// Reserve `cells` global cells, returning the base index
    pub fn allocate_global(&self, cells: u32) -> u32 {
        let mut globals = self.globals.write();
        let base = globals.len() as u32;
        globals.resize((base + cells) as usize, 0);
        base
    }

    pub fn read_global(&self, index: u32) -> u32 {
        self.globals.read().get(index as usize).copied().unwrap_or(0)
    }

    pub fn write_global(&self, index: u32, v: u32) {
        if let Some(c) = self.globals.write().get_mut(index as usize) {
            *c = v;
        }
    }

    pub fn read_global64(&self, index: u32) -> u64 {
        let g = self.globals.read();
        let lo = g.get(index as usize).copied().unwrap_or(0) as u64;
        let hi = g.get(index as usize + 1).copied().unwrap_or(0) as u64;
        lo | (hi << 32)
    }

    pub fn write_global64(&self, index: u32, v: u64) {
        let mut g = self.globals.write();
        if let Some(c) = g.get_mut(index as usize) {
            *c = v as u32;
        }
        if let Some(c) = g.get_mut(index as usize + 1) {
            *c = (v >> 32) as u32;
        }
    }

    // ========================================================================
    // Host exception translation
    // ========================================================================

    /// Install the callback that turns caught host panics into exception
    /// strings
    pub fn set_translate_exception_callback(&self, f: Option<TranslateExceptionFn>) {
        *self.translate_exception.write() = f;
    }

    pub(crate) fn translate_app_exception(
        &self,
        payload: &(dyn std::any::Any + Send),
    ) -> Option<String> {
        self.translate_exception.read().as_ref().and_then(|f| f(payload))
    }
}

// ============================================================================
// Tests
// ============================================================================
