use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::NonNull;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// FNV-1a, the same hash `original_source/table.c` uses for strings.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjKind {
    String,
    Function,
    Closure,
    Upvalue,
    Array,
    Class,
    Instance,
    BoundMethod,
}

/// Every heap object's common prefix. `#[repr(C)]` so a pointer to any
/// `Obj*` struct below (whose first field is always `header`) can be cast
/// back down to `*mut ObjHeader` and vice versa — the same "header-first"
/// trick `original_source/object.h` uses for its tagged `Obj` union, done
/// here with real distinct Rust types instead of a C union.
#[repr(C)]
pub struct ObjHeader {
    pub kind: ObjKind,
    pub is_marked: Cell<bool>,
    pub next: Cell<Option<NonNull<ObjHeader>>>,
}

#[repr(C)]
pub struct ObjString {
    pub header: ObjHeader,
    pub chars: Box<str>,
    pub hash: u32,
}

#[repr(C)]
pub struct ObjFunction {
    pub header: ObjHeader,
    pub arity: u8,
    pub upvalue_count: Cell<u8>,
    pub chunk: Chunk,
    pub name: Option<ObjRef>,
}

#[repr(C)]
pub struct ObjClosure {
    pub header: ObjHeader,
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Clone, Copy)]
pub enum UpvalueState {
    /// Still points at a live stack slot, by index from the bottom of the
    /// VM's value stack.
    Open(usize),
    Closed(Value),
}

#[repr(C)]
pub struct ObjUpvalue {
    pub header: ObjHeader,
    pub state: Cell<UpvalueState>,
}

#[repr(C)]
pub struct ObjArray {
    pub header: ObjHeader,
    pub values: RefCell<Vec<Value>>,
}

#[repr(C)]
pub struct ObjClass {
    pub header: ObjHeader,
    pub name: ObjRef,
    pub methods: RefCell<Table>,
}

#[repr(C)]
pub struct ObjInstance {
    pub header: ObjHeader,
    pub class: ObjRef,
    pub fields: RefCell<Table>,
}

#[repr(C)]
pub struct ObjBoundMethod {
    pub header: ObjHeader,
    pub receiver: Value,
    pub method: ObjRef,
}

/// A `Copy`-able, non-owning handle into the GC heap. Equality is pointer
/// identity; for strings that coincides with content equality because the
/// heap interns them.
///
/// # Safety
/// Every downcast (`as_string`, `as_function`, ...) is guarded by a `kind()`
/// check before the pointer cast, and relies on every `Obj*` struct above
/// starting with `header: ObjHeader` under `#[repr(C)]` so the cast lands on
/// a valid, fully-initialized value. References handed out by these methods
/// are only valid up to the next allocation that might trigger a
/// collection; callers must not hold one across a `Heap::alloc_*` call.
#[derive(Clone, Copy)]
pub struct ObjRef {
    ptr: NonNull<ObjHeader>,
}

impl ObjRef {
    pub(crate) fn from_raw(ptr: NonNull<ObjHeader>) -> Self {
        Self { ptr }
    }

    pub(crate) fn as_raw(&self) -> NonNull<ObjHeader> {
        self.ptr
    }

    pub fn kind(&self) -> ObjKind {
        unsafe { self.ptr.as_ref().kind }
    }

    pub fn is_marked(&self) -> bool {
        unsafe { self.ptr.as_ref().is_marked.get() }
    }

    pub fn mark(&self) {
        unsafe { self.ptr.as_ref().is_marked.set(true) }
    }

    pub fn unmark(&self) {
        unsafe { self.ptr.as_ref().is_marked.set(false) }
    }

    pub fn as_string(&self) -> Option<&ObjString> {
        (self.kind() == ObjKind::String).then(|| unsafe { self.ptr.cast::<ObjString>().as_ref() })
    }

    pub fn as_function(&self) -> Option<&ObjFunction> {
        (self.kind() == ObjKind::Function)
            .then(|| unsafe { self.ptr.cast::<ObjFunction>().as_ref() })
    }

    pub fn as_closure(&self) -> Option<&ObjClosure> {
        (self.kind() == ObjKind::Closure)
            .then(|| unsafe { self.ptr.cast::<ObjClosure>().as_ref() })
    }

    pub fn as_upvalue(&self) -> Option<&ObjUpvalue> {
        (self.kind() == ObjKind::Upvalue)
            .then(|| unsafe { self.ptr.cast::<ObjUpvalue>().as_ref() })
    }

    pub fn as_array(&self) -> Option<&ObjArray> {
        (self.kind() == ObjKind::Array).then(|| unsafe { self.ptr.cast::<ObjArray>().as_ref() })
    }

    pub fn as_class(&self) -> Option<&ObjClass> {
        (self.kind() == ObjKind::Class).then(|| unsafe { self.ptr.cast::<ObjClass>().as_ref() })
    }

    pub fn as_instance(&self) -> Option<&ObjInstance> {
        (self.kind() == ObjKind::Instance)
            .then(|| unsafe { self.ptr.cast::<ObjInstance>().as_ref() })
    }

    pub fn as_bound_method(&self) -> Option<&ObjBoundMethod> {
        (self.kind() == ObjKind::BoundMethod)
            .then(|| unsafe { self.ptr.cast::<ObjBoundMethod>().as_ref() })
    }

    /// Panics if this isn't a string; used by `Table`, which only ever keys
    /// on interned strings.
    pub(crate) fn string_hash(&self) -> u32 {
        self.as_string().expect("table key is always a string").hash
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}
impl Eq for ObjRef {}

thread_local! {
    /// Arrays currently being formatted on this thread's call stack, so a
    /// self-referential array (`a.append(a)`) prints `[...]` for the cycle
    /// instead of recursing until the stack overflows.
    static PRINTING_ARRAYS: RefCell<Vec<ObjRef>> = const { RefCell::new(Vec::new()) };
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ObjKind::String => write!(f, "{}", self.as_string().unwrap().chars),
            ObjKind::Function => display_function(self.as_function().unwrap(), f),
            ObjKind::Closure => display_function(
                self.as_closure().unwrap().function.as_function().unwrap(),
                f,
            ),
            ObjKind::Upvalue => write!(f, "upvalue"),
            ObjKind::Array => {
                let already_printing = PRINTING_ARRAYS.with(|stack| stack.borrow().contains(self));
                if already_printing {
                    return write!(f, "[...]");
                }
                PRINTING_ARRAYS.with(|stack| stack.borrow_mut().push(*self));
                let result = (|| {
                    write!(f, "[")?;
                    for (i, v) in self.as_array().unwrap().values.borrow().iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{v}")?;
                    }
                    write!(f, "]")
                })();
                PRINTING_ARRAYS.with(|stack| {
                    stack.borrow_mut().pop();
                });
                result
            }
            ObjKind::Class => write!(f, "{}", self.as_class().unwrap().name),
            ObjKind::Instance => {
                write!(f, "{} instance", self.as_instance().unwrap().class.as_class().unwrap().name)
            }
            ObjKind::BoundMethod => display_function(
                self.as_bound_method()
                    .unwrap()
                    .method
                    .as_closure()
                    .unwrap()
                    .function
                    .as_function()
                    .unwrap(),
                f,
            ),
        }
    }
}

fn display_function(function: &ObjFunction, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match function.name {
        Some(name) => write!(f, "<fn {name}>"),
        None => write!(f, "<script>"),
    }
}
