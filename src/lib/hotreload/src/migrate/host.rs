//! What the migration engine needs from the managed runtime hosting it.
//!
//! The engine never touches object memory itself. Everything goes through these narrow
//! capabilities, so a runtime can put its own barriers and bookkeeping behind each access.
use tracing::debug;

/// An object in the managed heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(pub usize);

/// The runtime's description of a class; for compiled classes this is the address of the class
/// symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeDescriptor(pub usize);

/// A location that holds an object reference: a global, a thread-local, a stack slot, or a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotRef(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeType {
    Object,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    NativePtr,
    Boolean,
    Vector128,
}

impl RuntimeType {
    pub fn size(&self) -> usize {
        match self {
            RuntimeType::Int8 | RuntimeType::Boolean => 1,
            RuntimeType::Int16 => 2,
            RuntimeType::Int32 | RuntimeType::Float32 => 4,
            RuntimeType::Int64 | RuntimeType::Float64 => 8,
            RuntimeType::Object | RuntimeType::NativePtr => std::mem::size_of::<usize>(),
            RuntimeType::Vector128 => 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub runtime_type: RuntimeType,
    pub offset: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Reference(Option<ObjectRef>),
    /// Raw bits of a primitive field, zero-extended.
    Primitive(u128),
}

pub trait HeapWalker: Send + Sync {
    fn type_of(&self, object: ObjectRef) -> TypeDescriptor;

    fn type_name(&self, ty: TypeDescriptor) -> String;

    /// The declared fields of instances of `ty`.
    fn fields(&self, ty: TypeDescriptor) -> Vec<FieldInfo>;

    /// Every slot inside `object` that holds a reference.
    fn reference_slots(&self, object: ObjectRef) -> Vec<SlotRef>;

    fn load(&self, slot: SlotRef) -> Option<ObjectRef>;

    /// Store a reference, applying whatever barrier the collector requires.
    fn store(&self, slot: SlotRef, value: Option<ObjectRef>);

    fn read_field(&self, object: ObjectRef, field: &FieldInfo) -> FieldValue;

    fn write_field(&self, object: ObjectRef, field: &FieldInfo, value: FieldValue);
}

pub trait ObjectAllocator: Send + Sync {
    /// Allocate a default-initialized instance.
    fn allocate(&self, ty: TypeDescriptor) -> Option<ObjectRef>;
}

/// The root slots of one mutator thread.
#[derive(Clone, Debug, Default)]
pub struct ThreadRoots {
    pub thread: u64,
    /// Thread-local globals.
    pub locals: Vec<SlotRef>,
    pub stack: Vec<SlotRef>,
}

pub trait RootEnumerator: Send + Sync {
    fn global_roots(&self) -> Vec<SlotRef>;

    fn thread_roots(&self) -> Vec<ThreadRoots>;
}

pub trait SafepointScope: Send + Sync {
    /// Park every mutator thread other than the caller. Returns once all are parked.
    fn suspend(&self, reason: &str);

    fn resume(&self);
}

/// Everything a runtime must provide to host hot reload.
pub trait HostRuntime: HeapWalker + ObjectAllocator + RootEnumerator + SafepointScope {}

impl<T> HostRuntime for T where T: HeapWalker + ObjectAllocator + RootEnumerator + SafepointScope {}

/// Mutators stay parked for as long as this guard lives.
#[must_use]
pub struct SafepointGuard<'a, S: SafepointScope + ?Sized> {
    scope: &'a S,
}

pub fn enter_safepoint<'a, S: SafepointScope + ?Sized>(
    scope: &'a S,
    reason: &str,
) -> SafepointGuard<'a, S> {
    debug!("suspending mutators: {}", reason);
    scope.suspend(reason);
    SafepointGuard { scope }
}

impl<S: SafepointScope + ?Sized> Drop for SafepointGuard<'_, S> {
    fn drop(&mut self) {
        debug!("resuming mutators");
        self.scope.resume();
    }
}

/// A host without a managed heap. Reloads still link and rebind code; there is never anything to
/// migrate.
#[derive(Clone, Copy, Debug, Default)]
pub struct DetachedHost;

impl HeapWalker for DetachedHost {
    fn type_of(&self, _object: ObjectRef) -> TypeDescriptor {
        TypeDescriptor(0)
    }

    fn type_name(&self, ty: TypeDescriptor) -> String {
        format!("<type {:#x}>", ty.0)
    }

    fn fields(&self, _ty: TypeDescriptor) -> Vec<FieldInfo> {
        vec![]
    }

    fn reference_slots(&self, _object: ObjectRef) -> Vec<SlotRef> {
        vec![]
    }

    fn load(&self, _slot: SlotRef) -> Option<ObjectRef> {
        None
    }

    fn store(&self, _slot: SlotRef, _value: Option<ObjectRef>) {}

    fn read_field(&self, _object: ObjectRef, _field: &FieldInfo) -> FieldValue {
        FieldValue::Primitive(0)
    }

    fn write_field(&self, _object: ObjectRef, _field: &FieldInfo, _value: FieldValue) {}
}

impl ObjectAllocator for DetachedHost {
    fn allocate(&self, _ty: TypeDescriptor) -> Option<ObjectRef> {
        None
    }
}

impl RootEnumerator for DetachedHost {
    fn global_roots(&self) -> Vec<SlotRef> {
        vec![]
    }

    fn thread_roots(&self) -> Vec<ThreadRoots> {
        vec![]
    }
}

impl SafepointScope for DetachedHost {
    fn suspend(&self, _reason: &str) {}

    fn resume(&self) {}
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting {
        suspended: AtomicUsize,
        resumed: AtomicUsize,
    }

    impl SafepointScope for Counting {
        fn suspend(&self, _reason: &str) {
            self.suspended.fetch_add(1, Ordering::SeqCst);
        }

        fn resume(&self) {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn guard_resumes_on_drop() {
        let scope = Counting::default();
        {
            let _guard = enter_safepoint(&scope, "test");
            assert_eq!(scope.suspended.load(Ordering::SeqCst), 1);
            assert_eq!(scope.resumed.load(Ordering::SeqCst), 0);
        }
        assert_eq!(scope.resumed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detached_host_is_a_host() {
        fn takes(_: &dyn HostRuntime) {}
        takes(&DetachedHost);
        assert!(DetachedHost.allocate(TypeDescriptor(1)).is_none());
    }
}
