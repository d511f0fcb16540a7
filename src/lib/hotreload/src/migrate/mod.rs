//! Moves live instances of redefined classes onto their new layout.
//!
//! For every class whose newest version arrived with the current reload, each instance reachable
//! from the roots is paired with a freshly allocated instance of the new version. Fields present
//! in both layouts with identical runtime types are copied across (references shallowly), and
//! then every root and heap reference to an old instance is rewritten to its pair.
use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, error, info, trace, warn};

use crate::{
    error::HotReloadErrorKind,
    objects::ClassRedefinition,
};

pub mod host;

use host::{
    FieldInfo, HostRuntime, ObjectRef, SafepointGuard, SafepointScope, SlotRef, TypeDescriptor,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MigrationState {
    #[default]
    OldVersionKnown,
    InstancesLocated,
    NewInstancesAllocated,
    FieldsCopied,
    RootsScanned,
    ReferencesRewritten,
    Done,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub class: String,
    /// Old instances found reachable from the roots.
    pub instances: usize,
    /// Instances that got a new counterpart.
    pub migrated: usize,
    /// Fields of the new layout copied from the old one.
    pub copied_fields: usize,
    /// Fields of the new layout left at their default, because they are new or changed type.
    pub skipped_fields: usize,
    pub rewritten: usize,
    /// References to old instances that had no counterpart and were left in place.
    pub stale: usize,
    pub state: MigrationState,
}

/// Migration of the instances of one class.
pub struct ClassMigration<'h, H: HostRuntime + ?Sized> {
    host: &'h H,
    class: ClassRedefinition,
    state: MigrationState,
    old_instances: Vec<ObjectRef>,
    pairs: HashMap<ObjectRef, ObjectRef>,
    roots: Vec<SlotRef>,
    report: MigrationReport,
}

impl<'h, H: HostRuntime + ?Sized> ClassMigration<'h, H> {
    pub fn new(host: &'h H, class: ClassRedefinition) -> Self {
        let report = MigrationReport {
            class: class.name.clone(),
            ..Default::default()
        };
        Self {
            host,
            class,
            state: MigrationState::OldVersionKnown,
            old_instances: vec![],
            pairs: HashMap::new(),
            roots: vec![],
            report,
        }
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    fn old(&self) -> TypeDescriptor {
        self.class.old.descriptor
    }

    fn new_type(&self) -> TypeDescriptor {
        self.class.new.descriptor
    }

    fn enter(&mut self, state: MigrationState) {
        trace!("{}: {:?} -> {:?}", self.class.name, self.state, state);
        self.state = state;
        self.report.state = state;
    }

    fn all_roots(&self) -> Vec<SlotRef> {
        let mut roots = self.host.global_roots();
        for thread in self.host.thread_roots() {
            roots.extend(thread.locals);
            roots.extend(thread.stack);
        }
        roots
    }

    /// Breadth-first search of everything reachable from the roots for instances of the old type.
    fn locate(&mut self) {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<ObjectRef> = VecDeque::new();
        for slot in self.all_roots() {
            if let Some(obj) = self.host.load(slot) {
                if seen.insert(obj) {
                    queue.push_back(obj);
                }
            }
        }
        while let Some(obj) = queue.pop_front() {
            if self.host.type_of(obj) == self.old() {
                trace!("{}: instance at {:#x} must be migrated", self.class.name, obj.0);
                self.old_instances.push(obj);
            }
            for slot in self.host.reference_slots(obj) {
                if let Some(next) = self.host.load(slot) {
                    if seen.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        self.report.instances = self.old_instances.len();
        self.enter(MigrationState::InstancesLocated);
    }

    fn allocate(&mut self) {
        let new_type = self.new_type();
        for old in &self.old_instances {
            match self.host.allocate(new_type) {
                Some(new) => {
                    self.pairs.insert(*old, new);
                }
                None => error!(
                    "{}: failed to allocate a new instance for {:#x}",
                    self.class.name, old.0
                ),
            }
        }
        self.report.migrated = self.pairs.len();
        self.enter(MigrationState::NewInstancesAllocated);
    }

    /// Match fields by name, and copy only those whose runtime type did not change.
    fn field_plan(&mut self) -> Vec<(FieldInfo, FieldInfo)> {
        let old_fields: HashMap<String, FieldInfo> = self
            .host
            .fields(self.old())
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();
        let mut plan = vec![];
        for new in self.host.fields(self.new_type()) {
            match old_fields.get(&new.name) {
                None => {
                    debug!("{}: field {} is new, not copied", self.class.name, new.name);
                    self.report.skipped_fields += 1;
                }
                Some(old) if old.runtime_type != new.runtime_type => {
                    info!(
                        "{}: field {} changed type from {:?} to {:?}, not copied",
                        self.class.name, new.name, old.runtime_type, new.runtime_type
                    );
                    self.report.skipped_fields += 1;
                }
                Some(old) => {
                    self.report.copied_fields += 1;
                    plan.push((old.clone(), new));
                }
            }
        }
        plan
    }

    fn copy_fields(&mut self) {
        let plan = self.field_plan();
        for (old, new) in &self.pairs {
            for (old_field, new_field) in &plan {
                let value = self.host.read_field(*old, old_field);
                self.host.write_field(*new, new_field, value);
            }
        }
        self.enter(MigrationState::FieldsCopied);
    }

    fn scan_roots(&mut self) {
        self.roots = self.all_roots();
        debug!("{}: scanning {} roots", self.class.name, self.roots.len());
        self.enter(MigrationState::RootsScanned);
    }

    /// Rewrite the reference in `slot` if it points at a migrated instance. Returns whatever the
    /// slot holds afterwards.
    fn rewrite_slot(&mut self, slot: SlotRef) -> Option<ObjectRef> {
        let value = self.host.load(slot)?;
        if let Some(new) = self.pairs.get(&value) {
            self.host.store(slot, Some(*new));
            self.report.rewritten += 1;
            return Some(*new);
        }
        if self.host.type_of(value) == self.old() {
            self.report.stale += 1;
        }
        Some(value)
    }

    fn rewrite(&mut self) {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        for slot in std::mem::take(&mut self.roots) {
            if let Some(obj) = self.rewrite_slot(slot) {
                if seen.insert(obj) {
                    queue.push_back(obj);
                }
            }
        }
        while let Some(obj) = queue.pop_front() {
            for slot in self.host.reference_slots(obj) {
                if let Some(next) = self.rewrite_slot(slot) {
                    if seen.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        self.enter(MigrationState::ReferencesRewritten);
    }

    /// Run every step in order.
    pub fn run(mut self) -> MigrationReport {
        self.locate();
        if !self.old_instances.is_empty() {
            self.allocate();
            self.copy_fields();
            self.scan_roots();
            self.rewrite();
        }
        self.enter(MigrationState::Done);
        if self.report.stale > 0 {
            let kind = HotReloadErrorKind::PartialMigration {
                class: self.class.name.clone(),
                stale: self.report.stale,
            };
            warn!("{}", kind);
        }
        self.report
    }
}

/// Runs class migrations against one host.
pub struct MigrationEngine<'h, H: HostRuntime + ?Sized> {
    host: &'h H,
}

impl<'h, H: HostRuntime + ?Sized> MigrationEngine<'h, H> {
    pub fn new(host: &'h H) -> Self {
        Self { host }
    }

    /// Migrate every redefined class. Mutators must be parked, which the guard attests.
    pub fn migrate<S: SafepointScope + ?Sized>(
        &self,
        _safepoint: &SafepointGuard<'_, S>,
        classes: Vec<ClassRedefinition>,
    ) -> Vec<MigrationReport> {
        classes
            .into_iter()
            .map(|class| {
                debug!(
                    "migrating {} ({:#x} -> {:#x})",
                    class.name, class.old.descriptor.0, class.new.descriptor.0
                );
                let report = ClassMigration::new(self.host, class).run();
                info!(
                    "migrated {}: {}/{} instances, {} references rewritten",
                    report.class, report.migrated, report.instances, report.rewritten
                );
                report
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A toy heap: objects are numbered, slots are (object, field index) pairs encoded in one
    //! word, and globals are slots of object 0.
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::host::*;

    pub const OLD: TypeDescriptor = TypeDescriptor(0x100);
    pub const NEW: TypeDescriptor = TypeDescriptor(0x200);
    pub const OTHER: TypeDescriptor = TypeDescriptor(0x300);

    #[derive(Clone, Debug)]
    pub struct Object {
        pub ty: TypeDescriptor,
        pub values: Vec<FieldValue>,
    }

    #[derive(Default)]
    pub struct ToyHeap {
        pub objects: Mutex<HashMap<usize, Object>>,
        pub layouts: HashMap<TypeDescriptor, Vec<FieldInfo>>,
        pub globals: Mutex<Vec<Option<ObjectRef>>>,
        pub stack: Mutex<Vec<Option<ObjectRef>>>,
        pub suspended: Mutex<bool>,
        pub fail_allocation: bool,
    }

    fn field(name: &str, runtime_type: RuntimeType, offset: usize) -> FieldInfo {
        FieldInfo {
            name: name.into(),
            runtime_type,
            offset,
        }
    }

    const GLOBAL: usize = 1 << 40;
    const STACK: usize = 2 << 40;

    impl ToyHeap {
        pub fn new() -> Self {
            let mut layouts = HashMap::new();
            layouts.insert(
                OLD,
                vec![
                    field("count", RuntimeType::Int32, 0),
                    field("next", RuntimeType::Object, 8),
                    field("ratio", RuntimeType::Float64, 16),
                ],
            );
            layouts.insert(
                NEW,
                vec![
                    field("next", RuntimeType::Object, 0),
                    field("count", RuntimeType::Int32, 8),
                    field("ratio", RuntimeType::Int64, 16),
                    field("label", RuntimeType::Object, 24),
                ],
            );
            layouts.insert(OTHER, vec![field("child", RuntimeType::Object, 0)]);
            Self {
                layouts,
                ..Default::default()
            }
        }

        pub fn add(&self, ty: TypeDescriptor, values: Vec<FieldValue>) -> ObjectRef {
            let mut objects = self.objects.lock();
            let id = (objects.len() + 1) * 0x1000;
            objects.insert(id, Object { ty, values });
            ObjectRef(id)
        }

        pub fn get(&self, obj: ObjectRef) -> Object {
            self.objects.lock()[&obj.0].clone()
        }

        fn default_values(&self, ty: TypeDescriptor) -> Vec<FieldValue> {
            self.layouts[&ty]
                .iter()
                .map(|f| match f.runtime_type {
                    RuntimeType::Object => FieldValue::Reference(None),
                    _ => FieldValue::Primitive(0),
                })
                .collect()
        }

        fn index_of(&self, ty: TypeDescriptor, field: &FieldInfo) -> usize {
            self.layouts[&ty]
                .iter()
                .position(|f| f == field)
                .unwrap()
        }
    }

    impl HeapWalker for ToyHeap {
        fn type_of(&self, object: ObjectRef) -> TypeDescriptor {
            self.objects.lock()[&object.0].ty
        }

        fn type_name(&self, ty: TypeDescriptor) -> String {
            format!("{:#x}", ty.0)
        }

        fn fields(&self, ty: TypeDescriptor) -> Vec<FieldInfo> {
            self.layouts[&ty].clone()
        }

        fn reference_slots(&self, object: ObjectRef) -> Vec<SlotRef> {
            let obj = self.get(object);
            obj.values
                .iter()
                .enumerate()
                .filter(|(_, v)| matches!(v, FieldValue::Reference(_)))
                .map(|(i, _)| SlotRef(object.0 + i))
                .collect()
        }

        fn load(&self, slot: SlotRef) -> Option<ObjectRef> {
            if slot.0 >= STACK {
                return self.stack.lock()[slot.0 - STACK];
            }
            if slot.0 >= GLOBAL {
                return self.globals.lock()[slot.0 - GLOBAL];
            }
            let (obj, index) = (slot.0 & !0xfff, slot.0 & 0xfff);
            match self.objects.lock()[&obj].values[index] {
                FieldValue::Reference(r) => r,
                FieldValue::Primitive(_) => None,
            }
        }

        fn store(&self, slot: SlotRef, value: Option<ObjectRef>) {
            if slot.0 >= STACK {
                self.stack.lock()[slot.0 - STACK] = value;
            } else if slot.0 >= GLOBAL {
                self.globals.lock()[slot.0 - GLOBAL] = value;
            } else {
                let (obj, index) = (slot.0 & !0xfff, slot.0 & 0xfff);
                self.objects.lock().get_mut(&obj).unwrap().values[index] =
                    FieldValue::Reference(value);
            }
        }

        fn read_field(&self, object: ObjectRef, field: &FieldInfo) -> FieldValue {
            let obj = self.get(object);
            obj.values[self.index_of(obj.ty, field)]
        }

        fn write_field(&self, object: ObjectRef, field: &FieldInfo, value: FieldValue) {
            let ty = self.type_of(object);
            let index = self.index_of(ty, field);
            self.objects.lock().get_mut(&object.0).unwrap().values[index] = value;
        }
    }

    impl ObjectAllocator for ToyHeap {
        fn allocate(&self, ty: TypeDescriptor) -> Option<ObjectRef> {
            if self.fail_allocation {
                return None;
            }
            Some(self.add(ty, self.default_values(ty)))
        }
    }

    impl RootEnumerator for ToyHeap {
        fn global_roots(&self) -> Vec<SlotRef> {
            (0..self.globals.lock().len())
                .map(|i| SlotRef(GLOBAL + i))
                .collect()
        }

        fn thread_roots(&self) -> Vec<ThreadRoots> {
            vec![ThreadRoots {
                thread: 1,
                locals: vec![],
                stack: (0..self.stack.lock().len())
                    .map(|i| SlotRef(STACK + i))
                    .collect(),
            }]
        }
    }

    impl SafepointScope for ToyHeap {
        fn suspend(&self, _reason: &str) {
            *self.suspended.lock() = true;
        }

        fn resume(&self) {
            *self.suspended.lock() = false;
        }
    }
}
