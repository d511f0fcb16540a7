//! Records of every object linked or loaded by the reload path, and the class version chains
//! derived from them.
use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::{
    mangling::{classify, SymbolClass},
    migrate::host::TypeDescriptor,
};

/// The managed symbols provided by one linked object or loaded library. Names never carry the
/// platform's global prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NativeObjectFile {
    functions: BTreeMap<String, Option<usize>>,
    classes: BTreeMap<String, Option<usize>>,
}

impl NativeObjectFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_function(&mut self, name: impl Into<String>, address: Option<usize>) {
        self.functions.insert(name.into(), address);
    }

    pub fn insert_class(&mut self, name: impl Into<String>, address: Option<usize>) {
        self.classes.insert(name.into(), address);
    }

    /// Record a symbol if its name is a reloadable function or class. Returns whether it was kept.
    pub fn record(&mut self, name: &str, address: Option<usize>) -> bool {
        match classify(name) {
            SymbolClass::Function => self.insert_function(name, address),
            SymbolClass::Class => self.insert_class(name, address),
            SymbolClass::Reserved | SymbolClass::Other => return false,
        }
        true
    }

    pub fn functions(&self) -> impl Iterator<Item = (&str, Option<usize>)> {
        self.functions.iter().map(|(n, a)| (n.as_str(), *a))
    }

    pub fn classes(&self) -> impl Iterator<Item = (&str, Option<usize>)> {
        self.classes.iter().map(|(n, a)| (n.as_str(), *a))
    }

    pub fn function(&self, name: &str) -> Option<usize> {
        self.functions.get(name).copied().flatten()
    }

    pub fn class(&self, name: &str) -> Option<usize> {
        self.classes.get(name).copied().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.classes.is_empty()
    }
}

/// One version of a class: the descriptor it had after the reload of the given epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassVersion {
    pub epoch: u64,
    pub descriptor: TypeDescriptor,
}

/// A class whose newest version replaced an older one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassRedefinition {
    pub name: String,
    pub old: ClassVersion,
    pub new: ClassVersion,
}

/// Owns every [NativeObjectFile] and the per-class version chains.
#[derive(Debug, Default)]
pub struct ObjectManager {
    objects: Vec<(u64, NativeObjectFile)>,
    classes: HashMap<String, Vec<ClassVersion>>,
}

impl ObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the symbols of an object loaded at `epoch`, extending class version chains.
    pub fn register(&mut self, epoch: u64, file: NativeObjectFile) {
        for (name, address) in file.classes() {
            let Some(address) = address else {
                continue;
            };
            let chain = self.classes.entry(name.to_string()).or_default();
            if chain.last().map(|v| v.descriptor.0) == Some(address) {
                continue;
            }
            trace!("class {} version {} at {:#x}", name, chain.len() + 1, address);
            chain.push(ClassVersion {
                epoch,
                descriptor: TypeDescriptor(address),
            });
        }
        self.objects.push((epoch, file));
    }

    pub fn objects(&self) -> impl Iterator<Item = (u64, &NativeObjectFile)> {
        self.objects.iter().map(|(e, f)| (*e, f))
    }

    pub fn latest(&self) -> Option<&NativeObjectFile> {
        self.objects.last().map(|(_, f)| f)
    }

    pub fn newest_class(&self, name: &str) -> Option<ClassVersion> {
        self.previous_class(name, 0)
    }

    /// Walk a class's version chain from the newest entry. `skip == 0` is the newest version,
    /// `skip == k` the k-th older one; `None` if the chain is not that long.
    pub fn previous_class(&self, name: &str, skip: usize) -> Option<ClassVersion> {
        self.classes.get(name)?.iter().rev().nth(skip).copied()
    }

    pub fn class_versions(&self, name: &str) -> usize {
        self.classes.get(name).map_or(0, |c| c.len())
    }

    /// Classes whose newest version was introduced at `epoch` and which had an older version.
    pub fn redefined_classes(&self, epoch: u64) -> Vec<ClassRedefinition> {
        let mut out: Vec<_> = self
            .classes
            .iter()
            .filter_map(|(name, chain)| {
                let mut versions = chain.iter().rev();
                let new = *versions.next()?;
                let old = *versions.next()?;
                (new.epoch == epoch).then(|| ClassRedefinition {
                    name: name.clone(),
                    old,
                    new,
                })
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
