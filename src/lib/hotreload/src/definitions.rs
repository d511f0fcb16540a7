//! The table of stubbed functions.
use std::collections::HashMap;

/// What is known about a function that has a stub: how many bodies it has had and where its
/// indirection cell lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefinitionInfo {
    /// Number of bodies linked so far; the first definition counts as 1.
    pub redefinition_count: u32,
    /// Address of the pointer cell the trampoline loads.
    pub ptr_address: usize,
}

/// Definition records keyed by original function name (no global prefix). Entries are created
/// once and never removed; there is exactly one cell per function for the life of the process.
#[derive(Clone, Debug, Default)]
pub struct DefinitionTable {
    entries: HashMap<String, DefinitionInfo>,
}

impl DefinitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<DefinitionInfo> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// The body index the next definition of `name` will receive.
    pub fn next_body_index(&self, name: &str) -> u32 {
        self.entries
            .get(name)
            .map_or(1, |info| info.redefinition_count + 1)
    }

    /// Record the first definition of `name`. Returns false (and changes nothing) if one exists.
    pub fn insert_first(&mut self, name: &str, ptr_address: usize) -> bool {
        if self.entries.contains_key(name) {
            return false;
        }
        self.entries.insert(
            name.to_string(),
            DefinitionInfo {
                redefinition_count: 1,
                ptr_address,
            },
        );
        true
    }

    /// Record that `name` has received body `index`.
    pub fn record_redefinition(&mut self, name: &str, index: u32) -> Option<DefinitionInfo> {
        let info = self.entries.get_mut(name)?;
        info.redefinition_count = info.redefinition_count.max(index);
        Some(*info)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DefinitionInfo)> {
        self.entries.iter().map(|(n, i)| (n.as_str(), i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_bodies() {
        let mut table = DefinitionTable::new();
        assert_eq!(table.next_body_index("kfun:f"), 1);
        assert!(table.insert_first("kfun:f", 0x1000));
        assert!(!table.insert_first("kfun:f", 0x2000));
        assert_eq!(table.get("kfun:f").unwrap().ptr_address, 0x1000);
        assert_eq!(table.next_body_index("kfun:f"), 2);

        let info = table.record_redefinition("kfun:f", 2).unwrap();
        assert_eq!(info.redefinition_count, 2);
        assert_eq!(info.ptr_address, 0x1000);
        assert_eq!(table.next_body_index("kfun:f"), 3);
        assert!(table.record_redefinition("kfun:g", 2).is_none());
    }
}
