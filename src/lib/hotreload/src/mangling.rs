//! Symbol name conventions shared by the symbol reader and the JIT pipeline.
//!
//! Managed functions are exported as `kfun:<mangled>` and class descriptors as `kclass:<mangled>`.
//! Object files and images on Apple platforms carry an extra leading `_` on every global symbol;
//! names stored by this crate (definition table, object records) never include it, while names
//! inside a link graph are kept exactly as the object file spells them.

/// Prefix of every mangled managed function.
pub const FUNCTION_PREFIX: &str = "kfun:";
/// Prefix of every mangled class descriptor.
pub const CLASS_PREFIX: &str = "kclass:";
/// Functions under this prefix belong to platform interop and are never reloaded.
pub const PLATFORM_FUNCTION_PREFIX: &str = "kfun:platform.";
/// Classes under this prefix belong to platform interop and are never migrated.
pub const PLATFORM_CLASS_PREFIX: &str = "kclass:platform.";

const IMPL_SUFFIX: &str = "$impl";
const BODY_MARKER: &str = "$body_";
const STUB_PTR_SUFFIX: &str = "$stub_ptr";

/// The global symbol prefix character of the host platform's object format, if any.
pub const fn global_prefix() -> Option<char> {
    if cfg!(target_vendor = "apple") {
        Some('_')
    } else {
        None
    }
}

/// Strip the platform's global prefix from a raw symbol name.
pub fn strip_global_prefix(raw: &str) -> &str {
    match global_prefix() {
        Some(c) => raw.strip_prefix(c).unwrap_or(raw),
        None => raw,
    }
}

/// Add the platform's global prefix to a plain symbol name.
pub fn add_global_prefix(name: &str) -> String {
    match global_prefix() {
        Some(c) => format!("{c}{name}"),
        None => name.to_string(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolClass {
    /// A reloadable managed function.
    Function,
    /// A managed class descriptor.
    Class,
    /// Managed, but reserved for platform interop.
    Reserved,
    /// Anything else.
    Other,
}

/// Classify a symbol name that has already had its global prefix removed.
pub fn classify(name: &str) -> SymbolClass {
    if name.starts_with(PLATFORM_FUNCTION_PREFIX) || name.starts_with(PLATFORM_CLASS_PREFIX) {
        SymbolClass::Reserved
    } else if name.starts_with(FUNCTION_PREFIX) {
        SymbolClass::Function
    } else if name.starts_with(CLASS_PREFIX) {
        SymbolClass::Class
    } else {
        SymbolClass::Other
    }
}

/// Classify a symbol name exactly as it appears in an object file.
pub fn classify_raw(raw: &str) -> SymbolClass {
    classify(strip_global_prefix(raw))
}

/// Returns true for C++ type-info and type-name symbols, with or without the global prefix.
pub fn is_cxx_rtti(raw: &str) -> bool {
    let name = raw.strip_prefix('_').unwrap_or(raw);
    // Itanium names start with `_Z`; after stripping one underscore, `ZTI`/`ZTS` remain, and the
    // Mach-O spelling `__ZTI` leaves `_ZTI`.
    ["ZTI", "ZTS", "_ZTI", "_ZTS"]
        .iter()
        .any(|p| name.starts_with(p))
}

pub fn impl_name(original: &str) -> String {
    format!("{original}{IMPL_SUFFIX}")
}

pub fn body_name(original: &str, index: u32) -> String {
    format!("{original}{BODY_MARKER}{index}")
}

pub fn stub_ptr_name(original: &str) -> String {
    format!("{original}{STUB_PTR_SUFFIX}")
}

/// If `name` is a renamed function body, return the original name and the body index.
pub fn split_body_name(name: &str) -> Option<(&str, u32)> {
    let (original, index) = name.rsplit_once(BODY_MARKER)?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((original, index.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(classify("kfun:foo#bar(){}"), SymbolClass::Function);
        assert_eq!(classify("kclass:Foo"), SymbolClass::Class);
        assert_eq!(classify("kfun:platform.posix#open"), SymbolClass::Reserved);
        assert_eq!(classify("kclass:platform.Foundation.NSObject"), SymbolClass::Reserved);
        assert_eq!(classify("malloc"), SymbolClass::Other);
    }

    #[test]
    fn rtti_detection() {
        assert!(is_cxx_rtti("_ZTISt9exception"));
        assert!(is_cxx_rtti("__ZTISt9exception"));
        assert!(is_cxx_rtti("_ZTSSt9exception"));
        assert!(is_cxx_rtti("__ZTSSt9exception"));
        assert!(!is_cxx_rtti("_ZN3foo3barEv"));
        assert!(!is_cxx_rtti("kfun:foo"));
    }

    #[test]
    fn body_names_round_trip() {
        let name = body_name("kfun:Foo$Companion#bar(){}", 3);
        assert_eq!(
            split_body_name(&name),
            Some(("kfun:Foo$Companion#bar(){}", 3))
        );
        assert_eq!(split_body_name("kfun:foo$body_"), None);
        assert_eq!(split_body_name("kfun:foo$body_x1"), None);
        assert_eq!(split_body_name("kfun:foo"), None);
    }

    #[test]
    fn global_prefix_handling() {
        let prefixed = add_global_prefix("kfun:foo");
        assert_eq!(strip_global_prefix(&prefixed), "kfun:foo");
        assert_eq!(classify_raw(&prefixed), SymbolClass::Function);
    }
}
