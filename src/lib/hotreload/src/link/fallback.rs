//! Last-resort definitions for a short allow-list of platform symbols.
//!
//! Managed code compiled against a newer SDK can reference notification-name constants or kernel
//! trap entry points that the running process never loaded. Such references may be satisfied
//! with a null constant or a trap that aborts when reached. Nothing else is ever synthesized: a
//! managed function or a C++ type-info symbol that fails to resolve must fail the link.
use std::collections::HashMap;

use tracing::{debug, error};

use crate::mangling::{is_cxx_rtti, strip_global_prefix, FUNCTION_PREFIX};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackKind {
    /// Resolve to a word-sized cell holding zero, so the constant reads as null.
    NullData,
    /// Resolve to a function that logs and aborts the process.
    AbortTrap,
}

static NULL_CELL: usize = 0;

extern "C" fn unresolved_trap() -> ! {
    error!("called a platform trap that was not present at link time");
    std::process::abort()
}

/// The default allow-list. Names are given without the platform's global prefix.
pub fn default_allow_list() -> Vec<(String, FallbackKind)> {
    let data = [
        "NSExtensionHostDidBecomeActiveNotification",
        "NSExtensionHostDidEnterBackgroundNotification",
        "NSExtensionHostWillEnterForegroundNotification",
        "NSExtensionHostWillResignActiveNotification",
        "UIApplicationDidBecomeActiveNotification",
        "UIApplicationDidEnterBackgroundNotification",
        "UIApplicationDidFinishLaunchingNotification",
        "UIApplicationDidReceiveMemoryWarningNotification",
        "UIApplicationWillEnterForegroundNotification",
        "UIApplicationWillResignActiveNotification",
        "UIApplicationWillTerminateNotification",
    ];
    let traps = [
        "mach_msg_trap",
        "mach_msg2_trap",
        "mach_reply_port",
        "task_self_trap",
        "thread_self_trap",
        "host_self_trap",
        "semaphore_signal_trap",
        "semaphore_wait_trap",
    ];
    data.iter()
        .map(|n| (n.to_string(), FallbackKind::NullData))
        .chain(traps.iter().map(|n| (n.to_string(), FallbackKind::AbortTrap)))
        .collect()
}

#[derive(Clone, Debug, Default)]
pub struct WeakFallbackGenerator {
    allowed: HashMap<String, FallbackKind>,
}

impl WeakFallbackGenerator {
    pub fn new<I>(allowed: I) -> Self
    where
        I: IntoIterator<Item = (String, FallbackKind)>,
    {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    /// Produce an address for an unresolved symbol (as spelled in the object), if allowed.
    pub fn generate(&self, raw_name: &str) -> Option<usize> {
        let name = strip_global_prefix(raw_name);
        if raw_name.trim_start_matches('_').starts_with(FUNCTION_PREFIX) {
            debug!("refusing fallback for managed function {}", raw_name);
            return None;
        }
        if is_cxx_rtti(raw_name) {
            debug!("refusing fallback for type info {}", raw_name);
            return None;
        }
        let kind = self.allowed.get(name)?;
        debug!("weak fallback for {}: {:?}", raw_name, kind);
        Some(match kind {
            FallbackKind::NullData => &NULL_CELL as *const usize as usize,
            FallbackKind::AbortTrap => unresolved_trap as usize,
        })
    }
}
