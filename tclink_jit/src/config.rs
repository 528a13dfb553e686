//! Configuration of a link session.

use crate::backend::x64::memory::Protection;
use crate::runtime::ring_buffer::ring_buffer_record;

// =============================================================================
// Runtime Hooks
// =============================================================================

/// Entry points in the runtime that generated code transfers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeHooks {
    /// Target of every service-request stub. Receives the request kind in
    /// `rdi`, the descriptor id in `rsi` and the auxiliary word in `rdx`,
    /// and never returns to the stub.
    pub service_request_entry: usize,
    /// Called with the callee frame in the first argument register when a
    /// surprise flag is set on function entry.
    pub function_enter_helper: usize,
    /// Called by ring-buffer trace points.
    pub ring_buffer_helper: usize,
}

/// Placeholder for hooks the embedder has not installed.
extern "C" fn unhooked() {
    tracing::error!("generated code reached an uninstalled runtime hook");
    std::process::abort();
}

impl Default for RuntimeHooks {
    fn default() -> Self {
        Self {
            service_request_entry: unhooked as usize,
            function_enter_helper: unhooked as usize,
            ring_buffer_helper: ring_buffer_record as usize,
        }
    }
}

// =============================================================================
// VM State Layout
// =============================================================================

/// Offsets within the VM thread-local block addressed by `VM_TL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStateLayout {
    /// 32-bit word of pending surprise conditions (signals, timeouts, ...).
    pub condition_flags: i32,
    /// Published VM frame pointer.
    pub vmfp: i32,
    /// Published VM stack pointer.
    pub vmsp: i32,
    /// Published VM program counter.
    pub vmpc: i32,
}

impl Default for VmStateLayout {
    fn default() -> Self {
        Self {
            condition_flags: 0x00,
            vmfp: 0x08,
            vmsp: 0x10,
            vmpc: 0x18,
        }
    }
}

// =============================================================================
// Bind Configuration
// =============================================================================

/// Configuration for a [`LinkSession`](crate::translator::session::LinkSession).
#[derive(Debug, Clone)]
pub struct BindConfig {
    /// Store a sentinel into return-address slots that are about to be
    /// filled lazily, and enable extra checks.
    pub debug: bool,
    /// Emit ring-buffer trace points.
    pub ring_buffer: bool,
    /// Page protection of both code regions.
    pub region_protection: Protection,
    /// Capacity of the main code region in bytes.
    pub main_capacity: usize,
    /// Capacity of the stubs region in bytes.
    pub stubs_capacity: usize,
    /// Maximum number of service-request descriptors.
    pub arena_capacity: usize,
    /// Number of events retained by the diagnostics ring (power of two).
    pub ring_capacity: usize,
    pub hooks: RuntimeHooks,
    pub vm_layout: VmStateLayout,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            debug: cfg!(debug_assertions),
            ring_buffer: false,
            region_protection: Protection::ReadWriteExecute,
            main_capacity: 4 << 20,
            stubs_capacity: 1 << 20,
            arena_capacity: 1 << 16,
            ring_capacity: 1024,
            hooks: RuntimeHooks::default(),
            vm_layout: VmStateLayout::default(),
        }
    }
}

impl BindConfig {
    /// Debugging configuration: sentinels and trace points on.
    pub fn debug() -> Self {
        Self {
            debug: true,
            ring_buffer: true,
            ..Self::default()
        }
    }

    /// Production configuration.
    pub fn release() -> Self {
        Self {
            debug: false,
            ring_buffer: false,
            main_capacity: 64 << 20,
            stubs_capacity: 16 << 20,
            arena_capacity: 1 << 20,
            ..Self::default()
        }
    }

    /// Small regions for tests.
    pub fn for_testing() -> Self {
        Self {
            debug: false,
            ring_buffer: false,
            main_capacity: 64 << 10,
            stubs_capacity: 64 << 10,
            arena_capacity: 4096,
            ring_capacity: 64,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert!(BindConfig::debug().debug);
        assert!(BindConfig::debug().ring_buffer);
        assert!(!BindConfig::release().debug);
        assert_eq!(
            BindConfig::default().region_protection,
            Protection::ReadWriteExecute
        );
        assert!(BindConfig::for_testing().ring_capacity.is_power_of_two());
    }

    #[test]
    fn test_default_hooks_are_installed() {
        let hooks = RuntimeHooks::default();
        assert_ne!(hooks.service_request_entry, 0);
        assert_eq!(hooks.ring_buffer_helper, ring_buffer_record as usize);
    }
}
