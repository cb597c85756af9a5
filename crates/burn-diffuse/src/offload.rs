//! Single-owner device residency for low-memory mode
//!
//! At most one sub-model occupies fast device memory at a time. Each
//! forward pass is wrapped in a [`DeviceLease`]: acquire on enter, evict
//! on drop. When low-memory mode is off the lease is a no-op and the
//! component keeps its permanent device placement.

use std::ops::{Deref, DerefMut};

use crate::models::Component;

/// Arbiter over the single device-memory slot
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceArbiter {
    enabled: bool,
}

impl DeviceArbiter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Whether residency is actually being time-multiplexed
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Lease the device slot to one component for the enclosing scope
    pub fn lease<'a, C: Component + ?Sized>(&self, component: &'a mut C) -> DeviceLease<'a, C> {
        if self.enabled {
            component.to_device();
        }
        DeviceLease {
            component,
            evict: self.enabled,
        }
    }
}

/// Scoped ownership of the device-memory slot.
///
/// Dereferences to the leased component; eviction happens exactly once,
/// on drop, at scope exit.
pub struct DeviceLease<'a, C: Component + ?Sized> {
    component: &'a mut C,
    evict: bool,
}

impl<C: Component + ?Sized> Deref for DeviceLease<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.component
    }
}

impl<C: Component + ?Sized> DerefMut for DeviceLease<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.component
    }
}

impl<C: Component + ?Sized> Drop for DeviceLease<'_, C> {
    fn drop(&mut self) {
        if self.evict {
            self.component.to_host();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Probe {
        resident: bool,
        moves: usize,
    }

    impl Component for Probe {
        fn to_device(&mut self) {
            self.resident = true;
            self.moves += 1;
        }

        fn to_host(&mut self) {
            self.resident = false;
            self.moves += 1;
        }

        fn offload_capable(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_lease_acquires_and_evicts() {
        let arbiter = DeviceArbiter::new(true);
        let mut probe = Probe::default();
        {
            let lease = arbiter.lease(&mut probe);
            assert!(lease.resident);
        }
        assert!(!probe.resident);
        assert_eq!(probe.moves, 2); // one acquire, one evict, never doubled
    }

    #[test]
    fn test_disabled_lease_is_noop() {
        let arbiter = DeviceArbiter::new(false);
        let mut probe = Probe::default();
        {
            let _lease = arbiter.lease(&mut probe);
        }
        assert_eq!(probe.moves, 0);
    }
}
