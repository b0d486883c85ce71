//! IPC Kernel Objects
//!
//! Based on Mach4 kern/ipc_kobject.h by Rich Draves (1989)
//!
//! A port can stand for a kernel object such as a task, a thread or a
//! device. The IPC core only stores the binding: an opaque object handle and
//! a type tag whose numbering belongs to the kernel that installs it.
//! Message dispatch to kernel servers lives outside the core.

use crate::ipc::port::Port;

/// Kernel object type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KobjectType(pub u32);

impl KobjectType {
    /// Plain user port
    pub const NONE: Self = Self(0);

    pub fn is_kobject(self) -> bool {
        self != Self::NONE
    }
}

/// Kernel object reference (opaque pointer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Kobject(pub usize);

/// Association between a port and a kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortKobject {
    pub kobject: Kobject,
    pub kotype: KobjectType,
}

impl PortKobject {
    pub fn is_kobject(&self) -> bool {
        self.kotype.is_kobject()
    }
}

/// Bind a kernel object to a port, replacing any previous binding.
///
/// Dead ports keep no binding; the call is ignored for them. Binding
/// `KobjectType::NONE` clears it.
pub fn ipc_kobject_set(port: &Port, kobject: Kobject, kotype: KobjectType) {
    let mut data = port.lock();
    if !port.is_active() {
        return;
    }
    log::trace!("kobject: {} bound to {:?} {:#x}", port.id(), kotype, kobject.0);
    data.kobject = PortKobject { kobject, kotype };
}

/// Kernel object bound to a port, if any
pub fn ipc_kobject_get(port: &Port) -> Option<PortKobject> {
    let kobject = port.lock().kobject;
    kobject.is_kobject().then_some(kobject)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASK: KobjectType = KobjectType(2);

    #[test]
    fn test_port_binding() {
        let port = Port::new(1);
        assert!(ipc_kobject_get(&port).is_none());

        ipc_kobject_set(&port, Kobject(0x1000), TASK);
        let ko = ipc_kobject_get(&port).unwrap();
        assert_eq!(ko.kotype, TASK);
        assert_eq!(ko.kobject, Kobject(0x1000));

        ipc_kobject_set(&port, Kobject(0x1000), KobjectType::NONE);
        assert!(ipc_kobject_get(&port).is_none());
    }

    #[test]
    fn test_dead_port_keeps_no_binding() {
        let port = Port::new(1);
        ipc_kobject_set(&port, Kobject(0x2000), TASK);
        port.destroy();
        assert!(ipc_kobject_get(&port).is_none());

        ipc_kobject_set(&port, Kobject(0x2000), TASK);
        assert!(ipc_kobject_get(&port).is_none());
    }
}
