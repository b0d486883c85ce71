//! Property-based tests for the IPC core
//!
//! Random operation sequences check that names stay unique, that user
//! references and the port's send-right count are conserved across moves
//! and copies, and that message data arrives intact.
#![cfg(feature = "std")]


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mach_ipc::ipc::message::MACH_MSG_SIZE_MAX;
use mach_ipc::*;
use proptest::prelude::*;
use proptest_strategies::*;

const SPACES: usize = 3;

fn poll() -> MachMsgOptions {
    MachMsgOptions::receive().with_rcv_timeout(Duration::ZERO)
}

/// Spaces holding send rights to one port, each with an inbox every other
/// space can send to
struct World {
    owner: Arc<IpcSpace>,
    port: ipc::PortRef,
    spaces: Vec<Arc<IpcSpace>>,
    inboxes: Vec<MachPortName>,
    /// `routes[from][to]`: name in `from` of a send right to `to`'s inbox
    routes: Vec<Vec<MachPortName>>,
}

impl World {
    fn new() -> Self {
        let owner = IpcSpace::new();
        let service = mach_port_allocate(&owner, MachPortRight::Receive).unwrap();
        let port = owner.lookup(service).unwrap().port.unwrap();
        let spaces: Vec<_> = (0..SPACES).map(|_| IpcSpace::new()).collect();
        let inboxes: Vec<_> = spaces
            .iter()
            .map(|s| mach_port_allocate(s, MachPortRight::Receive).unwrap())
            .collect();
        let routes = spaces
            .iter()
            .map(|from| {
                spaces
                    .iter()
                    .zip(&inboxes)
                    .map(|(to, inbox)| {
                        let inbox_port = to.lookup(*inbox).unwrap().port.unwrap();
                        mach_port_insert_right(from, &inbox_port, MsgTypeName::MakeSend).unwrap()
                    })
                    .collect()
            })
            .collect();
        Self {
            owner,
            port,
            spaces,
            inboxes,
            routes,
        }
    }

    /// The space's name for the port, if it holds a send right
    fn send_name(&self, i: usize) -> Option<MachPortName> {
        let name = self.spaces[i].reverse_lookup(&self.port)?;
        let entry = self.spaces[i].lookup(name).ok()?;
        entry.rights.contains(MachPortType::SEND).then_some(name)
    }

    fn urefs(&self, i: usize) -> u32 {
        self.send_name(i)
            .map(|name| mach_port_get_refs(&self.spaces[i], name, MachPortRight::Send).unwrap())
            .unwrap_or(0)
    }

    fn apply(&self, op: &RightOp) {
        match *op {
            RightOp::Insert(i) => {
                mach_port_insert_right(&self.spaces[i], &self.port, MsgTypeName::MakeSend).unwrap();
            }
            RightOp::Deallocate(i) => {
                if let Some(name) = self.send_name(i) {
                    mach_port_deallocate(&self.spaces[i], name).unwrap();
                }
            }
            RightOp::AddRef(i) => {
                if let Some(name) = self.send_name(i) {
                    mach_port_mod_refs(&self.spaces[i], name, MachPortRight::Send, 1).unwrap();
                }
            }
            RightOp::Transfer { from, to, moved } => {
                let Some(name) = self.send_name(from) else {
                    return;
                };
                let disposition = if moved { MsgTypeName::MoveSend } else { MsgTypeName::CopySend };
                let msg = MachMessage::new(self.routes[from][to], MsgTypeName::CopySend, 1)
                    .with_port(name, disposition);
                mach_msg_send(&self.spaces[from], msg, &MachMsgOptions::send()).unwrap();
                let got =
                    mach_msg_receive(&self.spaces[to], self.inboxes[to], MACH_MSG_SIZE_MAX, &poll())
                        .unwrap();
                let MsgItem::Port { name: arrived, .. } = got.body[0] else {
                    panic!("expected a port item");
                };
                assert_eq!(Some(arrived), self.send_name(to));
            }
        }
    }
}

// ════════════════════════════════════════════════════════════
// Reference Conservation
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// User references follow a simple model, and the port counts exactly
    /// one send right per space holding any
    #[test]
    fn send_rights_are_conserved(ops in right_ops(SPACES, 40)) {
        let world = World::new();
        let mut model = [0u32; SPACES];
        for op in &ops {
            world.apply(op);
            match *op {
                RightOp::Insert(i) => model[i] += 1,
                RightOp::AddRef(i) if model[i] > 0 => model[i] += 1,
                RightOp::Deallocate(i) if model[i] > 0 => model[i] -= 1,
                RightOp::Transfer { from, to, moved } if model[from] > 0 => {
                    if moved {
                        model[from] -= 1;
                    }
                    model[to] += 1;
                }
                _ => {}
            }
            for (i, expected) in model.iter().enumerate() {
                prop_assert_eq!(world.urefs(i), *expected, "space {} after {:?}", i, op);
            }
            let holders = model.iter().filter(|n| **n > 0).count() as u32;
            prop_assert_eq!(world.port.send_right_count(), holders);
        }
        world.owner.destroy();
        prop_assert!(world.port.is_dead());
        for i in 0..SPACES {
            prop_assert_eq!(world.send_name(i), None);
        }
    }
}

// ════════════════════════════════════════════════════════════
// Naming
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Live names are distinct and resolve; destroyed names never resolve again
    #[test]
    fn names_stay_unique(ops in name_ops(120)) {
        let space = IpcSpace::new();
        let mut live: Vec<MachPortName> = Vec::new();
        let mut retired: HashSet<MachPortName> = HashSet::new();
        for op in ops {
            match op {
                NameOp::Allocate => {
                    let name = mach_port_allocate(&space, MachPortRight::Receive).unwrap();
                    prop_assert!(!live.contains(&name));
                    live.push(name);
                }
                NameOp::Destroy(n) if !live.is_empty() => {
                    let name = live.remove(n % live.len());
                    mach_port_destroy(&space, name).unwrap();
                    retired.insert(name);
                }
                NameOp::Destroy(_) => {}
            }
        }
        for name in &live {
            prop_assert!(space.lookup(*name).is_ok());
        }
        for name in &retired {
            if !live.contains(name) {
                prop_assert!(space.lookup(*name).is_err());
            }
        }
        prop_assert_eq!(space.entry_count() as usize, live.len());
    }
}

// ════════════════════════════════════════════════════════════
// Data Integrity
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Inline data arrives byte for byte, in order
    #[test]
    fn inline_payloads_arrive_intact(payloads in prop::collection::vec(payload(), 1..5)) {
        let space = IpcSpace::new();
        let name = mach_port_allocate(&space, MachPortRight::Receive).unwrap();
        for (id, data) in payloads.iter().enumerate() {
            let msg = MachMessage::new(name, MsgTypeName::MakeSend, id as i32).with_inline(data);
            mach_msg_send(&space, msg, &MachMsgOptions::send()).unwrap();
        }
        for (id, data) in payloads.iter().enumerate() {
            let got = mach_msg_receive(&space, name, MACH_MSG_SIZE_MAX, &poll()).unwrap();
            prop_assert_eq!(got.header.msgh_id, id as i32);
            prop_assert_eq!(&got.inline_data(), data);
        }
    }
}
