//! Message transfer tests: data, out-of-line memory, rights in transit,
//! flow control, timeouts and interruption
#![cfg(feature = "std")]

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use mach_ipc::ipc::message::MACH_MSG_SIZE_MAX;
use mach_ipc::ipc::notify::MACH_NOTIFY_SEND_ONCE;
use mach_ipc::kern::sched_prim::scheduler;
use mach_ipc::mach_vm::{AnonymousMap, PAGE_SIZE};
use mach_ipc::*;

fn send_opts() -> MachMsgOptions {
    MachMsgOptions::send()
}

fn poll() -> MachMsgOptions {
    MachMsgOptions::receive().with_rcv_timeout(Duration::ZERO)
}

fn wait(ms: u64) -> MachMsgOptions {
    MachMsgOptions::receive().with_rcv_timeout(Duration::from_millis(ms))
}

/// A server space holding `service` and a client space holding a send right to it
fn client_server() -> (Arc<IpcSpace>, MachPortName, Arc<IpcSpace>, MachPortName) {
    let server = IpcSpace::new();
    let service = mach_port_allocate(&server, MachPortRight::Receive).unwrap();
    let port = server.lookup(service).unwrap().port.unwrap();
    let client = IpcSpace::new();
    let send = mach_port_insert_right(&client, &port, MsgTypeName::MakeSend).unwrap();
    (server, service, client, send)
}

// ════════════════════════════════════════════════════════════
// Data
// ════════════════════════════════════════════════════════════

#[test]
fn inline_data_between_spaces() {
    let (server, service, client, send) = client_server();
    let payload: Vec<u8> = (0..=255u8).collect();
    let msg = MachMessage::new(send, MsgTypeName::CopySend, 7).with_inline(&payload);
    mach_msg_send(&client, msg, &send_opts()).unwrap();

    let got = mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &poll()).unwrap();
    assert_eq!(got.header.msgh_id, 7);
    assert_eq!(got.inline_data(), payload);
    assert_eq!(got.header.msgh_local_port, service);
    assert_eq!(got.header.msgh_remote_port, MACH_PORT_NULL);
    // The client's send right is untouched by a copy-send
    assert_eq!(client.lookup(send).unwrap().urefs, 1);
}

#[test]
fn sequence_numbers_count_dequeues() {
    let (server, service, client, send) = client_server();
    for id in 0..3 {
        let msg = MachMessage::new(send, MsgTypeName::CopySend, id);
        mach_msg_send(&client, msg, &send_opts()).unwrap();
    }
    for expected in 0..3u32 {
        let got = mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &poll()).unwrap();
        assert_eq!(got.header.msgh_seqno, expected);
        assert_eq!(got.header.msgh_id, expected as i32);
    }
}

#[test]
fn out_of_line_64k_roundtrip() {
    let (server, service, client, send) = client_server();
    let size = 64 * 1024u64;
    let vm = client.vm_map().clone();
    let addr = vm.allocate(size).unwrap();
    let pattern: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    vm.write(addr, &pattern).unwrap();

    let msg = MachMessage::new(send, MsgTypeName::CopySend, 1).with_ool(addr, size, true);
    mach_msg_send(&client, msg, &send_opts()).unwrap();
    // The sender asked for its copy to be deallocated
    assert!(vm.read(addr, 1).is_err());

    let got = mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &poll()).unwrap();
    assert!(got.header.msgh_bits.is_complex());
    let MsgItem::OutOfLine { address, size: got_size, .. } = got.body[0] else {
        panic!("expected out-of-line memory, got {:?}", got.body[0]);
    };
    assert_eq!(got_size, size);
    assert_eq!(server.vm_map().read(address, size as usize).unwrap(), pattern);
}

#[test]
fn out_of_line_without_deallocate_keeps_source() {
    let (server, service, client, send) = client_server();
    let vm = client.vm_map().clone();
    let addr = vm.allocate(PAGE_SIZE).unwrap();
    vm.write(addr, b"shared").unwrap();

    let msg = MachMessage::new(send, MsgTypeName::CopySend, 1).with_ool(addr, PAGE_SIZE, false);
    mach_msg_send(&client, msg, &send_opts()).unwrap();
    // Later writes by the sender are not seen by the receiver
    vm.write(addr, b"SHARED").unwrap();

    let got = mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &poll()).unwrap();
    let MsgItem::OutOfLine { address, .. } = got.body[0] else {
        panic!("expected out-of-line memory");
    };
    assert_eq!(server.vm_map().read(address, 6).unwrap(), b"shared".to_vec());
    assert_eq!(vm.read(addr, 6).unwrap(), b"SHARED".to_vec());
}

#[test]
fn bad_out_of_line_address_fails_cleanly() {
    let (_server, _service, client, send) = client_server();
    let msg = MachMessage::new(send, MsgTypeName::CopySend, 1).with_ool(0x10, PAGE_SIZE, true);
    assert_eq!(
        mach_msg_send(&client, msg, &send_opts()),
        Err(MsgError::SendInvalidMemory)
    );
    assert_eq!(client.lookup(send).unwrap().urefs, 1);
}

#[test]
fn receiver_map_without_room_keeps_message_queued() {
    // The receiver's address map spans a single page
    let min = AnonymousMap::MIN_ADDRESS;
    let small = Arc::new(AnonymousMap::with_range(min, min + PAGE_SIZE));
    let server = IpcSpace::with_map(IpcSpaceConfig::new(), small.clone());
    let service = mach_port_allocate(&server, MachPortRight::Receive).unwrap();
    let port = server.lookup(service).unwrap().port.unwrap();
    let client = IpcSpace::new();
    let send = mach_port_insert_right(&client, &port, MsgTypeName::MakeSend).unwrap();

    let vm = client.vm_map().clone();
    let addr = vm.allocate(4 * PAGE_SIZE).unwrap();
    vm.write(addr, b"four pages").unwrap();
    let msg =
        MachMessage::new(send, MsgTypeName::CopySend, 4).with_ool(addr, 4 * PAGE_SIZE, true);
    mach_msg_send(&client, msg, &send_opts()).unwrap();
    assert!(vm.read(addr, 1).is_err());

    let err = mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &poll()).unwrap_err();
    assert_eq!(err, MsgError::RcvNoMemory);
    assert_eq!(err.code(), 0x1000_500c);
    assert_eq!(port.status().msgcount, 1);
    assert_eq!(small.region_count(), 0);
    // A second attempt sees the same message, not an emptied one
    assert_eq!(
        mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &poll()).err(),
        Some(MsgError::RcvNoMemory)
    );
    assert_eq!(port.status().msgcount, 1);
}

#[test]
fn deallocating_first_page_keeps_the_rest() {
    let (server, service, client, send) = client_server();
    let vm = client.vm_map().clone();
    let addr = vm.allocate(3 * PAGE_SIZE).unwrap();
    vm.write(addr, b"page zero").unwrap();
    vm.write(addr + 2 * PAGE_SIZE, b"page two").unwrap();

    let msg = MachMessage::new(send, MsgTypeName::CopySend, 1).with_ool(addr, PAGE_SIZE, true);
    mach_msg_send(&client, msg, &send_opts()).unwrap();
    assert!(vm.read(addr, 1).is_err());
    assert_eq!(vm.read(addr + 2 * PAGE_SIZE, 8).unwrap(), b"page two".to_vec());
    assert!(vm.read(addr + PAGE_SIZE, PAGE_SIZE as usize).is_ok());

    let got = mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &poll()).unwrap();
    let MsgItem::OutOfLine { address, size, .. } = got.body[0] else {
        panic!("expected out-of-line memory");
    };
    assert_eq!(size, PAGE_SIZE);
    assert_eq!(server.vm_map().read(address, 9).unwrap(), b"page zero".to_vec());
}

#[test]
fn deallocating_interior_page_keeps_both_ends() {
    let (server, service, client, send) = client_server();
    let vm = client.vm_map().clone();
    let addr = vm.allocate(3 * PAGE_SIZE).unwrap();
    vm.write(addr, b"head").unwrap();
    vm.write(addr + PAGE_SIZE, b"middle").unwrap();
    vm.write(addr + 2 * PAGE_SIZE, b"tail").unwrap();

    let msg = MachMessage::new(send, MsgTypeName::CopySend, 1)
        .with_ool(addr + PAGE_SIZE, PAGE_SIZE, true);
    mach_msg_send(&client, msg, &send_opts()).unwrap();
    assert_eq!(vm.read(addr, 4).unwrap(), b"head".to_vec());
    assert!(vm.read(addr + PAGE_SIZE, 1).is_err());
    assert_eq!(vm.read(addr + 2 * PAGE_SIZE, 4).unwrap(), b"tail".to_vec());

    let got = mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &poll()).unwrap();
    let MsgItem::OutOfLine { address, .. } = got.body[0] else {
        panic!("expected out-of-line memory");
    };
    assert_eq!(server.vm_map().read(address, 6).unwrap(), b"middle".to_vec());
}

#[test]
fn send_once_destination_is_consumed_by_bad_body() {
    let (server, service, client, send) = client_server();
    let reply = mach_port_allocate(&server, MachPortRight::Receive).unwrap();
    let port = server.lookup(reply).unwrap().port.unwrap();
    let once = mach_port_insert_right(&client, &port, MsgTypeName::MakeSendOnce).unwrap();

    let msg =
        MachMessage::new(once, MsgTypeName::MoveSendOnce, 1).with_ool(0x10, PAGE_SIZE, true);
    assert_eq!(
        mach_msg_send(&client, msg, &send_opts()),
        Err(MsgError::SendInvalidMemory)
    );
    assert_eq!(client.lookup(once).err(), Some(IpcError::InvalidName));
    assert_eq!(port.send_once_right_count(), 0);
    let note = mach_msg_receive(&server, reply, MACH_MSG_SIZE_MAX, &poll()).unwrap();
    assert_eq!(note.header.msgh_id, MACH_NOTIFY_SEND_ONCE);
    // The other destination was never touched
    assert_eq!(client.lookup(send).unwrap().urefs, 1);
    assert!(mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &poll()).is_err());
}

#[test]
fn too_large_is_reported_and_kept() {
    let (server, service, client, send) = client_server();
    let msg = MachMessage::new(send, MsgTypeName::CopySend, 3).with_inline(&[0u8; 512]);
    let size = msg.wire_size();
    mach_msg_send(&client, msg, &send_opts()).unwrap();

    match mach_msg_receive(&server, service, 64, &poll()) {
        Err(MsgError::RcvTooLarge { size: needed }) => assert_eq!(needed as usize, size),
        other => panic!("expected RcvTooLarge, got {:?}", other),
    }
    let got = mach_msg_receive(&server, service, size, &poll()).unwrap();
    assert_eq!(got.header.msgh_id, 3);
}

// ════════════════════════════════════════════════════════════
// Rights in transit
// ════════════════════════════════════════════════════════════

#[test]
fn receive_right_moves_between_spaces() {
    let (server, service, client, send) = client_server();
    let moved = mach_port_allocate(&client, MachPortRight::Receive).unwrap();
    let moved_port = client.lookup(moved).unwrap().port.unwrap();
    let keep = mach_port_insert_right(&client, &moved_port, MsgTypeName::MakeSend).unwrap();
    assert_eq!(keep, moved);

    let msg = MachMessage::new(send, MsgTypeName::CopySend, 1)
        .with_port(moved, MsgTypeName::MoveReceive);
    mach_msg_send(&client, msg, &send_opts()).unwrap();
    // The client kept its send right under the same name
    assert_eq!(client.lookup(moved).unwrap().kind, RightKind::SendRight);

    let got = mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &poll()).unwrap();
    let MsgItem::Port { name, disposition } = got.body[0] else {
        panic!("expected a port item");
    };
    assert_eq!(disposition, MsgTypeName::PORT_RECEIVE);
    assert_eq!(server.lookup(name).unwrap().kind, RightKind::ReceiveRight);
    assert_eq!(moved_port.receiver(), Some(server.id()));

    let msg = MachMessage::new(moved, MsgTypeName::CopySend, 2);
    mach_msg_send(&client, msg, &send_opts()).unwrap();
    let got = mach_msg_receive(&server, name, MACH_MSG_SIZE_MAX, &poll()).unwrap();
    assert_eq!(got.header.msgh_id, 2);
}

#[test]
fn send_rights_merge_on_arrival() {
    let (server, service, client, send) = client_server();
    let theirs = mach_port_allocate(&client, MachPortRight::Receive).unwrap();
    for id in 0..3 {
        let msg = MachMessage::new(send, MsgTypeName::CopySend, id)
            .with_port(theirs, MsgTypeName::MakeSend);
        mach_msg_send(&client, msg, &send_opts()).unwrap();
    }
    let mut names = Vec::new();
    for _ in 0..3 {
        let got = mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &poll()).unwrap();
        let MsgItem::Port { name, .. } = got.body[0] else {
            panic!("expected a port item");
        };
        names.push(name);
    }
    assert!(names.iter().all(|n| *n == names[0]));
    assert_eq!(server.lookup(names[0]).unwrap().urefs, 3);
    let port = client.lookup(theirs).unwrap().port.unwrap();
    assert_eq!(port.send_right_count(), 1);
}

#[test]
fn rpc_with_send_once_reply() {
    let (server, service, client, send) = client_server();
    let reply = mach_port_allocate(&client, MachPortRight::Receive).unwrap();

    let handle = thread::spawn(move || {
        let request =
            mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &MachMsgOptions::receive())
                .unwrap();
        let mut data = request.inline_data();
        data.reverse();
        let answer = MachMessage::new(
            request.header.msgh_remote_port,
            MsgTypeName::MoveSendOnce,
            request.header.msgh_id + 100,
        )
        .with_inline(&data);
        mach_msg_send(&server, answer, &MachMsgOptions::send()).unwrap();
        server
    });

    let request = MachMessage::new(send, MsgTypeName::CopySend, 1)
        .with_reply(reply, MsgTypeName::MakeSendOnce)
        .with_inline(b"abc");
    let answer =
        mach_msg_rpc(&client, request, MACH_MSG_SIZE_MAX, &MachMsgOptions::default()).unwrap();
    assert_eq!(answer.header.msgh_id, 101);
    assert_eq!(answer.inline_data(), b"cba".to_vec());
    assert_eq!(answer.header.msgh_local_port, reply);

    let server = handle.join().unwrap();
    // The reply right was used; nothing is left behind in the server
    assert_eq!(server.entry_count(), 1);
    let port = client.lookup(reply).unwrap().port.unwrap();
    assert_eq!(port.send_once_right_count(), 0);
}

// ════════════════════════════════════════════════════════════
// Flow control
// ════════════════════════════════════════════════════════════

#[test]
fn full_queue_blocks_sender_until_receive() {
    let (server, service, client, send) = client_server();
    mach_port_set_qlimit(&server, service, 1).unwrap();
    mach_msg_send(&client, MachMessage::new(send, MsgTypeName::CopySend, 1), &send_opts()).unwrap();

    let (tx, rx) = mpsc::channel();
    let sender = {
        let client = client.clone();
        thread::spawn(move || {
            let result = mach_msg_send(
                &client,
                MachMessage::new(send, MsgTypeName::CopySend, 2),
                &send_opts(),
            );
            tx.send(()).unwrap();
            result
        })
    };
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(mach_port_get_attributes(&server, service).unwrap().msgcount, 1);

    let first = mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &poll()).unwrap();
    assert_eq!(first.header.msgh_id, 1);
    sender.join().unwrap().unwrap();
    let second = mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &wait(1000)).unwrap();
    assert_eq!(second.header.msgh_id, 2);
}

#[test]
fn blocked_senders_are_served_in_order() {
    let (server, service, client, send) = client_server();
    mach_port_set_qlimit(&server, service, 1).unwrap();
    mach_msg_send(&client, MachMessage::new(send, MsgTypeName::CopySend, 0), &send_opts()).unwrap();

    let mut senders = Vec::new();
    for id in 1..=3 {
        let client = client.clone();
        senders.push(thread::spawn(move || {
            mach_msg_send(
                &client,
                MachMessage::new(send, MsgTypeName::CopySend, id),
                &MachMsgOptions::send(),
            )
        }));
        // Let each sender block before the next one starts
        thread::sleep(Duration::from_millis(30));
    }
    for expected in 0..=3 {
        let got = mach_msg_receive(&server, service, MACH_MSG_SIZE_MAX, &wait(1000)).unwrap();
        assert_eq!(got.header.msgh_id, expected);
    }
    for sender in senders {
        sender.join().unwrap().unwrap();
    }
}

#[test]
fn send_timeout_returns_rights() {
    let (server, service, client, send) = client_server();
    mach_port_set_qlimit(&server, service, 1).unwrap();
    mach_msg_send(&client, MachMessage::new(send, MsgTypeName::CopySend, 1), &send_opts()).unwrap();

    let carried = mach_port_allocate(&client, MachPortRight::Receive).unwrap();
    let msg = MachMessage::new(send, MsgTypeName::MoveSend, 2)
        .with_port(carried, MsgTypeName::MoveReceive);
    let start = Instant::now();
    let opts = MachMsgOptions::send().with_send_timeout(Duration::from_millis(30));
    assert_eq!(mach_msg_send(&client, msg, &opts), Err(MsgError::SendTimedOut));
    assert!(start.elapsed() >= Duration::from_millis(30));

    assert_eq!(client.lookup(send).unwrap().kind, RightKind::SendRight);
    assert_eq!(client.lookup(carried).unwrap().kind, RightKind::ReceiveRight);
    let port = server.lookup(service).unwrap().port.unwrap();
    assert_eq!(port.send_right_count(), 1);
}

#[test]
fn receive_timeout() {
    let server = IpcSpace::new();
    let name = mach_port_allocate(&server, MachPortRight::Receive).unwrap();
    let start = Instant::now();
    assert_eq!(
        mach_msg_receive(&server, name, MACH_MSG_SIZE_MAX, &wait(25)).err(),
        Some(MsgError::RcvTimedOut)
    );
    assert!(start.elapsed() >= Duration::from_millis(25));
}

#[test]
fn blocked_receive_is_interrupted() {
    let server = IpcSpace::new();
    let name = mach_port_allocate(&server, MachPortRight::Receive).unwrap();
    let (tx, rx) = mpsc::channel();
    let receiver = {
        let server = server.clone();
        thread::spawn(move || {
            tx.send(scheduler().current_thread()).unwrap();
            mach_msg_receive(&server, name, MACH_MSG_SIZE_MAX, &MachMsgOptions::receive()).err()
        })
    };
    let id = rx.recv().unwrap();
    thread::sleep(Duration::from_millis(20));
    scheduler().thread_abort(id);
    assert_eq!(receiver.join().unwrap(), Some(MsgError::RcvInterrupted));
    // The interrupted receiver left nothing behind on the queue
    let attrs = mach_port_get_attributes(&server, name).unwrap();
    assert_eq!(attrs.msgcount, 0);
}

#[test]
fn port_death_wakes_blocked_receiver_and_sender() {
    let (server, service, client, send) = client_server();
    mach_port_set_qlimit(&server, service, 1).unwrap();
    mach_msg_send(&client, MachMessage::new(send, MsgTypeName::CopySend, 1), &send_opts()).unwrap();
    let sender = {
        let client = client.clone();
        thread::spawn(move || {
            mach_msg_send(
                &client,
                MachMessage::new(send, MsgTypeName::CopySend, 2),
                &MachMsgOptions::send(),
            )
        })
    };
    thread::sleep(Duration::from_millis(30));
    mach_port_destroy(&server, service).unwrap();
    assert_eq!(sender.join().unwrap(), Err(MsgError::SendPortDied));
    assert_eq!(client.lookup(send).unwrap().kind, RightKind::DeadName);

    let other = mach_port_allocate(&server, MachPortRight::Receive).unwrap();
    let receiver = {
        let server = server.clone();
        thread::spawn(move || {
            mach_msg_receive(&server, other, MACH_MSG_SIZE_MAX, &MachMsgOptions::receive()).err()
        })
    };
    thread::sleep(Duration::from_millis(30));
    mach_port_destroy(&server, other).unwrap();
    assert_eq!(receiver.join().unwrap(), Some(MsgError::RcvPortDied));
}

#[test]
fn receiver_without_room_leaves_message_queued() {
    let sender = IpcSpace::new();
    let receiver = IpcSpace::with_config(IpcSpaceConfig::new().max_entries(3));
    let service = mach_port_allocate(&receiver, MachPortRight::Receive).unwrap();
    let filler = mach_port_allocate(&receiver, MachPortRight::DeadName).unwrap();
    let port = receiver.lookup(service).unwrap().port.unwrap();
    let send = mach_port_insert_right(&sender, &port, MsgTypeName::MakeSend).unwrap();
    // The receiver space is now full: the message's right has nowhere to go
    let carried = mach_port_allocate(&sender, MachPortRight::Receive).unwrap();
    let msg = MachMessage::new(send, MsgTypeName::CopySend, 9)
        .with_port(carried, MsgTypeName::MakeSend);
    mach_msg_send(&sender, msg, &send_opts()).unwrap();

    let err = mach_msg_receive(&receiver, service, MACH_MSG_SIZE_MAX, &poll()).unwrap_err();
    assert_eq!(err, MsgError::RcvNoSpace);
    assert_eq!(err.code(), 0x1000_600b);

    mach_port_deallocate(&receiver, filler).unwrap();
    let got = mach_msg_receive(&receiver, service, MACH_MSG_SIZE_MAX, &poll()).unwrap();
    assert_eq!(got.header.msgh_id, 9);
    assert_eq!(got.header.msgh_seqno, 0);
}
