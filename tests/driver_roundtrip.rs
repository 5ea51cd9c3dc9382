//! The driver/channel protocol end to end: registration, request and
//! reply delivery, work retrieval, partial-read locking and the
//! single-pipe broadcast.

mod common;

use common::*;
use ydin::{DriverKind, ErrorCode, EventMask, Kernel, OpenFlags, Syscall, SyscallValue, Whence};

#[test]
fn echo_driver_roundtrip_wakes_only_the_client() {
    init();
    let mut k = Kernel::new();
    let (_srv, ts) = k.spawn_process(10, 10);
    let (_cli, tc) = k.spawn_process(20, 20);
    let (_other, tb) = k.spawn_process(30, 30);

    // a bystander waiting on a user event must not be disturbed
    blocked(
        &mut k,
        tb,
        Syscall::Wait {
            events: EventMask::USER_1,
        },
    );

    let drv = as_file(ok(
        &mut k,
        ts,
        Syscall::CreateDriver {
            name: "echo".into(),
            kind: DriverKind::SERVICE,
        },
    ));

    let ch = as_file(ok(
        &mut k,
        tc,
        Syscall::Open {
            path: "/dev/echo".into(),
            flags: OpenFlags::MSGS | OpenFlags::WRITE,
        },
    ));
    ok(
        &mut k,
        tc,
        Syscall::SendMsg {
            file: ch,
            id: 0x10,
            data: b"hi".to_vec(),
        },
    );

    let (wf, id, data) = as_work(ok(
        &mut k,
        ts,
        Syscall::GetWork {
            files: vec![drv],
            size: 64,
        },
    ));
    assert_eq!(id, 0x10);
    assert_eq!(data, b"hi");

    ok(
        &mut k,
        ts,
        Syscall::SendMsg {
            file: wf,
            id: 0x11,
            data: b"HI".to_vec(),
        },
    );
    let (id, data) = as_message(ok(
        &mut k,
        tc,
        Syscall::ReceiveMsg { file: ch, size: 64 },
    ));
    assert_eq!(id, 0x11);
    assert_eq!(data, b"HI");

    // the bystander is still parked
    assert!(k.take_result(tb).is_none());
}

#[test]
fn get_work_blocks_until_a_client_writes() {
    init();
    let mut k = Kernel::new();
    let (_srv, ts) = k.spawn_process(10, 10);
    let (_cli, tc) = k.spawn_process(20, 20);

    let drv = as_file(ok(
        &mut k,
        ts,
        Syscall::CreateDriver {
            name: "disk0".into(),
            kind: DriverKind::BLOCK,
        },
    ));
    blocked(
        &mut k,
        ts,
        Syscall::GetWork {
            files: vec![drv],
            size: 64,
        },
    );

    let ch = as_file(ok(
        &mut k,
        tc,
        Syscall::Open {
            path: "/dev/disk0".into(),
            flags: OpenFlags::MSGS | OpenFlags::WRITE,
        },
    ));
    ok(
        &mut k,
        tc,
        Syscall::SendMsg {
            file: ch,
            id: 3,
            data: b"sector".to_vec(),
        },
    );

    let (_wf, id, data) = as_work(finished(&mut k, ts).unwrap());
    assert_eq!(id, 3);
    assert_eq!(data, b"sector");
}

#[test]
fn messages_stay_in_write_order() {
    init();
    let mut k = Kernel::new();
    let (_srv, ts) = k.spawn_process(10, 10);
    let (_cli, tc) = k.spawn_process(20, 20);

    let drv = as_file(ok(
        &mut k,
        ts,
        Syscall::CreateDriver {
            name: "seq".into(),
            kind: DriverKind::SERVICE,
        },
    ));
    let ch = as_file(ok(
        &mut k,
        tc,
        Syscall::Open {
            path: "/dev/seq".into(),
            flags: OpenFlags::MSGS | OpenFlags::WRITE,
        },
    ));
    for i in 0..5u8 {
        ok(
            &mut k,
            tc,
            Syscall::SendMsg {
                file: ch,
                id: i,
                data: vec![i; 3],
            },
        );
    }
    // the first message arrives through get_work, the rest through
    // receives on the same work handle
    let (wf, id, data) = as_work(ok(
        &mut k,
        ts,
        Syscall::GetWork {
            files: vec![drv],
            size: 64,
        },
    ));
    assert_eq!((id, data), (0, vec![0u8; 3]));
    for i in 1..5u8 {
        let (id, data) = as_message(ok(
            &mut k,
            ts,
            Syscall::ReceiveMsg { file: wf, size: 64 },
        ));
        assert_eq!((id, data), (i, vec![i; 3]));
    }
}

#[test]
fn get_client_and_open_client_compose_like_get_work() {
    init();
    let mut k = Kernel::new();
    let (_srv, ts) = k.spawn_process(10, 10);
    let (_cli, tc) = k.spawn_process(20, 20);

    let drv = as_file(ok(
        &mut k,
        ts,
        Syscall::CreateDriver {
            name: "manual".into(),
            kind: DriverKind::CHAR,
        },
    ));
    assert_eq!(
        err(
            &mut k,
            ts,
            Syscall::GetClient { files: vec![drv] },
        ),
        ErrorCode::no_client_waiting
    );

    let ch = as_file(ok(
        &mut k,
        tc,
        Syscall::Open {
            path: "/dev/manual".into(),
            flags: OpenFlags::MSGS | OpenFlags::WRITE,
        },
    ));
    ok(
        &mut k,
        tc,
        Syscall::SendMsg {
            file: ch,
            id: 5,
            data: b"req".to_vec(),
        },
    );

    // the client id the server sees is the channel node of the handle
    let client = match ok(&mut k, ts, Syscall::GetClient { files: vec![drv] }) {
        SyscallValue::Client(c) => c,
        other => panic!("expected a client id, got {:?}", other),
    };
    assert_eq!(
        ok(&mut k, tc, Syscall::GetClientId { file: ch }),
        SyscallValue::Client(client)
    );

    let wf = as_file(ok(
        &mut k,
        ts,
        Syscall::OpenClient {
            file: drv,
            client,
        },
    ));
    let (id, data) = as_message(ok(
        &mut k,
        ts,
        Syscall::ReceiveMsg { file: wf, size: 64 },
    ));
    assert_eq!((id, data), (5, b"req".to_vec()));

    // only the driver's owner may serve its channels
    assert_eq!(
        err(
            &mut k,
            tc,
            Syscall::GetClient { files: vec![ch] },
        ),
        ErrorCode::not_own_driver
    );
}

#[test]
fn create_driver_validates_names_and_uniqueness() {
    init();
    let mut k = Kernel::new();
    let (_p1, t1) = k.spawn_process(10, 10);
    let (_p2, t2) = k.spawn_process(20, 20);

    let f = ok(
        &mut k,
        t1,
        Syscall::CreateDriver {
            name: "test".into(),
            kind: DriverKind::SERVICE,
        },
    );
    assert!(matches!(f, SyscallValue::File(_)));
    assert_eq!(
        err(
            &mut k,
            t2,
            Syscall::CreateDriver {
                name: "test".into(),
                kind: DriverKind::SERVICE,
            },
        ),
        ErrorCode::driver_exists
    );
    for bad in ["", "abc.def", "a b"] {
        assert_eq!(
            err(
                &mut k,
                t2,
                Syscall::CreateDriver {
                    name: bad.into(),
                    kind: DriverKind::SERVICE,
                },
            ),
            ErrorCode::inv_driver_name
        );
    }
    // a driver must have exactly one type
    assert_eq!(
        err(
            &mut k,
            t2,
            Syscall::CreateDriver {
                name: "dual".into(),
                kind: DriverKind::BLOCK | DriverKind::CHAR,
            },
        ),
        ErrorCode::invalid_args
    );
}

#[test]
fn seek_on_channels_is_refused() {
    init();
    let mut k = Kernel::new();
    let (_srv, ts) = k.spawn_process(10, 10);
    let (_cli, tc) = k.spawn_process(20, 20);

    ok(
        &mut k,
        ts,
        Syscall::CreateDriver {
            name: "nosk".into(),
            kind: DriverKind::CHAR,
        },
    );
    let ch = as_file(ok(
        &mut k,
        tc,
        Syscall::Open {
            path: "/dev/nosk".into(),
            flags: OpenFlags::MSGS | OpenFlags::READ,
        },
    ));
    assert_eq!(
        err(
            &mut k,
            tc,
            Syscall::Seek {
                file: ch,
                offset: 0,
                whence: Whence::Set,
            },
        ),
        ErrorCode::unsupported_op
    );
}

#[test]
fn partial_read_locks_out_other_handles() {
    init();
    let mut k = Kernel::new();
    let (_srv, ts) = k.spawn_process(10, 10);
    let (_p1, t1) = k.spawn_process(20, 20);
    let (_p2, t2) = k.spawn_process(30, 30);

    let drv = as_file(ok(
        &mut k,
        ts,
        Syscall::CreateDriver {
            name: "shared".into(),
            kind: DriverKind::SERVICE | DriverKind::SINGLE_PIPE,
        },
    ));
    // both clients share the single-pipe channel
    let h1 = as_file(ok(
        &mut k,
        t1,
        Syscall::Open {
            path: "/dev/shared".into(),
            flags: OpenFlags::READ | OpenFlags::WRITE | OpenFlags::MSGS,
        },
    ));
    let h2 = as_file(ok(
        &mut k,
        t2,
        Syscall::Open {
            path: "/dev/shared".into(),
            flags: OpenFlags::READ | OpenFlags::MSGS,
        },
    ));
    assert_ne!(h1, h2, "channel handles are never shared");

    // provoke a reply of 100 payload bytes (105 on the wire)
    ok(
        &mut k,
        t1,
        Syscall::SendMsg {
            file: h1,
            id: 1,
            data: b"gimme".to_vec(),
        },
    );
    let (wf, _, _) = as_work(ok(
        &mut k,
        ts,
        Syscall::GetWork {
            files: vec![drv],
            size: 64,
        },
    ));
    ok(
        &mut k,
        ts,
        Syscall::SendMsg {
            file: wf,
            id: 2,
            data: vec![0xAB; 100],
        },
    );

    // h1 consumes 40 of the 105 wire bytes: channel becomes locked
    let part = as_data(ok(&mut k, t1, Syscall::Read { file: h1, count: 40 }));
    assert_eq!(part.len(), 40);

    // a different handle must wait now
    blocked(&mut k, t2, Syscall::Read { file: h2, count: 105 });

    // h1 finishes the message; the lock falls, h2 runs again and, with
    // the list empty, keeps waiting for the next message
    let rest = as_data(ok(
        &mut k,
        t1,
        Syscall::Read {
            file: h1,
            count: 100,
        },
    ));
    assert_eq!(rest.len(), 65);
    assert!(k.take_result(t2).is_none());

    // the next reply is h2's
    ok(
        &mut k,
        ts,
        Syscall::SendMsg {
            file: wf,
            id: 3,
            data: b"yours".to_vec(),
        },
    );
    let msg = as_data(finished(&mut k, t2).unwrap());
    assert_eq!(msg.len(), 10, "header plus payload");
}

#[test]
fn single_pipe_reply_broadcasts_to_all_waiters() {
    init();
    let mut k = Kernel::new();
    let (_srv, ts) = k.spawn_process(10, 10);
    let (_p1, t1) = k.spawn_process(20, 20);
    let (_p2, t2) = k.spawn_process(30, 30);

    let drv = as_file(ok(
        &mut k,
        ts,
        Syscall::CreateDriver {
            name: "bcast".into(),
            kind: DriverKind::SERVICE | DriverKind::SINGLE_PIPE,
        },
    ));
    let h1 = as_file(ok(
        &mut k,
        t1,
        Syscall::Open {
            path: "/dev/bcast".into(),
            flags: OpenFlags::READ | OpenFlags::WRITE | OpenFlags::MSGS,
        },
    ));
    let h2 = as_file(ok(
        &mut k,
        t2,
        Syscall::Open {
            path: "/dev/bcast".into(),
            flags: OpenFlags::READ | OpenFlags::MSGS,
        },
    ));

    ok(
        &mut k,
        t1,
        Syscall::SendMsg {
            file: h1,
            id: 1,
            data: b"rq".to_vec(),
        },
    );
    let (wf, _, _) = as_work(ok(
        &mut k,
        ts,
        Syscall::GetWork {
            files: vec![drv],
            size: 64,
        },
    ));

    blocked(&mut k, t1, Syscall::ReceiveMsg { file: h1, size: 64 });
    blocked(&mut k, t2, Syscall::ReceiveMsg { file: h2, size: 64 });

    // one reply: every waiter is woken, exactly one of them wins the
    // message, the other goes back to waiting
    ok(
        &mut k,
        ts,
        Syscall::SendMsg {
            file: wf,
            id: 9,
            data: b"one".to_vec(),
        },
    );
    let r1 = k.take_result(t1);
    let r2 = k.take_result(t2);
    let winners = [&r1, &r2]
        .iter()
        .filter(|r| r.is_some())
        .count();
    assert_eq!(winners, 1, "exactly one waiter receives: {:?} {:?}", r1, r2);
}

#[test]
fn nonblocking_receive_returns_empty() {
    init();
    let mut k = Kernel::new();
    let (_srv, ts) = k.spawn_process(10, 10);
    let (_cli, tc) = k.spawn_process(20, 20);

    ok(
        &mut k,
        ts,
        Syscall::CreateDriver {
            name: "quiet".into(),
            kind: DriverKind::SERVICE,
        },
    );
    let ch = as_file(ok(
        &mut k,
        tc,
        Syscall::Open {
            path: "/dev/quiet".into(),
            flags: OpenFlags::READ | OpenFlags::MSGS | OpenFlags::NOBLOCK,
        },
    ));
    let (id, data) = as_message(ok(
        &mut k,
        tc,
        Syscall::ReceiveMsg { file: ch, size: 64 },
    ));
    assert_eq!(id, 0);
    assert!(data.is_empty());
    assert!(as_data(ok(&mut k, tc, Syscall::Read { file: ch, count: 8 })).is_empty());
}

#[test]
fn channel_with_pending_requests_outlives_its_client() {
    init();
    let mut k = Kernel::new();
    let (_srv, ts) = k.spawn_process(10, 10);
    let (_cli, tc) = k.spawn_process(20, 20);

    let drv = as_file(ok(
        &mut k,
        ts,
        Syscall::CreateDriver {
            name: "late".into(),
            kind: DriverKind::SERVICE,
        },
    ));
    let ch = as_file(ok(
        &mut k,
        tc,
        Syscall::Open {
            path: "/dev/late".into(),
            flags: OpenFlags::MSGS | OpenFlags::WRITE,
        },
    ));
    ok(
        &mut k,
        tc,
        Syscall::SendMsg {
            file: ch,
            id: 7,
            data: b"last words".to_vec(),
        },
    );
    // the client disconnects before the server ever looked
    ok(&mut k, tc, Syscall::Close { file: ch });

    // the request is still served
    let (wf, id, data) = as_work(ok(
        &mut k,
        ts,
        Syscall::GetWork {
            files: vec![drv],
            size: 64,
        },
    ));
    assert_eq!(id, 7);
    assert_eq!(data, b"last words");

    // with the queue drained and the client gone, closing the work
    // handle reclaims the channel
    let nodes_before = k.vfs().node_count();
    ok(&mut k, ts, Syscall::Close { file: wf });
    assert!(k.vfs().node_count() < nodes_before);
}

#[test]
fn fork_inherits_handles_by_node_type() {
    init();
    let mut k = Kernel::new();
    let (_srv, ts) = k.spawn_process(10, 10);
    let (parent, tp) = k.spawn_process(20, 20);

    ok(
        &mut k,
        ts,
        Syscall::CreateDriver {
            name: "inh".into(),
            kind: DriverKind::SERVICE,
        },
    );
    let plain = as_file(ok(
        &mut k,
        tp,
        Syscall::Open {
            path: "/system/pipe/plain".into(),
            flags: OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
        },
    ));
    let (pr, _pw) = match ok(&mut k, tp, Syscall::Pipe) {
        SyscallValue::Pipe { read, write } => (read, write),
        other => panic!("expected pipe, got {:?}", other),
    };
    let chan = as_file(ok(
        &mut k,
        tp,
        Syscall::Open {
            path: "/dev/inh".into(),
            flags: OpenFlags::MSGS | OpenFlags::WRITE,
        },
    ));

    let (_child, _ct, map) = k.fork(parent).unwrap();
    let child_of = |f| {
        map.iter()
            .find(|(p, _)| *p == f)
            .map(|(_, c)| *c)
            .expect("handle not inherited")
    };

    // plain files share the entry, pipes get a fresh handle on the same
    // node, channels get a whole fresh channel under the same driver
    assert_eq!(child_of(plain), plain);
    let cr = child_of(pr);
    assert_ne!(cr, pr);
    assert_eq!(
        k.vfs().entry_target(cr).unwrap(),
        k.vfs().entry_target(pr).unwrap()
    );
    let cc = child_of(chan);
    assert_ne!(cc, chan);
    assert_ne!(
        k.vfs().entry_target(cc).unwrap(),
        k.vfs().entry_target(chan).unwrap()
    );
}

#[test]
fn driver_death_invalidates_blocked_clients() {
    init();
    let mut k = Kernel::new();
    let (_srv, ts) = k.spawn_process(10, 10);
    let (_cli, tc) = k.spawn_process(20, 20);

    ok(
        &mut k,
        ts,
        Syscall::CreateDriver {
            name: "mortal".into(),
            kind: DriverKind::SERVICE,
        },
    );
    let ch = as_file(ok(
        &mut k,
        tc,
        Syscall::Open {
            path: "/dev/mortal".into(),
            flags: OpenFlags::READ | OpenFlags::MSGS,
        },
    ));
    blocked(&mut k, tc, Syscall::ReceiveMsg { file: ch, size: 64 });

    // server process exits; its driver and channels die with it
    ok(&mut k, ts, Syscall::Exit { code: 0 });

    assert_eq!(finished(&mut k, tc), Err(ErrorCode::invalid_file));
    assert_eq!(
        err(
            &mut k,
            tc,
            Syscall::Open {
                path: "/dev/mortal".into(),
                flags: OpenFlags::MSGS,
            },
        ),
        ErrorCode::path_not_found
    );
}
