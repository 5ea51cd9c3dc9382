//! Randomized open/close churn: a balanced sequence must leave the
//! global file table and the node reference counts exactly where they
//! started.

mod common;

use common::*;
use rand::prelude::*;
use rand::rngs::StdRng;
use ydin::filesystem::FileNo;
use ydin::{DriverKind, Kernel, OpenFlags, Syscall};

#[test]
fn balanced_churn_leaks_nothing() {
    init();
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut k = Kernel::new();
    let (_srv, ts) = k.spawn_process(10, 10);
    let (_cli, tc) = k.spawn_process(20, 20);

    ok(
        &mut k,
        ts,
        Syscall::CreateDriver {
            name: "churn".into(),
            kind: DriverKind::SERVICE,
        },
    );
    // a fixed set of plain files to churn over
    for i in 0..8 {
        let f = as_file(ok(
            &mut k,
            tc,
            Syscall::Open {
                path: format!("/system/pipe/churn{}", i),
                flags: OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            },
        ));
        ok(&mut k, tc, Syscall::Close { file: f });
    }

    let files_before = k.vfs().open_file_count();
    let nodes_before = k.vfs().node_count();
    let refs_before = k.vfs().node_ref_total();

    let mut open: Vec<FileNo> = Vec::new();
    for _ in 0..400 {
        let open_more = open.is_empty() || rng.gen_bool(0.55);
        if open_more {
            let f = if rng.gen_bool(0.3) {
                // driver client: a fresh channel every time
                as_file(ok(
                    &mut k,
                    tc,
                    Syscall::Open {
                        path: "/dev/churn".into(),
                        flags: OpenFlags::MSGS | OpenFlags::WRITE,
                    },
                ))
            } else {
                let i = rng.gen_range(0..8);
                as_file(ok(
                    &mut k,
                    tc,
                    Syscall::Open {
                        path: format!("/system/pipe/churn{}", i),
                        flags: OpenFlags::READ,
                    },
                ))
            };
            open.push(f);
        } else {
            let i = rng.gen_range(0..open.len());
            let f = open.swap_remove(i);
            ok(&mut k, tc, Syscall::Close { file: f });
        }

        // the node refcount always mirrors the live entries
        assert_eq!(
            k.vfs().node_ref_total() as usize,
            refs_before as usize + k.vfs().open_file_count() - files_before
        );
    }
    for f in open {
        ok(&mut k, tc, Syscall::Close { file: f });
    }

    assert_eq!(k.vfs().open_file_count(), files_before);
    assert_eq!(k.vfs().node_count(), nodes_before);
    assert_eq!(k.vfs().node_ref_total(), refs_before);
}
