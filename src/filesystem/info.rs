//! Read handlers for the synthetic nodes under /system: process and
//! thread descriptions and the driver listing. Content is rendered from
//! live scheduler and namespace state at read time.

use alloc::format;
use alloc::string::String;

use crate::multitasking::{Scheduler, ThreadState};

use super::file::InfoSource;
use super::node::{NodeArena, NodeId};

pub fn render(
    src: InfoSource,
    sched: &Scheduler,
    nodes: &NodeArena,
    dev_dir: NodeId,
) -> String {
    match src {
        InfoSource::ProcessInfo(pid) => match sched.process(pid) {
            Some(p) => format!(
                "pid={}\nthreads={}\nowner={}:{}\n",
                p.pid,
                p.threads.len(),
                p.uid,
                p.gid
            ),
            None => format!("pid={}\nthreads=0\n", pid),
        },
        InfoSource::ProcessVirtMem(pid) => {
            // paging lives outside the core; the node exists so tooling
            // has a stable path to read
            let _ = pid;
            String::from("virtual=0 KiB\nphysical=0 KiB\n")
        },
        InfoSource::ProcessRegions(pid) => {
            let _ = pid;
            String::from("regions=0\n")
        },
        InfoSource::ThreadInfo(tid) => match sched.thread(tid) {
            Some(t) => format!(
                "tid={}\npid={}\nstate={}\n",
                t.tid,
                t.pid,
                state_name(t.state, t.suspended)
            ),
            None => format!("tid={}\nstate=dead\n", tid),
        },
        InfoSource::ThreadTrace(tid) => {
            // no unwinder in the core; a single synthetic frame keeps the
            // format stable for consumers
            format!("#0 thread {}\n", tid)
        },
        InfoSource::Devices => {
            let mut out = String::new();
            for id in nodes.children(dev_dir) {
                let node = match nodes.get(id) {
                    Some(n) => n,
                    None => continue,
                };
                let (name, server) = match (node.name(), node.server()) {
                    (Some(name), Some(server)) => (name, server),
                    _ => continue,
                };
                out.push_str(&format!(
                    "{} kind={:#04x} readable={} channels={}\n",
                    name,
                    server.kind().bits(),
                    server.is_readable() as u8,
                    nodes.children(id).len()
                ));
            }
            out
        },
    }
}

fn state_name(state: ThreadState, suspended: bool) -> &'static str {
    if suspended {
        return "suspended";
    }
    match state {
        ThreadState::Runnable => "ready",
        ThreadState::Blocked => "blocked",
        ThreadState::Sleeping => "sleeping",
    }
}
