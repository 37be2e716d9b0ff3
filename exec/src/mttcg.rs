//! Multi-threaded model: one OS thread per vCPU.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::info;
use smtcg_frontend::GuestCpu;

use crate::cpu::VCpu;
use crate::exec_loop::{Dispatcher, ExitReason};
use crate::Engine;

/// What a vCPU thread does after its exit handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

/// Run `cpu` on a new thread named `vcpu-N` until it is stopped.
///
/// `handler` sees every exit other than `Stopped` and `Halted`
/// (the thread parks until woken). The thread returns the CPU state.
pub fn spawn_vcpu<C, H>(engine: Arc<Engine>, mut cpu: C, mut handler: H) -> io::Result<(VCpu, JoinHandle<C>)>
where
    C: GuestCpu + Send + 'static,
    H: FnMut(&mut C, &VCpu, ExitReason) -> Control + Send + 'static,
{
    let mut dispatcher = Dispatcher::new(engine);
    let vcpu = dispatcher.vcpu().clone();
    let handle = thread::Builder::new()
        .name(format!("vcpu-{}", vcpu.index()))
        .spawn(move || {
            let me = dispatcher.vcpu().clone();
            info!("vcpu {} thread started at pc={:#x}", me.index(), cpu.get_pc());
            loop {
                match dispatcher.cpu_exec(&mut cpu) {
                    ExitReason::Stopped => break,
                    ExitReason::Halted => me.wait_while_halted(),
                    reason => {
                        if handler(&mut cpu, &me, reason) == Control::Stop {
                            break;
                        }
                    }
                }
            }
            info!("vcpu {} thread stopped at pc={:#x}", me.index(), cpu.get_pc());
            if dispatcher.engine().config().stats {
                info!("vcpu {} stats:\n{}", me.index(), dispatcher.stats());
            }
            cpu
        })?;
    Ok((vcpu, handle))
}
