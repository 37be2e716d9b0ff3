//! The two host calls a bare guest image gets: `write` and `exit`.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use smtcg_core::tb::exit::{EXCP_EBREAK, EXCP_ECALL};
use smtcg_exec::{Control, Engine, ExitReason};
use smtcg_frontend::GuestCpu;
use smtcg_mmu::{AddressSpace, PageFlags};

const SYS_WRITE: u64 = 64;
const SYS_EXIT: u64 = 93;

const ENOSYS: i64 = 38;
const EBADF: i64 = 9;
const EFAULT: i64 = 14;
const EIO: i64 = 5;

const A0: usize = 10;
const A1: usize = 11;
const A2: usize = 12;
const A7: usize = 17;

/// Host side of a run: handles guest exits for every vCPU and keeps
/// the exit status.
pub struct Host {
    engine: Arc<Engine>,
    exited: AtomicBool,
    code: AtomicI32,
}

impl Host {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            exited: AtomicBool::new(false),
            code: AtomicI32::new(0),
        }
    }

    /// Status the guest exited with; `None` if no vCPU called `exit`.
    pub fn exit_code(&self) -> Option<i32> {
        self.exited
            .load(Ordering::Acquire)
            .then(|| self.code.load(Ordering::Acquire))
    }

    fn finish(&self, code: i32) {
        self.code.store(code, Ordering::Release);
        self.exited.store(true, Ordering::Release);
        for cpu in self.engine.vcpus() {
            cpu.request_stop();
        }
    }

    pub fn handle_exit(&self, hart: usize, cpu: &mut dyn GuestCpu, reason: ExitReason) -> Control {
        match reason {
            ExitReason::Exception(EXCP_ECALL) => self.ecall(hart, cpu),
            ExitReason::Exception(EXCP_EBREAK) => {
                error!("hart {hart}: ebreak at pc={:#x}", cpu.get_pc());
                self.finish(1);
                Control::Stop
            }
            ExitReason::Fault(fault) => {
                error!("hart {hart}: unhandled fault at pc={:#x}: {fault}", cpu.get_pc());
                self.finish(1);
                Control::Stop
            }
            ExitReason::Exception(excp) => {
                error!("hart {hart}: unexpected exception {excp:#x} at pc={:#x}", cpu.get_pc());
                self.finish(1);
                Control::Stop
            }
            other => {
                debug!("hart {hart}: {other:?}");
                Control::Continue
            }
        }
    }

    fn ecall(&self, hart: usize, cpu: &mut dyn GuestCpu) -> Control {
        let regs = cpu.regs_mut();
        let (nr, a0, a1, a2) = (regs[A7], regs[A0], regs[A1], regs[A2]);
        let ret = match nr {
            SYS_EXIT => {
                debug!("hart {hart}: exit({})", a0 as i32);
                self.finish(a0 as i32);
                return Control::Stop;
            }
            SYS_WRITE => self.write(a0, a1, a2),
            _ => {
                warn!("hart {hart}: unsupported ecall {nr}");
                -ENOSYS
            }
        };
        regs[A0] = ret as u64;
        let pc = cpu.get_pc();
        cpu.set_pc(pc + 4);
        Control::Continue
    }

    fn write(&self, fd: u64, buf: u64, len: u64) -> i64 {
        if self.engine.check_range(buf, len, PageFlags::READ).is_err() {
            return -EFAULT;
        }
        let mut data = vec![0u8; len as usize];
        if self.engine.mem().space().read_guest(buf, &mut data).is_err() {
            return -EFAULT;
        }
        let res = match fd {
            1 => io::stdout().lock().write_all(&data),
            2 => io::stderr().lock().write_all(&data),
            _ => return -EBADF,
        };
        match res {
            Ok(()) => len as i64,
            Err(e) => -i64::from(e.raw_os_error().unwrap_or(EIO as i32)),
        }
    }
}
