//! One thread per vCPU sharing one engine.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use smtcg_core::tb::exit::EXCP_ECALL;
use smtcg_exec::{spawn_vcpu, Control, Dispatcher, ExitReason};
use smtcg_frontend::{GuestCpu, RiscvCpu};

use crate::machine::Machine;
use crate::rv::*;

fn stop_on_ecall(_: &mut RiscvCpu, _: &smtcg_exec::VCpu, reason: ExitReason) -> Control {
    match reason {
        ExitReason::Exception(EXCP_ECALL) => Control::Stop,
        other => panic!("unexpected exit {other:?}"),
    }
}

/// Sum 1..=(1000 + hart) and store it at 0x8000 + hart * 8.
fn sum_program() -> Vec<u32> {
    vec![
        addi(1, 10, 1000),
        addi(2, 0, 0),
        add(2, 2, 1), // 0x1008
        addi(1, 1, -1),
        bne(1, 0, -8),
        slli(3, 10, 3),
        lui(4, 0x8000),
        add(4, 4, 3),
        sd(2, 4, 0),
        ECALL,
    ]
}

#[test]
fn test_parallel_vcpus_share_code() {
    const HARTS: u64 = 4;
    let m = Machine::new();
    m.load_insns(0x1000, &sum_program());

    let mut handles = Vec::new();
    for hart in 0..HARTS {
        let mut cpu = RiscvCpu::new(0x1000);
        cpu.set_gpr(10, hart);
        let (_, h) = spawn_vcpu(Arc::clone(&m.engine), cpu, stop_on_ecall).unwrap();
        handles.push(h);
    }
    for h in handles {
        let cpu = h.join().unwrap();
        assert_eq!(cpu.get_pc(), 0x1024);
    }

    for hart in 0..HARTS {
        let n = 1000 + hart;
        assert_eq!(m.read_u64(0x8000 + hart * 8), n * (n + 1) / 2, "hart {hart}");
    }
    // Each block key was published once whichever vCPU translated it.
    assert_eq!(m.engine.tb_store().len(), 3);
    assert!(m.engine.vcpus().is_empty());
}

#[test]
fn test_concurrent_translation_publishes_once() {
    let m = Machine::new();
    m.load_insns(0x1000, &[addi(1, 0, 1), ECALL]);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            spawn_vcpu(Arc::clone(&m.engine), RiscvCpu::new(0x1000), stop_on_ecall)
                .unwrap()
                .1
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap().gpr(1), 1);
    }
    assert_eq!(m.engine.tb_store().len(), 1);
}

#[test]
fn test_kick_reaches_spinning_vcpu() {
    let m = Machine::new();
    m.load_insns(0x1000, &[addi(1, 1, 1), jal(0, -4)]);

    let (vcpu, h) = spawn_vcpu(Arc::clone(&m.engine), RiscvCpu::new(0x1000), |_, _, reason| {
        assert_eq!(reason, ExitReason::Kicked);
        Control::Stop
    })
    .unwrap();
    thread::sleep(Duration::from_millis(20));
    vcpu.kick();
    let cpu = h.join().unwrap();
    assert!(cpu.gpr(1) > 0);
    assert!((0x1000..0x1008).contains(&cpu.get_pc()));
}

#[test]
fn test_stop_request_ends_thread() {
    let m = Machine::new();
    m.load_insns(0x1000, &[jal(0, 0)]);

    let (vcpu, h) = spawn_vcpu(Arc::clone(&m.engine), RiscvCpu::new(0x1000), |_, _, reason| {
        panic!("unexpected exit {reason:?}")
    })
    .unwrap();
    thread::sleep(Duration::from_millis(10));
    vcpu.request_stop();
    assert_eq!(h.join().unwrap().get_pc(), 0x1000);
}

#[test]
fn test_halted_vcpu_parks_until_woken() {
    let m = Machine::new();
    m.load_insns(0x1000, &[addi(1, 1, 1), ECALL]);

    let (vcpu, h) = spawn_vcpu(Arc::clone(&m.engine), RiscvCpu::new(0x1000), stop_on_ecall).unwrap();
    vcpu.halt();
    thread::sleep(Duration::from_millis(10));
    assert!(vcpu.is_halted());
    vcpu.wake();
    let cpu = h.join().unwrap();
    assert_eq!(cpu.gpr(1), 1);
}

#[test]
fn test_exclusive_section_stops_running_vcpus() {
    let m = Machine::new();
    m.load_insns(0x1000, &[addi(1, 1, 1), jal(0, -4)]);

    let vcpus: Vec<_> = (0..3)
        .map(|_| spawn_vcpu(Arc::clone(&m.engine), RiscvCpu::new(0x1000), |_, _, _| Control::Continue).unwrap())
        .collect();
    thread::sleep(Duration::from_millis(10));

    // Flushing waits for every vCPU to leave generated code.
    for _ in 0..5 {
        m.engine.flush_all();
        thread::sleep(Duration::from_millis(2));
    }
    assert!(m.engine.flush_count() >= 5);

    for (vcpu, _) in &vcpus {
        vcpu.request_stop();
    }
    for (_, h) in vcpus {
        assert!(h.join().unwrap().gpr(1) > 0);
    }
}

#[test]
fn test_exec_section_ends_when_vcpu_panics() {
    let m = Machine::new();
    let d = Dispatcher::new(Arc::clone(&m.engine));
    let r = panic::catch_unwind(AssertUnwindSafe(|| {
        let _section = m.engine.exclusive().exec_section(d.vcpu());
        panic!("helper failed inside guest execution");
    }));
    assert!(r.is_err());

    // The vCPU is still registered but no longer running, so neither
    // this thread nor another one waits for it.
    let before = m.engine.flush_count();
    m.engine.flush_all();
    let engine = Arc::clone(&m.engine);
    thread::spawn(move || engine.flush_all()).join().unwrap();
    assert_eq!(m.engine.flush_count(), before + 2);
    drop(d);
}

#[test]
fn test_code_patched_by_another_vcpu() {
    let m = Machine::new();
    // vCPU A spins at 0x1000 until the jump at 0x1004 becomes an ecall.
    m.load_insns(0x1000, &[addi(1, 1, 1), jal(0, -4)]);
    m.load_insns(0x8000, &[ECALL]);
    // vCPU B copies the ecall over it.
    m.load_insns(0x2000, &[lui(5, 0x1000), lui(7, 0x8000), lw(6, 7, 0), sw(6, 5, 4), ECALL]);

    let (_, a) = spawn_vcpu(Arc::clone(&m.engine), RiscvCpu::new(0x1000), stop_on_ecall).unwrap();
    thread::sleep(Duration::from_millis(10));
    let (_, b) = spawn_vcpu(Arc::clone(&m.engine), RiscvCpu::new(0x2000), stop_on_ecall).unwrap();
    b.join().unwrap();
    assert_eq!(m.read_u32(0x1004), ECALL);

    // Remote fence.i: A may have retranslated between the invalidation
    // and the store landing.
    m.engine.notify_page_changed(0x1004, 0x1008);

    let cpu = a.join().unwrap();
    assert!(cpu.gpr(1) > 0);
    assert_eq!(cpu.get_pc(), 0x1004);
}
