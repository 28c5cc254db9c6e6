use std::sync::Arc;
use std::time::{Duration, Instant};
use vfpga_mmu::hw::regs::{ShellConfig, TlbParams};
use vfpga_mmu::hw::{DmaDirection, IrqKind, IrqStatus, ShellRegisters, TlbOrder};
use vfpga_mmu::mmu::HostPinner;
use vfpga_mmu::sim::{SimOp, SimPinner, SimShell};
use vfpga_mmu::{CardLayout, MmuConfig, MmuError, MmuResult, Residency, Shell};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn shell_config(en_mem: bool) -> ShellConfig {
    ShellConfig {
        n_regions: 2,
        small: TlbParams { order: 10, assoc: 4, page_shift: 12 },
        large: TlbParams { order: 8, assoc: 2, page_shift: 21 },
        en_strm: true,
        en_mem,
    }
}

struct Setup {
    sims: Vec<Arc<SimShell>>,
    pinner: Arc<SimPinner>,
    shell: Shell,
}

fn test_config() -> MmuConfig {
    MmuConfig::new()
        .completion_timeout(Duration::from_secs(2))
        .card(CardLayout::new().regular(0x1000_0000, 128).huge(0x4000_0000, 4))
}

fn setup(en_mem: bool) -> Setup {
    build(en_mem, test_config()).unwrap()
}

fn build(en_mem: bool, cfg: MmuConfig) -> MmuResult<Setup> {
    init_logger();
    let sims: Vec<Arc<SimShell>> = (0..2).map(|_| Arc::new(SimShell::new())).collect();
    let regs: Vec<Arc<dyn ShellRegisters>> = sims
        .iter()
        .map(|s| -> Arc<dyn ShellRegisters> { s.clone() })
        .collect();
    let pinner = Arc::new(SimPinner::new());
    let host: Arc<dyn HostPinner> = pinner.clone();
    let shell = Shell::new(shell_config(en_mem), regs, host, cfg)?;
    for (sim, region) in sims.iter().zip(shell.regions()) {
        sim.attach(region.mmu.signals());
    }
    Ok(Setup { sims, pinner, shell })
}

fn page_fault(vaddr: u64, len: u64, ctid: u32, stream: u64) -> IrqStatus {
    IrqStatus {
        isr: (stream << 48) | (3 << 16),
        isr_pid: u64::from(ctid),
        isr_vaddr: vaddr,
        isr_len: len,
    }
}

fn wait_restarts(sim: &SimShell, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while sim.count(|op| matches!(op, SimOp::Restart { .. } | SimOp::Drop { .. })) < n {
        assert!(Instant::now() < deadline, "fault not answered");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn card_then_host_access_migrates_buffer() {
    let s = setup(true);
    let region = s.shell.region(0).unwrap();
    let sim = &s.sims[0];
    let ctid = region.mmu.register_ctid(1234).unwrap();
    assert_eq!(ctid, 0);

    sim.set_irq(page_fault(0x10000, 8192, ctid, 0));
    assert_eq!(region.handle_interrupt(), IrqKind::PageFault);
    wait_restarts(sim, 1);

    assert_eq!(s.pinner.pinned_pages(), 2);
    assert_eq!(s.shell.card_free(false), Some(126));
    assert_eq!(sim.count(|op| matches!(op, SimOp::Dma(DmaDirection::Offload, _))), 2);
    assert_eq!(sim.count(|op| matches!(op, SimOp::Tlb(TlbOrder::Regular, _))), 2);
    assert_eq!(region.mmu.buffer(ctid, 0x10000).unwrap().residency, Residency::Card);

    sim.clear_ops();
    sim.set_irq(page_fault(0x10000, 8192, ctid, 1));
    region.handle_interrupt();
    wait_restarts(sim, 1);

    assert_eq!(sim.count(|op| matches!(op, SimOp::Invalidate(_))), 2);
    assert_eq!(sim.count(|op| matches!(op, SimOp::Dma(DmaDirection::Sync, _))), 2);
    assert_eq!(sim.count(|op| matches!(op, SimOp::Tlb(..))), 4);
    assert_eq!(region.mmu.buffer(ctid, 0x10000).unwrap().residency, Residency::Host);

    region.mmu.unregister_ctid(ctid).unwrap();
    assert_eq!(s.pinner.pinned_pages(), 0);
    assert_eq!(s.shell.card_free(false), Some(128));
}

#[test]
fn regions_are_independent_but_share_card_memory() {
    let s = setup(true);
    let r0 = s.shell.region(0).unwrap();
    let r1 = s.shell.region(1).unwrap();
    let c0 = r0.mmu.register_ctid(1).unwrap();
    let c1 = r1.mmu.register_ctid(2).unwrap();

    r0.mmu.handle_fault(0x10000, 0x4000, c0, Residency::Card, 1).unwrap();
    r1.mmu.handle_fault(0x10000, 0x4000, c1, Residency::Card, 2).unwrap();
    assert_eq!(s.shell.card_free(false), Some(120));
    assert_eq!(s.sims[0].count(|op| matches!(op, SimOp::Dma(..))), 4);
    assert_eq!(s.sims[1].count(|op| matches!(op, SimOp::Dma(..))), 4);

    let a = r0.mmu.buffer(c0, 0x10000).unwrap().card_phys;
    let b = r1.mmu.buffer(c1, 0x10000).unwrap().card_phys;
    assert!(a.iter().all(|x| !b.contains(x)));
}

#[test]
fn regions_make_progress_in_parallel() {
    let s = setup(true);
    let (r0, r1) = (s.shell.region(0).unwrap(), s.shell.region(1).unwrap());
    let c0 = r0.mmu.register_ctid(1).unwrap();
    let c1 = r1.mmu.register_ctid(2).unwrap();
    s.sims[0].set_auto_complete(false);

    std::thread::scope(|scope| {
        let mmu0 = r0.mmu.clone();
        let parked =
            scope.spawn(move || mmu0.handle_ctid_fault(0x10000, 0x4000, c0, Residency::Card));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !s.sims[0].ops().iter().any(|op| matches!(op, SimOp::Dma(_, c) if c.last)) {
            assert!(Instant::now() < deadline, "region 0 never issued its offload");
            std::thread::sleep(Duration::from_millis(1));
        }

        // Region 0 now waits for its offload completion.
        r1.mmu.handle_ctid_fault(0x10000, 0x4000, c1, Residency::Card).unwrap();
        assert_eq!(r1.mmu.buffer_count(), 1);
        assert!(!parked.is_finished());

        r0.mmu.signals().offload.raise();
        parked.join().unwrap().unwrap();
    });
    assert_eq!(r0.mmu.buffer_count(), 1);
    assert_eq!(s.shell.card_free(false), Some(120));
}

#[test]
fn shell_without_card_memory() {
    let s = setup(false);
    assert_eq!(s.shell.card_free(false), None);
    let region = s.shell.region(1).unwrap();
    let ctid = region.mmu.register_ctid(7).unwrap();
    assert!(matches!(
        region.mmu.offload_user(0x10000, 4096, ctid),
        Err(MmuError::CardMemoryDisabled)
    ));
    region.mmu.map_user(0x10000, 4096, ctid).unwrap();
    assert_eq!(region.mmu.buffer_count(), 1);
}

#[test]
fn rejects_bad_setup() {
    init_logger();
    let pinner: Arc<dyn HostPinner> = Arc::new(SimPinner::new());
    let one: Vec<Arc<dyn ShellRegisters>> = vec![Arc::new(SimShell::new())];
    assert!(matches!(
        Shell::new(shell_config(true), one, pinner, MmuConfig::new()),
        Err(MmuError::InvalidConfig(_))
    ));

    let s = setup(true);
    assert!(matches!(s.shell.region(2), Err(MmuError::InvalidRegion(2))));

    let misaligned = test_config().card(CardLayout::new().huge(0x4010_0000, 2));
    assert!(matches!(build(true, misaligned), Err(MmuError::InvalidConfig(_))));
    assert!(build(false, misaligned).is_ok());
}
