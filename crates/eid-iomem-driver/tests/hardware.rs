//! Tests against real IOMEM cards
//!
//! Run with `cargo test -- --ignored` on a machine with a card installed and
//! write access to `/sys/bus/pci/devices` (root).

use std::sync::Arc;

use eid_iomem_driver::{discovery, EidIomemModule, ModuleParams, PciBus, SysfsP2pMemory, VmArea};

#[test]
#[ignore] // Requires hardware
fn test_discover_iomem_cards() {
    let cards = discovery::discover().expect("sysfs scan");
    assert!(!cards.is_empty(), "no IOMEM card found");
    for card in &cards {
        println!("{} {:04x}:{:04x}", card.address(), card.vendor(), card.device());
        assert!(card.bar(0).is_some(), "{}: BAR0 missing", card.address());
    }
}

#[test]
#[ignore] // Requires hardware
fn test_probe_and_map_first_card() {
    let card = discovery::discover()
        .expect("sysfs scan")
        .into_iter()
        .next()
        .expect("no IOMEM card found");
    let address = card.address().to_string();

    let bus = Arc::new(PciBus::new());
    let module = EidIomemModule::load(&bus, ModuleParams::default(), Arc::new(SysfsP2pMemory::new()))
        .expect("module load");
    bus.add_card(Arc::new(card)).expect("probe");

    let file = module.driver().open_node("eid-iomem0").expect("open");
    let map = file
        .mmap(&VmArea::shared(0, rustix::param::page_size()))
        .expect("mmap");
    println!("{address}: word 0 = {:#010x}", map.read_u32(0).expect("read"));

    bus.remove_card(&address);
    assert!(module.driver().nodes().is_empty());
}
