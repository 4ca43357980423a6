//! Hot-plug lifecycle tests
//!
//! Drives cards through the bus the way arrival and departure events would,
//! and checks node naming, id reuse and the open/remove race.

use std::sync::{Arc, Barrier};
use std::thread;

use eid_iomem_driver::{
    BarInfo, EidIomemModule, HostP2pMemory, IomemError, ModuleParams, P2pMemory, PciBus, PciCard,
    ProbeState, VmArea,
};

const WINDOW: u64 = 1 << 20;

fn iomem(address: &str) -> Arc<PciCard> {
    Arc::new(PciCard::new(address, 0x1de5, 0x1000).with_bar(0, BarInfo::memory(0, WINDOW)))
}

fn page() -> usize {
    rustix::param::page_size()
}

fn load(max_devices: u32) -> (Arc<PciBus>, Arc<HostP2pMemory>, EidIomemModule) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let bus = Arc::new(PciBus::new());
    let host = Arc::new(HostP2pMemory::new());
    let module = EidIomemModule::load(&bus, ModuleParams::new(max_devices), host.clone())
        .expect("module load");
    (bus, host, module)
}

#[test]
fn probe_remove_probe_reuses_node_name() {
    let (bus, host, module) = load(16);
    let driver = module.driver();

    bus.add_card(iomem("0000:0a:00.0")).unwrap();
    assert_eq!(driver.nodes(), vec!["eid-iomem0".to_string()]);

    let file = driver.open_node("/dev/eid-iomem0").unwrap();
    let devt = file.device().devt();
    assert_eq!(devt.minor(), 0);

    let map = file.mmap(&VmArea::shared(0, page())).unwrap();
    map.write_u32(0, 0xdead_beef).unwrap();

    let card_a = bus.remove_card("0000:0a:00.0").unwrap();
    assert!(driver.nodes().is_empty());
    assert_eq!(card_a.probe_state(), ProbeState::Removed);
    assert!(!host.has_resource(&card_a));
    assert!(matches!(
        driver.open(devt),
        Err(IomemError::NoSuchDevice { .. })
    ));

    // The open file keeps the device (and its id) alive
    assert!(driver.registry().ida().is_allocated(0));
    assert_eq!(map.read_u32(0).unwrap(), 0xdead_beef);

    drop(file);
    assert!(!driver.registry().ida().is_allocated(0));
    assert_eq!(map.read_u32(0).unwrap(), 0xdead_beef);
    drop(map);

    bus.add_card(iomem("0000:0b:00.0")).unwrap();
    assert_eq!(driver.nodes(), vec!["eid-iomem0".to_string()]);
    let file = driver.open_node("eid-iomem0").unwrap();
    assert_eq!(file.device().card().address(), "0000:0b:00.0");
}

#[test]
fn open_file_cannot_map_after_removal() {
    let (bus, _host, module) = load(16);
    let driver = module.driver();

    bus.add_card(iomem("0000:0a:00.0")).unwrap();
    let file = driver.open_node("eid-iomem0").unwrap();
    bus.remove_card("0000:0a:00.0").unwrap();

    assert!(matches!(
        file.mmap(&VmArea::shared(0, page())),
        Err(IomemError::NotSupported { .. })
    ));
}

#[test]
fn replacement_at_same_address_is_isolated_from_old_files() {
    let (bus, host, module) = load(16);
    let driver = module.driver();

    bus.add_card(iomem("0000:0a:00.0")).unwrap();
    let stale = driver.open_node("eid-iomem0").unwrap();
    let old = bus.remove_card("0000:0a:00.0").unwrap();

    let replacement = iomem("0000:0a:00.0");
    bus.add_card(Arc::clone(&replacement)).unwrap();
    assert_eq!(driver.nodes(), vec!["eid-iomem1".to_string()]);

    let fresh = driver.open_node("eid-iomem1").unwrap();
    let map = fresh.mmap(&VmArea::shared(0, page())).unwrap();
    map.write_u32(0, 0xb0b0_b0b0).unwrap();

    assert!(matches!(
        stale.mmap(&VmArea::shared(0, page())),
        Err(IomemError::NotSupported { .. })
    ));
    assert!(Arc::ptr_eq(stale.device().card(), &old));
    assert!(!host.has_resource(&old));

    drop(stale);
    assert_eq!(host.open_files(&replacement), vec![fresh.id()]);
    assert_eq!(map.read_u32(0).unwrap(), 0xb0b0_b0b0);
}

#[test]
fn second_card_gets_next_id_while_first_is_open() {
    let (bus, _host, module) = load(16);
    let driver = module.driver();

    bus.add_card(iomem("0000:0a:00.0")).unwrap();
    let file = driver.open_node("eid-iomem0").unwrap();
    bus.remove_card("0000:0a:00.0").unwrap();

    bus.add_card(iomem("0000:0b:00.0")).unwrap();
    assert_eq!(driver.nodes(), vec!["eid-iomem1".to_string()]);
    drop(file);
}

#[test]
fn exhaustion_leaves_extra_card_unbound() {
    let (bus, host, module) = load(2);
    let driver = module.driver();

    bus.add_card(iomem("0000:01:00.0")).unwrap();
    bus.add_card(iomem("0000:02:00.0")).unwrap();
    let err = bus.add_card(iomem("0000:03:00.0")).unwrap_err();
    assert!(matches!(err, IomemError::ResourceExhausted { max: 2 }));

    let third = bus.card("0000:03:00.0").unwrap();
    assert!(!third.is_enabled());
    assert!(!host.has_resource(&third));
    assert_eq!(bus.bound_driver("0000:03:00.0"), None);
    assert_eq!(
        driver.nodes(),
        vec!["eid-iomem0".to_string(), "eid-iomem1".to_string()]
    );

    // Freeing a slot lets a new arrival bind
    bus.remove_card("0000:01:00.0").unwrap();
    bus.remove_card("0000:03:00.0").unwrap();
    bus.add_card(iomem("0000:03:00.0")).unwrap();
    assert_eq!(
        driver.nodes(),
        vec!["eid-iomem0".to_string(), "eid-iomem1".to_string()]
    );
}

#[test]
fn unmatched_cards_are_ignored() {
    let (bus, _host, module) = load(4);

    let other = Arc::new(PciCard::new("0000:05:00.0", 0x8086, 0x1000).with_bar(0, BarInfo::memory(0, WINDOW)));
    bus.add_card(Arc::clone(&other)).unwrap();

    assert_eq!(other.probe_state(), ProbeState::Unprobed);
    assert!(!other.is_enabled());
    assert!(module.driver().nodes().is_empty());
}

#[test]
fn unload_removes_every_card() {
    let (bus, host, module) = load(4);
    let registry = Arc::clone(module.driver().registry());

    bus.add_card(iomem("0000:01:00.0")).unwrap();
    bus.add_card(iomem("0000:02:00.0")).unwrap();
    assert_eq!(registry.nodes().len(), 2);

    module.unload();

    assert!(registry.nodes().is_empty());
    assert_eq!(registry.ida().in_use(), 0);
    for card in bus.cards() {
        assert_eq!(card.probe_state(), ProbeState::Removed);
        assert!(!card.is_enabled());
        assert!(!host.has_resource(&card));
        assert_eq!(bus.bound_driver(card.address()), None);
    }
}

#[test]
fn load_after_unload_binds_again() {
    let bus = Arc::new(PciBus::new());
    let host: Arc<dyn P2pMemory> = Arc::new(HostP2pMemory::new());
    bus.add_card(iomem("0000:01:00.0")).unwrap();

    let module = EidIomemModule::load(&bus, ModuleParams::default(), Arc::clone(&host)).unwrap();
    assert_eq!(module.driver().nodes(), vec!["eid-iomem0".to_string()]);
    drop(module);

    let module = EidIomemModule::load(&bus, ModuleParams::default(), host).unwrap();
    assert_eq!(module.driver().nodes(), vec!["eid-iomem0".to_string()]);
}

#[test]
fn invalid_parameters_fail_load() {
    let bus = Arc::new(PciBus::new());
    let err = EidIomemModule::load(&bus, ModuleParams::new(0), Arc::new(HostP2pMemory::new()))
        .unwrap_err();
    assert!(matches!(err, IomemError::InvalidParameter { .. }));
}

#[test]
fn opens_racing_removal_never_see_a_dead_device() {
    const OPENERS: usize = 8;

    let (bus, _host, module) = load(4);
    let driver = Arc::clone(module.driver());
    bus.add_card(iomem("0000:01:00.0")).unwrap();
    let devt = driver.registry().node_devt("eid-iomem0").unwrap();

    let barrier = Arc::new(Barrier::new(OPENERS + 1));
    let handles: Vec<_> = (0..OPENERS)
        .map(|_| {
            let driver = Arc::clone(&driver);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut files = Vec::new();
                for _ in 0..200 {
                    match driver.open(devt) {
                        Ok(file) => {
                            assert_eq!(file.device().devt(), devt);
                            // P2P memory goes away with the card; only the file stays valid
                            match file.mmap(&VmArea::shared(0, page())) {
                                Ok(_) | Err(IomemError::NotSupported { .. }) => {}
                                Err(e) => panic!("unexpected mmap error: {e}"),
                            }
                            files.push(file);
                        }
                        Err(IomemError::NoSuchDevice { .. }) => {}
                        Err(e) => panic!("unexpected open error: {e}"),
                    }
                }
                files
            })
        })
        .collect();

    barrier.wait();
    bus.remove_card("0000:01:00.0").unwrap();

    let files: Vec<_> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    assert!(driver.nodes().is_empty());
    assert!(matches!(driver.open(devt), Err(IomemError::NoSuchDevice { .. })));
    if let Some(file) = files.first() {
        assert_eq!(file.device().refcount(), files.len());
    }

    drop(files);
    assert_eq!(driver.registry().ida().in_use(), 0);
}
