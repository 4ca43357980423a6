//! `eid-iomem`: command-line interface for Eideticom IOMEM cards.
//!
//! ```text
//! USAGE:
//!   eid-iomem scan                   List IOMEM cards and their BARs
//!   eid-iomem demo [--cards N]       Run the device lifecycle on simulated cards
//!   eid-iomem map <pcie-addr>        Probe one card and dump its P2P window
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eid_iomem_driver::pcie_ids::{lspci_filter, DRIVER_NAME};
use eid_iomem_driver::{
    discovery, BarInfo, EidIomemModule, HostP2pMemory, ModuleParams, P2pMapping, PciBus, PciCard,
    SysfsP2pMemory, VmArea, MAX_DEVICES_ENV,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eid-iomem", about = "Eideticom IOMEM P2P memory CLI", version)]
struct Cli {
    /// Size of the device id pool.
    #[arg(long, global = true, env = MAX_DEVICES_ENV, default_value_t = 16)]
    max_devices: u32,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List IOMEM cards found in sysfs.
    Scan,
    /// Hot-plug simulated cards through the full probe/open/mmap/remove cycle.
    Demo {
        /// Number of simulated cards.
        #[arg(long, default_value_t = 2)]
        cards: u32,
        /// P2P window size per card in bytes.
        #[arg(long, default_value_t = 1 << 20)]
        window: u64,
    },
    /// Probe a real card and dump the start of its P2P window (requires root).
    Map {
        /// PCIe address (e.g. 0000:a1:00.0).
        pcie_addr: String,
        /// Number of 32-bit words to dump.
        #[arg(long, default_value_t = 16)]
        words: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let params = ModuleParams::new(cli.max_devices);
    params.validate()?;

    match cli.command {
        Cmd::Scan => cmd_scan()?,
        Cmd::Demo { cards, window } => cmd_demo(params, cards, window)?,
        Cmd::Map { pcie_addr, words } => cmd_map(params, &pcie_addr, words)?,
    }

    Ok(())
}

fn cmd_scan() -> Result<()> {
    let cards = discovery::discover()?;

    println!("IOMEM cards: {}  ({})", cards.len(), lspci_filter());
    println!();

    for card in &cards {
        println!("{} {:04x}:{:04x}", card.address(), card.vendor(), card.device());
        for index in 0..eid_iomem_chip::bar::BAR_COUNT {
            if let Some(bar) = card.bar(index) {
                println!(
                    "     BAR{index}  {:?}  start=0x{:x}  len=0x{:x}",
                    bar.kind(),
                    bar.start,
                    bar.len
                );
            }
        }
        println!();
    }

    Ok(())
}

fn cmd_demo(params: ModuleParams, cards: u32, window: u64) -> Result<()> {
    tracing::debug!("demo: {cards} card(s), {window:#x} byte window");
    let bus = Arc::new(PciBus::new());
    let module = EidIomemModule::load(&bus, params, Arc::new(HostP2pMemory::new()))?;
    let driver = module.driver();
    println!(
        "{DRIVER_NAME}: loaded, {} node(s) max",
        driver.registry().params().max_devices
    );

    let addresses: Vec<String> = (0..cards).map(|n| format!("0000:{:02x}:00.0", n + 1)).collect();
    for address in &addresses {
        let card = PciCard::new(address.as_str(), 0x1de5, 0x1000).with_bar(0, BarInfo::memory(0, window));
        if let Err(e) = bus.add_card(Arc::new(card)) {
            println!("probe {address}: {e}");
        }
    }
    println!("nodes: {:?}", driver.nodes());

    let Some(first) = driver.nodes().into_iter().next() else {
        println!("no nodes bound");
        return Ok(());
    };

    let file = driver.open_node(&first)?;
    let map = file.mmap(&VmArea::shared(0, page_len(4)))?;
    map.write_u32(0, 0xfeed_f00d)?;
    println!("{first}: wrote 0x{:08x} through {}", map.read_u32(0)?, file.id());

    bus.remove_card(&addresses[0]);
    println!("removed {}: nodes now {:?}", addresses[0], driver.nodes());
    println!(
        "{first}: mapping still reads 0x{:08x} after removal",
        map.read_u32(0)?
    );

    drop(map);
    drop(file);

    let replacement = PciCard::new("0000:f0:00.0", 0x1de5, 0x1000).with_bar(0, BarInfo::memory(0, window));
    bus.add_card(Arc::new(replacement))?;
    println!("re-probed: nodes {:?}", driver.nodes());

    module.unload();
    println!("{DRIVER_NAME}: unloaded");
    Ok(())
}

fn cmd_map(params: ModuleParams, pcie_addr: &str, words: usize) -> Result<()> {
    let card = discovery::discover()?
        .into_iter()
        .find(|c| c.address() == pcie_addr)
        .ok_or_else(|| anyhow::anyhow!("IOMEM card not found: {pcie_addr}"))?;

    let bus = Arc::new(PciBus::new());
    let module = EidIomemModule::load(&bus, params, Arc::new(SysfsP2pMemory::new()))?;
    bus.add_card(Arc::new(card))
        .with_context(|| format!("probe {pcie_addr}"))?;

    let driver = module.driver();
    let node = driver
        .nodes()
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("{pcie_addr}: no node bound"))?;
    let file = driver.open_node(&node)?;

    let window = bus
        .card(pcie_addr)
        .and_then(|c| driver.p2p().window_len(&c))
        .unwrap_or(0);
    let len = page_len(window.min((words * 4) as u64));
    let map = file.mmap(&VmArea::shared(0, len))?;

    println!("/dev/{node}  ({pcie_addr}, window 0x{window:x})");
    println!(
        "  mapped 0x{:x}+0x{:x}  {:?}",
        map.window_offset(),
        map.len(),
        map.prot()
    );
    dump(map.as_ref(), words.min(map.len() / 4))?;

    Ok(())
}

fn dump(map: &dyn P2pMapping, words: usize) -> Result<()> {
    for row in (0..words).step_by(4) {
        print!("  {:08x}:", row * 4);
        for word in row..(row + 4).min(words) {
            print!(" {:08x}", map.read_u32(word * 4)?);
        }
        println!();
    }
    Ok(())
}

/// Round `len` up to a whole number of pages (at least one)
fn page_len(len: u64) -> usize {
    let page = rustix::param::page_size();
    let len = usize::try_from(len).unwrap_or(usize::MAX).max(1);
    len.div_ceil(page).saturating_mul(page)
}
