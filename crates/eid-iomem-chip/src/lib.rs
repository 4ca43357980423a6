//! Identity model for the Eideticom IOMEM PCIe card.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of how the card is recognised and named: PCI identifiers, the
//! BAR that carries the peer-to-peer memory window, and the character-device
//! numbering scheme used for `/dev/eid-iomem*` nodes.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device IDs, PCI match table |
//! | [`bar`] | BAR layout (BAR0 is the P2P memory window) |
//! | [`node`] | `DevT` encoding, node / class / region names |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod node;
pub mod pcie;
