//! Medium policy table.
//!
//! A pure function from a destination's probed medium class to its lane
//! width (intra-destination parallelism), plus the de-promotion rule applied
//! when a network destination shares the run with others.

use crate::collaborators::MediumClass;

/// Lane width for a given medium, before any de-promotion.
fn base_width(medium: MediumClass) -> usize {
    match medium {
        MediumClass::Internal | MediumClass::PortableSsd => 6,
        MediumClass::ExternalHdd => 2,
        MediumClass::RemovableCard => 1,
        MediumClass::Network => 1,
        MediumClass::Unknown => 2,
    }
}

/// Lane width is never below 1, and any non-network medium is de-promoted
/// one tier when a network destination is present in the same run (spec
/// §4.3's bus-contention rule).
pub fn lane_width(medium: MediumClass, network_present: bool) -> usize {
    let width = base_width(medium);
    if network_present && medium != MediumClass::Network {
        de_promote(width)
    } else {
        width
    }
}

/// Removable cards are never de-promoted further; they are already at the
/// strictly-serial floor.
fn de_promote(width: usize) -> usize {
    match width {
        1 => 1,
        2 => 1,
        w => (w / 2).max(1),
    }
}
