//! Automatic address resolution against the range inventory.

use super::{AddressEntry, Route};
use crate::errors::{VmforgeError, VmforgeResult};
use crate::inventory::{Inventory, IpRange};
use std::net::Ipv4Addr;

/// Destination of the inter-segment route added for private primaries that
/// sit under a declared uplink network.
const SEGMENT_ROUTE_DESTINATION: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 0);
const SEGMENT_ROUTE_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 0, 0, 0);

/// Resolve netmask, gateway and routes for the primary and each additional
/// address, in that order. The first address that yields a gateway claims it
/// for the whole build; it is never overwritten.
pub(super) fn configure_addresses(
    primary: Ipv4Addr,
    additional: &[Ipv4Addr],
    inventory: &dyn Inventory,
) -> VmforgeResult<(Vec<AddressEntry>, Vec<Route>)> {
    let mut entries = Vec::with_capacity(1 + additional.len());
    let mut routes = Vec::new();
    let mut gateway_assigned = false;

    let primary_ranges = inventory.ranges_containing(primary)?;
    let subnet = select_subnet(&primary_ranges)
        .ok_or_else(|| no_network(primary))?;

    if primary.is_private() {
        let supernet = select_supernet(&primary_ranges, subnet)?;
        let gateways = inventory.gateway_for(primary)?;

        if let Some(supernet) = supernet {
            tracing::debug!(
                address = %primary,
                uplink = supernet.range_id,
                "Primary sits under a declared uplink network, adding segment route"
            );
            routes.push(Route {
                destination: SEGMENT_ROUTE_DESTINATION,
                netmask: SEGMENT_ROUTE_NETMASK,
                gateway: gateways.internal,
            });
        }

        let gateway = if gateway_assigned {
            None
        } else {
            gateway_assigned = true;
            Some(gateways.default)
        };
        entries.push(AddressEntry {
            address: primary,
            netmask: netmask_for(supernet.unwrap_or(subnet)),
            gateway,
        });
    } else {
        let gateway = claim_subnet_gateway(primary, subnet, &mut gateway_assigned)?;
        entries.push(AddressEntry {
            address: primary,
            netmask: netmask_for(subnet),
            gateway,
        });
    }

    for &address in additional {
        let ranges = inventory.ranges_containing(address)?;
        let subnet = select_subnet(&ranges).ok_or_else(|| no_network(address))?;

        let gateway = if address.is_private() {
            // Additional private addresses get a netmask from their own
            // subnet only: no gateway, no route.
            None
        } else {
            claim_subnet_gateway(address, subnet, &mut gateway_assigned)?
        };
        entries.push(AddressEntry {
            address,
            netmask: netmask_for(subnet),
            gateway,
        });
    }

    Ok((entries, routes))
}

fn no_network(address: Ipv4Addr) -> VmforgeError {
    VmforgeError::Network(format!("no network found for address {address}"))
}

fn claim_subnet_gateway(
    address: Ipv4Addr,
    subnet: &IpRange,
    gateway_assigned: &mut bool,
) -> VmforgeResult<Option<Ipv4Addr>> {
    if *gateway_assigned {
        return Ok(None);
    }
    let gateway = subnet.gateway.ok_or_else(|| {
        VmforgeError::Network(format!(
            "range {} containing {address} has no gateway",
            subnet.range_id
        ))
    })?;
    *gateway_assigned = true;
    Ok(Some(gateway))
}

/// Pick the subnet for an address: the first range the address is directly
/// allocated in, otherwise the most specific match by span (first minimal
/// entry on ties).
pub(super) fn select_subnet(ranges: &[IpRange]) -> Option<&IpRange> {
    ranges
        .iter()
        .find(|r| r.belongs_to.is_some())
        .or_else(|| ranges.iter().min_by_key(|r| r.span()))
}

/// Find the subnet's declared uplink network: a candidate without a direct
/// allocation whose id matches the subnet's parent pointer. More than one
/// matching candidate means the inventory violated its uniqueness invariant;
/// resolution fails rather than picking arbitrarily.
pub(super) fn select_supernet<'a>(
    ranges: &'a [IpRange],
    subnet: &IpRange,
) -> VmforgeResult<Option<&'a IpRange>> {
    let Some(parent_id) = subnet.belongs_to else {
        return Ok(None);
    };

    let mut candidates = ranges
        .iter()
        .filter(|r| r.belongs_to.is_none() && r.range_id == parent_id);

    let first = candidates.next();
    if candidates.next().is_some() {
        return Err(VmforgeError::Network(format!(
            "multiple uplink ranges share id {parent_id}"
        )));
    }
    Ok(first)
}

/// Netmask of a range: all-ones with the low `b` bits cleared, where `b` is
/// the smallest power-of-two host-bit count covering the range span.
pub(super) fn netmask_for(range: &IpRange) -> Ipv4Addr {
    let host_bits = (range.span() as u64).next_power_of_two().trailing_zeros();
    if host_bits >= 32 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(u32::MAX << host_bits)
    }
}
