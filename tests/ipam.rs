use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use microbox::{Error, Ipam};

mod common;

fn subnet(cidr: &str) -> Ipv4Network {
    cidr.parse().unwrap()
}

#[test]
fn acquire_scans_upward_from_the_network_address() {
    let dir = common::TempDir::new().unwrap();
    let ipam = Ipam::new(dir.join("ipam.redb"));
    let net = subnet("10.55.0.0/24");
    let bridge = Ipv4Addr::new(10, 55, 0, 1);
    let first = ipam.acquire(net, &[bridge]).unwrap();
    assert_eq!(first.addr, Ipv4Addr::new(10, 55, 0, 2));
    let second = ipam.acquire(net, &[bridge]).unwrap();
    assert_eq!(second.addr, Ipv4Addr::new(10, 55, 0, 3));
}

#[test]
fn release_frees_the_address_for_reuse() {
    let dir = common::TempDir::new().unwrap();
    let ipam = Ipam::new(dir.join("ipam.redb"));
    let net = subnet("10.56.0.0/24");
    let first = ipam.acquire(net, &[]).unwrap();
    ipam.release(&first).unwrap();
    let again = ipam.acquire(net, &[]).unwrap();
    assert_eq!(again.addr, first.addr);
}

#[test]
fn release_is_idempotent() {
    let dir = common::TempDir::new().unwrap();
    let ipam = Ipam::new(dir.join("ipam.redb"));
    let net = subnet("10.57.0.0/24");
    let lease = ipam.acquire(net, &[]).unwrap();
    ipam.release(&lease).unwrap();
    ipam.release(&lease).unwrap();
}

#[test]
fn releasing_from_an_untouched_subnet_is_a_no_op() {
    let dir = common::TempDir::new().unwrap();
    let ipam = Ipam::new(dir.join("ipam.redb"));
    let net = subnet("10.58.0.0/24");
    let lease = ipam.acquire(net, &[]).unwrap();
    // A lease for a bucket that was never created.
    let phantom = microbox::IpamLease {
        subnet: subnet("10.59.0.0/24"),
        addr: Ipv4Addr::new(10, 59, 0, 2),
    };
    ipam.release(&phantom).unwrap();
    ipam.release(&lease).unwrap();
}

#[test]
fn a_slash_30_with_the_bridge_reserved_has_one_address() {
    let dir = common::TempDir::new().unwrap();
    let ipam = Ipam::new(dir.join("ipam.redb"));
    // .0 network, .1 bridge, .3 broadcast: only .2 is allocatable.
    let net = subnet("10.66.0.0/30");
    let bridge = Ipv4Addr::new(10, 66, 0, 1);
    let only = ipam.acquire(net, &[bridge]).unwrap();
    assert_eq!(only.addr, Ipv4Addr::new(10, 66, 0, 2));
    let err = ipam.acquire(net, &[bridge]).unwrap_err();
    assert!(matches!(err, Error::IpamExhausted { .. }));
}

#[test]
fn buckets_are_per_subnet() {
    let dir = common::TempDir::new().unwrap();
    let ipam = Ipam::new(dir.join("ipam.redb"));
    let first = ipam.acquire(subnet("10.60.0.0/24"), &[]).unwrap();
    let second = ipam.acquire(subnet("10.61.0.0/24"), &[]).unwrap();
    assert_eq!(first.addr, Ipv4Addr::new(10, 60, 0, 1));
    assert_eq!(second.addr, Ipv4Addr::new(10, 61, 0, 1));
}
