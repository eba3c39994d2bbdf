//! RTMP learning, ageing, advertisement, and the ZIP query scheduler.

mod common;

use atrouter::dataplane::RouteState;
use atrouter::port::testing::SentDatagram;
use atrouter::protocol::rtmp::{
    build_data_packets, RtmpData, RtmpTuple, RTMP_DISTANCE_UNREACHABLE,
};
use atrouter::protocol::zip::{parse_query, ZIP_DDP_TYPE};
use atrouter::protocol::{Datagram, NetworkRange};
use atrouter::service::{RtmpSendingService, ZipSendingService};
use common::{as_dyn, two_port_router};
use std::collections::HashMap;
use std::time::Duration;

/// An RTMP data broadcast from neighbor (2, 100) on its non-extended
/// network, advertising the given (network, distance) tuples besides its
/// own network.
fn rtmp_data_from_neighbor(tuples: &[(u16, u8)]) -> Datagram {
    let mut all = vec![RtmpTuple {
        range: NetworkRange::single(2),
        distance: 0,
        extended: false,
    }];
    all.extend(tuples.iter().map(|&(network, distance)| RtmpTuple {
        range: NetworkRange::single(network),
        distance,
        extended: false,
    }));
    let mut packets =
        build_data_packets(2, 100, false, NetworkRange::single(2), &all).expect("packets");
    Datagram {
        hop_count: 0,
        destination_network: 0,
        source_network: 2,
        destination_node: 255,
        source_node: 100,
        destination_socket: 1,
        source_socket: 1,
        ddp_type: 1,
        data: packets.remove(0),
    }
}

#[tokio::test]
async fn test_rtmp_learns_remote_network() {
    let (router, _port_a, port_b) = two_port_router();

    router.inbound(rtmp_data_from_neighbor(&[(10, 0)]), &as_dyn(&port_b));

    let (entry, is_bad) = router.routing_table.lookup(10).expect("route to 10");
    assert_eq!(entry.distance, 1);
    assert_eq!(entry.next_network, 2);
    assert_eq!(entry.next_node, 100);
    assert!(!is_bad);

    // the query scheduler asks the next hop about the new network's zones
    let mut outstanding = HashMap::new();
    ZipSendingService::send_queries(&router, &mut outstanding, Duration::from_secs(10));
    let query_networks: Vec<u16> = port_b
        .drain()
        .into_iter()
        .filter_map(|sent| match sent {
            SentDatagram::Unicast {
                network: 2,
                node: 100,
                datagram,
            } if datagram.ddp_type == ZIP_DDP_TYPE => parse_query(&datagram.data).ok(),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(query_networks, vec![10]);
}

#[tokio::test]
async fn test_rtmp_does_not_flap_on_equal_distance() {
    let (router, _port_a, port_b) = two_port_router();

    router.inbound(rtmp_data_from_neighbor(&[(10, 0)]), &as_dyn(&port_b));
    // a different neighbor advertises the same network at the same
    // distance
    let mut other = rtmp_data_from_neighbor(&[(10, 0)]);
    // rewrite the advertising router's node in header and source
    other.source_node = 101;
    other.data[3] = 101;
    router.inbound(other, &as_dyn(&port_b));

    let (entry, _) = router.routing_table.lookup(10).expect("route to 10");
    assert_eq!(entry.next_node, 100);
}

#[tokio::test]
async fn test_route_ages_through_zombie_and_out() {
    let (router, port_a, port_b) = two_port_router();
    router.inbound(rtmp_data_from_neighbor(&[(10, 0)]), &as_dyn(&port_b));
    port_a.drain();
    port_b.drain();

    let state_of = |network: u16| {
        router
            .routing_table
            .entries()
            .into_iter()
            .find(|(entry, _)| entry.range.contains(network))
            .map(|(_, state)| state)
    };

    // 20 s: Suspect, still usable
    router.routing_table.age();
    assert_eq!(state_of(10), Some(RouteState::Suspect));
    assert!(!router.routing_table.lookup(10).unwrap().1);

    // 40 s: Bad
    router.routing_table.age();
    assert_eq!(state_of(10), Some(RouteState::Bad));
    assert!(router.routing_table.lookup(10).unwrap().1);

    // 60 s: Zombie, advertised as unreachable
    router.routing_table.age();
    assert_eq!(state_of(10), Some(RouteState::Zombie));
    RtmpSendingService::send_advertisements(&router);
    let advertised: Vec<(u16, u8)> = port_a
        .drain()
        .into_iter()
        .filter_map(|sent| match sent {
            SentDatagram::Broadcast(datagram) if datagram.ddp_type == 1 => {
                RtmpData::parse(&datagram.data, false).ok()
            }
            _ => None,
        })
        .flat_map(|data| {
            data.tuples
                .into_iter()
                .map(|tuple| (tuple.range.first, tuple.distance))
        })
        .collect();
    assert!(advertised.contains(&(10, RTMP_DISTANCE_UNREACHABLE)));

    // 80 s: gone
    router.routing_table.age();
    assert!(router.routing_table.lookup(10).is_none());
}

#[tokio::test]
async fn test_refresh_resets_ageing() {
    let (router, _port_a, port_b) = two_port_router();
    router.inbound(rtmp_data_from_neighbor(&[(10, 0)]), &as_dyn(&port_b));

    router.routing_table.age();
    router.routing_table.age();
    assert!(router.routing_table.lookup(10).unwrap().1);

    // the neighbor speaks again
    router.inbound(rtmp_data_from_neighbor(&[(10, 0)]), &as_dyn(&port_b));
    assert!(!router.routing_table.lookup(10).unwrap().1);
}

#[tokio::test]
async fn test_unreachable_advertisement_marks_route_bad() {
    let (router, _port_a, port_b) = two_port_router();
    router.inbound(rtmp_data_from_neighbor(&[(10, 0)]), &as_dyn(&port_b));
    assert!(!router.routing_table.lookup(10).unwrap().1);

    router.inbound(
        rtmp_data_from_neighbor(&[(10, RTMP_DISTANCE_UNREACHABLE)]),
        &as_dyn(&port_b),
    );
    assert!(router.routing_table.lookup(10).unwrap().1);
}

#[tokio::test]
async fn test_split_horizon_on_advertisements() {
    let (router, port_a, port_b) = two_port_router();
    router.inbound(rtmp_data_from_neighbor(&[(10, 0)]), &as_dyn(&port_b));
    port_a.drain();
    port_b.drain();

    RtmpSendingService::send_advertisements(&router);

    let advertised_networks = |sent: Vec<SentDatagram>| -> Vec<u16> {
        sent.into_iter()
            .filter_map(|item| match item {
                SentDatagram::Broadcast(datagram) if datagram.ddp_type == 1 => {
                    RtmpData::parse(&datagram.data, false).ok()
                }
                _ => None,
            })
            .flat_map(|data| data.tuples.into_iter().map(|tuple| tuple.range.first))
            .collect()
    };

    // port A hears everything
    let from_a = advertised_networks(port_a.drain());
    assert!(from_a.contains(&1));
    assert!(from_a.contains(&2));
    assert!(from_a.contains(&10));

    // port B carries the route to 10, so 10 is withheld from it; B's own
    // network is still advertised
    let from_b = advertised_networks(port_b.drain());
    assert!(from_b.contains(&1));
    assert!(from_b.contains(&2));
    assert!(!from_b.contains(&10));
}

#[tokio::test]
async fn test_rtmp_request_gets_short_response() {
    let (router, port_a, _port_b) = two_port_router();

    router.inbound(
        Datagram {
            hop_count: 0,
            destination_network: 1,
            source_network: 1,
            destination_node: 220,
            source_node: 5,
            destination_socket: 1,
            source_socket: 0xFD,
            ddp_type: 5,
            data: vec![1],
        },
        &as_dyn(&port_a),
    );

    let sent = port_a.drain();
    let [SentDatagram::Unicast { network, node, datagram }] = sent.as_slice() else {
        panic!("expected an RTMP response, got {:?}", sent);
    };
    assert_eq!((*network, *node), (1, 5));
    assert_eq!(datagram.ddp_type, 1);
    assert_eq!(datagram.destination_socket, 0xFD);
    // short form: our network, node ID length, our node
    assert_eq!(datagram.data, vec![0, 1, 8, 220]);
}
