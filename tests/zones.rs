//! ZIP end to end: reply ingestion, GetNetInfo, and the zone list
//! requests.

mod common;

use atrouter::port::testing::SentDatagram;
use atrouter::protocol::rtmp::{build_data_packets, RtmpTuple};
use atrouter::protocol::zip::{
    build_get_net_info, parse_reply, GetNetInfoReply, ATP_DDP_TYPE, ATP_FUNC_TREQ,
    GNI_FLAG_ONLY_ONE_ZONE, GNI_FLAG_USE_BROADCAST, GNI_FLAG_ZONE_INVALID,
    ZIP_ATP_FUNC_GETZONELIST, ZIP_DDP_TYPE, ZIP_FUNC_QUERY, ZIP_FUNC_REPLY,
};
use atrouter::protocol::{Datagram, NetworkRange, ZoneName};
use common::{as_dyn, two_port_router};

fn zone(name: &[u8]) -> ZoneName {
    ZoneName::new(name).unwrap()
}

/// Teach the router about network 10 via neighbor (2, 100) on port B.
fn learn_network_10(
    router: &std::sync::Arc<atrouter::dataplane::Router>,
    port_b: &std::sync::Arc<atrouter::port::testing::TestPort>,
) {
    let tuples = vec![
        RtmpTuple {
            range: NetworkRange::single(2),
            distance: 0,
            extended: false,
        },
        RtmpTuple {
            range: NetworkRange::single(10),
            distance: 0,
            extended: false,
        },
    ];
    let mut packets =
        build_data_packets(2, 100, false, NetworkRange::single(2), &tuples).unwrap();
    router.inbound(
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
        },
        &as_dyn(port_b),
    );
    port_b.drain();
}

#[tokio::test]
async fn test_zip_reply_populates_zone_table() {
    let (router, _port_a, port_b) = two_port_router();
    learn_network_10(&router, &port_b);

    // (2, 100) answers our query: network 10 is in zone Finance
    let mut data = vec![ZIP_FUNC_REPLY, 1];
    data.extend_from_slice(&10u16.to_be_bytes());
    data.push(7);
    data.extend_from_slice(b"Finance");
    router.inbound(
        Datagram {
            hop_count: 0,
            destination_network: 2,
            source_network: 2,
            destination_node: 221,
            source_node: 100,
            destination_socket: 6,
            source_socket: 6,
            ddp_type: ZIP_DDP_TYPE,
            data,
        },
        &as_dyn(&port_b),
    );

    let zones = router.zone_table.zones_in_range(NetworkRange::single(10));
    assert_eq!(zones, vec![zone(b"Finance")]);
    assert_eq!(
        router.zone_table.default_zone(NetworkRange::single(10)),
        Some(zone(b"Finance"))
    );
}

#[tokio::test]
async fn test_zip_query_answered_with_extended_reply() {
    let (router, port_a, _port_b) = two_port_router();
    router
        .zone_table
        .add_zone(zone(b"Twilight"), NetworkRange::single(1))
        .unwrap();

    // an end node asks which zones network 1 has
    let mut data = vec![ZIP_FUNC_QUERY, 1];
    data.extend_from_slice(&1u16.to_be_bytes());
    router.inbound(
        Datagram {
            hop_count: 0,
            destination_network: 1,
            source_network: 1,
            destination_node: 220,
            source_node: 5,
            destination_socket: 6,
            source_socket: 0xFD,
            ddp_type: ZIP_DDP_TYPE,
            data,
        },
        &as_dyn(&port_a),
    );

    let sent = port_a.drain();
    let [SentDatagram::Unicast { network, node, datagram }] = sent.as_slice() else {
        panic!("expected one ZIP reply, got {:?}", sent);
    };
    assert_eq!((*network, *node), (1, 5));
    let reply = parse_reply(&datagram.data).unwrap();
    assert!(reply.extended);
    assert_eq!(reply.count, 1);
    assert_eq!(reply.zones, vec![(1, b"Twilight".to_vec())]);
}

#[tokio::test]
async fn test_get_net_info() {
    let (router, port_a, _port_b) = two_port_router();
    router
        .zone_table
        .add_zone(zone(b"Twilight"), NetworkRange::single(1))
        .unwrap();

    // a startup-range node asks about its network naming a bogus zone
    router.inbound(
        Datagram {
            hop_count: 0,
            destination_network: 0,
            source_network: 0xFF00,
            destination_node: 255,
            source_node: 9,
            destination_socket: 6,
            source_socket: 6,
            ddp_type: ZIP_DDP_TYPE,
            data: build_get_net_info(b"Nowhere"),
        },
        &as_dyn(&port_a),
    );

    let sent = port_a.drain();
    let [SentDatagram::Unicast { network, node, datagram }] = sent.as_slice() else {
        panic!("expected a GetNetInfo reply, got {:?}", sent);
    };
    // answered straight out the ingress port to the startup address
    assert_eq!((*network, *node), (0xFF00, 9));
    let reply = GetNetInfoReply::parse(&datagram.data).unwrap();
    assert_ne!(reply.flags & GNI_FLAG_ZONE_INVALID, 0);
    assert_ne!(reply.flags & GNI_FLAG_ONLY_ONE_ZONE, 0);
    assert_ne!(reply.flags & GNI_FLAG_USE_BROADCAST, 0);
    assert_eq!(reply.range, NetworkRange::single(1));
    assert_eq!(reply.requested_zone, b"Nowhere");
    assert_eq!(reply.default_zone, Some(b"Twilight".to_vec()));
}

#[tokio::test]
async fn test_get_net_info_with_valid_zone() {
    let (router, port_a, _port_b) = two_port_router();
    router
        .zone_table
        .add_zone(zone(b"Twilight"), NetworkRange::single(1))
        .unwrap();

    router.inbound(
        Datagram {
            hop_count: 0,
            destination_network: 1,
            source_network: 1,
            destination_node: 255,
            source_node: 9,
            destination_socket: 6,
            source_socket: 6,
            ddp_type: ZIP_DDP_TYPE,
            data: build_get_net_info(b"TWILIGHT"),
        },
        &as_dyn(&port_a),
    );

    let sent = port_a.drain();
    let [SentDatagram::Unicast { datagram, .. }] = sent.as_slice() else {
        panic!("expected a GetNetInfo reply, got {:?}", sent);
    };
    let reply = GetNetInfoReply::parse(&datagram.data).unwrap();
    // case folds: TWILIGHT names Twilight
    assert_eq!(reply.flags & GNI_FLAG_ZONE_INVALID, 0);
    assert_eq!(reply.default_zone, None);
}

#[tokio::test]
async fn test_get_zone_list_enumerates_all_zones() {
    let (router, port_a, port_b) = two_port_router();
    learn_network_10(&router, &port_b);
    router
        .zone_table
        .add_zone(zone(b"Twilight"), NetworkRange::single(1))
        .unwrap();
    router
        .zone_table
        .add_zone(zone(b"Finance"), NetworkRange::single(10))
        .unwrap();

    // ATP TReq, transaction 0x1234, GetZoneList from index 1
    let mut data = vec![ATP_FUNC_TREQ, 1, 0x12, 0x34, ZIP_ATP_FUNC_GETZONELIST, 0];
    data.extend_from_slice(&1u16.to_be_bytes());
    router.inbound(
        Datagram {
            hop_count: 0,
            destination_network: 1,
            source_network: 1,
            destination_node: 220,
            source_node: 5,
            destination_socket: 6,
            source_socket: 0xFD,
            ddp_type: ATP_DDP_TYPE,
            data,
        },
        &as_dyn(&port_a),
    );

    let sent = port_a.drain();
    let [SentDatagram::Unicast { datagram, .. }] = sent.as_slice() else {
        panic!("expected a zone list, got {:?}", sent);
    };
    assert_eq!(datagram.ddp_type, ATP_DDP_TYPE);
    // user bytes: last flag set, two zones
    assert_eq!(datagram.data[4], 1);
    assert_eq!(u16::from_be_bytes([datagram.data[6], datagram.data[7]]), 2);
    let mut zones = Vec::new();
    let mut rest = &datagram.data[8..];
    while !rest.is_empty() {
        let length = rest[0] as usize;
        zones.push(rest[1..1 + length].to_vec());
        rest = &rest[1 + length..];
    }
    assert!(zones.contains(&b"Twilight".to_vec()));
    assert!(zones.contains(&b"Finance".to_vec()));
}

#[tokio::test]
async fn test_zones_leave_with_their_last_route() {
    let (router, _port_a, port_b) = two_port_router();
    learn_network_10(&router, &port_b);
    router
        .zone_table
        .add_zone(zone(b"Finance"), NetworkRange::single(10))
        .unwrap();

    // age the route all the way out; its zones go with it
    for _ in 0..4 {
        let removed = router.routing_table.age();
        for range in removed {
            router.zone_table.remove_networks(range);
        }
    }
    assert!(router.routing_table.lookup(10).is_none());
    assert!(!router
        .zone_table
        .has_zones_for(NetworkRange::single(10)));
}
